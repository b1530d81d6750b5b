//! ND proxy helper process.
//!
//! Reads [`DeviceMessage`]s from the control socket inherited from the
//! manager, proxies ND frames between the paired interfaces and reports
//! discovered guest addresses back as [`NdProxyMessage`]s. Exits when the
//! control socket closes.

use super::neighbor::{self, NeighborTable};
use super::socket::{ifindex_to_name, name_to_ifindex, NdSocket};
use super::{Discovery, NdProxy, OutgoingFrame, ProxyEnv};
use crate::datapath::kernel::{LinuxKernel, NetKernel};
use anyhow::{Context, Result};
use guestnet_common::addr::MacAddress;
use guestnet_common::ipc::ip_helper_message::Payload;
use guestnet_common::ipc::{read_message, write_message, DeviceMessage, NdProxyEvent, NdProxyMessage};
use guestnet_common::ndp::IP_MAXPACKET;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv6Addr;
use std::os::fd::OwnedFd;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Pair {
    physical: String,
    physical_index: u32,
    guest_index: u32,
}

/// Pairing bookkeeping by name on top of [`NdProxy`].
#[derive(Default)]
pub struct ProxyState {
    proxy: NdProxy,
    /// keyed by guest interface name
    pairs: BTreeMap<String, Pair>,
    /// address last announced for each guest bridge
    guest_addrs: HashMap<String, Ipv6Addr>,
}

impl ProxyState {
    pub fn new() -> Self {
        Self::default()
    }

    fn unpair(&mut self, guest: &str) -> Option<NdProxyMessage> {
        let pair = self.pairs.remove(guest)?;
        self.proxy.remove_interface_pair(pair.physical_index, pair.guest_index);
        self.guest_addrs
            .remove(guest)
            .map(|addr| NdProxyMessage::new(NdProxyEvent::DeleteAddress, guest, addr))
    }

    pub fn on_device_message(&mut self, msg: &DeviceMessage, env: &dyn ProxyEnv) -> Vec<NdProxyMessage> {
        let mut out = Vec::new();
        if msg.teardown {
            if msg.br_ifname.is_empty() {
                let guests: Vec<String> = self
                    .pairs
                    .iter()
                    .filter(|(_, p)| p.physical == msg.dev_ifname)
                    .map(|(g, _)| g.clone())
                    .collect();
                let physical_index = guests.first().and_then(|g| self.pairs.get(g)).map(|p| p.physical_index);
                out.extend(guests.iter().filter_map(|g| self.unpair(g)));
                if let Some(index) = physical_index.or_else(|| env.ifindex(&msg.dev_ifname)) {
                    self.proxy.remove_interface(index);
                }
                info!("Stopped proxying ND on {}", msg.dev_ifname);
            } else {
                out.extend(self.unpair(&msg.br_ifname));
            }
            return out;
        }

        let (Some(physical_index), Some(guest_index)) = (env.ifindex(&msg.dev_ifname), env.ifindex(&msg.br_ifname)) else {
            warn!(
                "Cannot proxy ND between {} and {}: interface not found",
                msg.dev_ifname, msg.br_ifname
            );
            return out;
        };
        if let Some(old) = self.pairs.get(&msg.br_ifname) {
            if old.physical != msg.dev_ifname {
                out.extend(self.unpair(&msg.br_ifname));
            }
        }
        self.proxy.add_interface_pair(physical_index, guest_index);
        self.pairs.insert(
            msg.br_ifname.clone(),
            Pair {
                physical: msg.dev_ifname.clone(),
                physical_index,
                guest_index,
            },
        );
        out
    }

    pub fn on_frame(&mut self, ifindex: u32, frame: &[u8], env: &dyn ProxyEnv) -> (Vec<OutgoingFrame>, Vec<NdProxyMessage>) {
        let (frames, discoveries) = self.proxy.process_frame(ifindex, frame, env);
        let mut msgs = Vec::new();
        for discovery in discoveries {
            match discovery {
                Discovery::GuestIp { ifname, addr } => {
                    msgs.push(NdProxyMessage::new(NdProxyEvent::AddRoute, &ifname, addr));
                }
                Discovery::RouterPrefix { ifname, addr } => {
                    match self.guest_addrs.insert(ifname.clone(), addr) {
                        Some(old) if old == addr => continue,
                        Some(old) => msgs.push(NdProxyMessage::new(NdProxyEvent::DeleteAddress, &ifname, old)),
                        None => {}
                    }
                    msgs.push(NdProxyMessage::new(NdProxyEvent::AddAddress, &ifname, addr));
                }
            }
        }
        (frames, msgs)
    }
}

/// Host-backed lookups with a neighbor table sampled for the current frame.
#[derive(Default)]
struct HostEnv {
    neighbors: NeighborTable,
}

impl ProxyEnv for HostEnv {
    fn ifindex(&self, ifname: &str) -> Option<u32> {
        name_to_ifindex(ifname)
    }

    fn ifname(&self, ifindex: u32) -> Option<String> {
        ifindex_to_name(ifindex)
    }

    fn local_mac(&self, ifindex: u32) -> Option<MacAddress> {
        let ifname = ifindex_to_name(ifindex)?;
        LinuxKernel.interface_mac(&ifname).ok()
    }

    fn neighbor_mac(&self, ifindex: u32, addr: Ipv6Addr) -> Option<MacAddress> {
        self.neighbors.get(&(ifindex, addr)).copied()
    }
}

fn has_unicast_destination(frame: &[u8]) -> bool {
    frame.len() >= 6 && frame[0] & 0x01 == 0
}

fn is_broadcast_destination(frame: &[u8]) -> bool {
    frame.len() >= 6 && frame[..6].iter().all(|&b| b == 0xff)
}

#[tracing::instrument(name = "ndproxy.run", skip(control))]
pub async fn run(control: OwnedFd) -> Result<()> {
    let stream = std::os::unix::net::UnixStream::from(control);
    stream
        .set_nonblocking(true)
        .context("Failed to make control socket non-blocking")?;
    let stream = tokio::net::UnixStream::from_std(stream).context("Failed to register control socket")?;
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::channel(32);
    tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(Some(msg)) => {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Control socket failed: {:#}", e);
                    break;
                }
            }
        }
    });

    let socket = NdSocket::open().context("Failed to open ND packet socket")?;
    let (connection, handle, _) = rtnetlink::new_connection().context("Failed to open rtnetlink socket")?;
    tokio::spawn(connection);

    let mut state = ProxyState::new();
    let mut buf = vec![0u8; IP_MAXPACKET];
    info!("ND proxy started");

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    info!("Control socket closed, exiting");
                    return Ok(());
                };
                match msg.payload {
                    Some(Payload::Device(dev)) => {
                        for reply in state.on_device_message(&dev, &HostEnv::default()) {
                            write_message(&mut writer, &reply.into()).await?;
                        }
                    }
                    other => debug!("Ignoring control message {:?}", other),
                }
            }
            res = socket.recv(&mut buf) => {
                let (len, ifindex) = res.context("Failed to receive ND frame")?;
                let frame = &buf[..len];
                let mut env = HostEnv::default();
                if has_unicast_destination(frame) || is_broadcast_destination(frame) {
                    match neighbor::dump(&handle).await {
                        Ok(table) => env.neighbors = table,
                        Err(e) => warn!("Neighbor lookup failed: {:#}", e),
                    }
                }
                let (frames, msgs) = state.on_frame(ifindex, frame, &env);
                for out in frames {
                    if let Err(e) = socket.send(out.ifindex, &out.frame).await {
                        warn!("Failed to send ND frame on {}: {}", out.ifindex, e);
                    }
                }
                for msg in msgs {
                    write_message(&mut writer, &msg.into()).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndproxy::tests::{ra_with_prefix, TestEnv, ARC_ETH0, ETH0, VMTAP0};
    use guestnet_common::net_util::generate_eui64_address;

    fn device(dev: &str, br: &str, teardown: bool) -> DeviceMessage {
        DeviceMessage {
            dev_ifname: dev.to_string(),
            br_ifname: br.to_string(),
            teardown,
        }
    }

    #[test]
    fn test_prefix_announced_once() {
        let env = TestEnv::with_links();
        let mut state = ProxyState::new();
        assert!(state.on_device_message(&device("eth0", "arc_eth0", false), &env).is_empty());

        let (frames, msgs) = state.on_frame(ETH0, &ra_with_prefix("2001:db8::", 64), &env);
        assert_eq!(frames.len(), 1);
        let expected = generate_eui64_address("2001:db8::".parse().unwrap(), env.macs[&ARC_ETH0]);
        assert_eq!(msgs, vec![NdProxyMessage::new(NdProxyEvent::AddAddress, "arc_eth0", expected)]);

        // Same prefix again is not re-announced
        let (_, msgs) = state.on_frame(ETH0, &ra_with_prefix("2001:db8::", 64), &env);
        assert!(msgs.is_empty());

        // A new prefix replaces the old address
        let (_, msgs) = state.on_frame(ETH0, &ra_with_prefix("2001:db8:1::", 64), &env);
        let renewed = generate_eui64_address("2001:db8:1::".parse().unwrap(), env.macs[&ARC_ETH0]);
        assert_eq!(
            msgs,
            vec![
                NdProxyMessage::new(NdProxyEvent::DeleteAddress, "arc_eth0", expected),
                NdProxyMessage::new(NdProxyEvent::AddAddress, "arc_eth0", renewed),
            ]
        );
    }

    #[test]
    fn test_teardown_pair_deletes_address() {
        let env = TestEnv::with_links();
        let mut state = ProxyState::new();
        state.on_device_message(&device("eth0", "arc_eth0", false), &env);
        state.on_frame(ETH0, &ra_with_prefix("2001:db8::", 64), &env);

        let msgs = state.on_device_message(&device("eth0", "arc_eth0", true), &env);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].event(), NdProxyEvent::DeleteAddress);
        assert_eq!(msgs[0].ifname, "arc_eth0");

        let (frames, msgs) = state.on_frame(ETH0, &ra_with_prefix("2001:db8::", 64), &env);
        assert!(frames.is_empty());
        assert!(msgs.is_empty());
    }

    #[test]
    fn test_teardown_device_removes_all_guests() {
        let env = TestEnv::with_links();
        let mut state = ProxyState::new();
        state.on_device_message(&device("eth0", "arc_eth0", false), &env);
        state.on_device_message(&device("eth0", "vmtap0", false), &env);
        let (frames, msgs) = state.on_frame(ETH0, &ra_with_prefix("2001:db8::", 64), &env);
        assert_eq!(frames.len(), 2);
        assert_eq!(msgs.len(), 2);

        let msgs = state.on_device_message(&device("eth0", "", true), &env);
        let mut ifnames: Vec<_> = msgs.iter().map(|m| m.ifname.as_str()).collect();
        ifnames.sort_unstable();
        assert_eq!(ifnames, vec!["arc_eth0", "vmtap0"]);
        assert!(!state.proxy.is_router_interface(ETH0));
        assert!(!state.proxy.is_guest_interface(VMTAP0));
    }

    #[test]
    fn test_unknown_interface_ignored() {
        let env = TestEnv::with_links();
        let mut state = ProxyState::new();
        assert!(state.on_device_message(&device("eth9", "arc_eth9", false), &env).is_empty());
        assert!(state.pairs.is_empty());
    }

    #[test]
    fn test_destination_classification() {
        assert!(has_unicast_destination(&[0x02, 0, 0, 0, 0, 1]));
        assert!(!has_unicast_destination(&[0x33, 0x33, 0, 0, 0, 1]));
        assert!(is_broadcast_destination(&[0xff; 6]));
        assert!(!has_unicast_destination(&[0x02]));
    }
}
