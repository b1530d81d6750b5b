//! Layer-2 proxy for IPv6 Neighbor Discovery between uplinks and guest
//! bridges.
//!
//! [`NdProxy`] holds the forwarding maps and decides, for each received
//! frame, what to send where and what to report to the manager. Socket I/O
//! lives in [`socket`], the helper process loop in [`daemon`].

pub mod daemon;
pub mod neighbor;
pub mod socket;

use guestnet_common::addr::MacAddress;
use guestnet_common::ndp::{
    is_guest_routable, neighbor_advert_target, parse_nd_frame, prefix_info_option,
    translate_nd_frame, FrameBuffer, IP_MAXPACKET, ND_NEIGHBOR_ADVERT, ND_NEIGHBOR_SOLICIT,
    ND_ROUTER_ADVERT, ND_ROUTER_SOLICIT,
};
use guestnet_common::net_util::generate_eui64_address;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv6Addr;
use tracing::{debug, info};

/// Host lookups the proxy needs while processing frames.
pub trait ProxyEnv {
    fn ifindex(&self, ifname: &str) -> Option<u32>;
    fn ifname(&self, ifindex: u32) -> Option<String>;
    fn local_mac(&self, ifindex: u32) -> Option<MacAddress>;
    /// Link-layer address of `addr` in the neighbor table of `ifindex`
    fn neighbor_mac(&self, ifindex: u32, addr: Ipv6Addr) -> Option<MacAddress>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub ifindex: u32,
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// A guest answered for a routable address on `ifname`
    GuestIp { ifname: String, addr: Ipv6Addr },
    /// Address for guest bridge `ifname` derived from an RA prefix
    RouterPrefix { ifname: String, addr: Ipv6Addr },
}

type IfMap = BTreeMap<u32, BTreeSet<u32>>;

pub struct NdProxy {
    /// guest -> uplinks
    rs: IfMap,
    /// uplink -> guests
    ra: IfMap,
    /// both directions, plus guest <-> guest on the same uplink
    ns_na: IfMap,
    in_buf: FrameBuffer,
    out_buf: FrameBuffer,
}

impl Default for NdProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl NdProxy {
    pub fn new() -> Self {
        Self {
            rs: IfMap::new(),
            ra: IfMap::new(),
            ns_na: IfMap::new(),
            in_buf: FrameBuffer::new(IP_MAXPACKET),
            out_buf: FrameBuffer::new(IP_MAXPACKET),
        }
    }

    fn map_for_type(&self, icmp_type: u8) -> Option<&IfMap> {
        match icmp_type {
            ND_ROUTER_SOLICIT => Some(&self.rs),
            ND_ROUTER_ADVERT => Some(&self.ra),
            ND_NEIGHBOR_SOLICIT | ND_NEIGHBOR_ADVERT => Some(&self.ns_na),
            _ => None,
        }
    }

    pub fn add_interface_pair(&mut self, physical: u32, guest: u32) {
        if physical == guest {
            return;
        }
        self.rs.entry(guest).or_default().insert(physical);
        let others: Vec<u32> = self
            .ra
            .get(&physical)
            .map(|g| g.iter().copied().filter(|&o| o != guest).collect())
            .unwrap_or_default();
        self.ra.entry(physical).or_default().insert(guest);
        self.ns_na.entry(physical).or_default().insert(guest);
        self.ns_na.entry(guest).or_default().insert(physical);
        for other in others {
            self.ns_na.entry(other).or_default().insert(guest);
            self.ns_na.entry(guest).or_default().insert(other);
        }
        info!("Proxying ND between {} and {}", physical, guest);
    }

    pub fn remove_interface_pair(&mut self, physical: u32, guest: u32) {
        self.rs.remove(&guest);
        self.ns_na.remove(&guest);
        if let Some(guests) = self.ra.get_mut(&physical) {
            guests.remove(&guest);
            for other in guests.iter() {
                if let Some(peers) = self.ns_na.get_mut(other) {
                    peers.remove(&guest);
                }
            }
        }
        if let Some(peers) = self.ns_na.get_mut(&physical) {
            peers.remove(&guest);
        }
        info!("Stopped proxying ND between {} and {}", physical, guest);
    }

    /// Drop every pairing of uplink `ifindex`.
    pub fn remove_interface(&mut self, ifindex: u32) {
        for guest in self.ra.remove(&ifindex).unwrap_or_default() {
            self.rs.remove(&guest);
            self.ns_na.remove(&guest);
        }
        self.rs.remove(&ifindex);
        self.ns_na.remove(&ifindex);
        for peers in self.ns_na.values_mut() {
            peers.remove(&ifindex);
        }
    }

    pub fn guest_interfaces(&self, physical: u32) -> Vec<u32> {
        self.ra
            .get(&physical)
            .map(|g| g.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_guest_interface(&self, ifindex: u32) -> bool {
        self.rs.contains_key(&ifindex)
    }

    pub fn is_router_interface(&self, ifindex: u32) -> bool {
        self.ra.contains_key(&ifindex)
    }

    /// Handle one frame received on `ifindex`.
    pub fn process_frame(
        &mut self,
        ifindex: u32,
        frame: &[u8],
        env: &dyn ProxyEnv,
    ) -> (Vec<OutgoingFrame>, Vec<Discovery>) {
        let mut out = Vec::new();
        let mut discoveries = Vec::new();

        let Some(info) = parse_nd_frame(frame) else {
            return (out, discoveries);
        };
        if frame.len() > self.in_buf.len() {
            return (out, discoveries);
        }

        if info.icmp_type == ND_NEIGHBOR_ADVERT && self.is_guest_interface(ifindex) {
            if let (Some(target), Some(ifname)) = (neighbor_advert_target(frame), env.ifname(ifindex)) {
                if is_guest_routable(target) {
                    discoveries.push(Discovery::GuestIp { ifname, addr: target });
                }
            }
        }

        if info.icmp_type == ND_ROUTER_ADVERT && self.is_router_interface(ifindex) {
            if let Some(pi) = prefix_info_option(frame).filter(|pi| pi.prefix_len <= 64) {
                for guest in self.guest_interfaces(ifindex) {
                    let (Some(mac), Some(ifname)) = (env.local_mac(guest), env.ifname(guest)) else {
                        continue;
                    };
                    discoveries.push(Discovery::RouterPrefix {
                        ifname,
                        addr: generate_eui64_address(pi.prefix, mac),
                    });
                }
            }
        }

        let targets: Vec<u32> = self
            .map_for_type(info.icmp_type)
            .and_then(|m| m.get(&ifindex))
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default();
        if targets.is_empty() {
            return (out, discoveries);
        }

        let input = &mut self.in_buf.as_mut_slice()[..frame.len()];
        input.copy_from_slice(frame);
        let input = &self.in_buf.as_slice()[..frame.len()];

        for target in targets {
            let Some(local_mac) = env.local_mac(target) else {
                continue;
            };
            match translate_nd_frame(
                input,
                local_mac,
                |dst| env.neighbor_mac(target, dst),
                self.out_buf.as_mut_slice(),
            ) {
                Ok(len) => out.push(OutgoingFrame {
                    ifindex: target,
                    frame: self.out_buf.as_slice()[..len].to_vec(),
                }),
                Err(e) => debug!("Dropping ND frame from {}: {}", ifindex, e),
            }
        }
        (out, discoveries)
    }
}
