//! Client-owned network namespaces wired to the host on request.
//!
//! Each connection is tied to a file descriptor handed over by the client.
//! The service keeps a duplicate of it in an epoll set and tears the wiring
//! down once the client side hangs up.

use crate::datapath::{Datapath, Ipv4Route};
use crate::shill::ShillClient;
use anyhow::Context;
use guestnet_common::addr::{AddressManager, GuestClass, Subnet};
use guestnet_common::{Error, Result};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::{error, info, warn};

/// How often client descriptors are sampled for hangup
pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);

const MAX_EVENTS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectNamespaceRequest {
    /// Any process living in the client namespace
    pub pid: i32,
    /// Empty when the client did not pin an uplink
    pub outbound_ifname: String,
    pub route_on_vpn: bool,
}

/// Wiring handed back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedNamespaceInfo {
    pub pid: i32,
    pub netns_name: String,
    pub outbound_ifname: String,
    pub route_on_vpn: bool,
    pub host_ifname: String,
    pub client_ifname: String,
    pub host_ipv4: Ipv4Addr,
    pub peer_ipv4: Ipv4Addr,
    pub subnet: (Ipv4Addr, u8),
}

impl fmt::Display for ConnectedNamespaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{pid: {}, netns: {}, host: {} ({}), client: {} ({}), subnet: {}/{}",
            self.pid,
            self.netns_name,
            self.host_ifname,
            self.host_ipv4,
            self.client_ifname,
            self.peer_ipv4,
            self.subnet.0,
            self.subnet.1
        )?;
        if !self.outbound_ifname.is_empty() {
            write!(f, ", outbound: {}", self.outbound_ifname)?;
        }
        write!(f, ", route_on_vpn: {}}}", self.route_on_vpn)
    }
}

struct Entry {
    info: ConnectedNamespaceInfo,
    /// Our duplicate of the client descriptor
    fd: OwnedFd,
    subnet: Subnet,
}

impl Entry {
    fn host_route(&self) -> Ipv4Route {
        Ipv4Route::dev(
            &self.info.host_ifname,
            self.subnet.base_address(),
            self.subnet.prefix_length(),
        )
    }
}

pub struct ConnectedNamespaces {
    epoll: Epoll,
    next_id: u32,
    entries: BTreeMap<RawFd, Entry>,
}

impl ConnectedNamespaces {
    pub fn new() -> anyhow::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("Failed to create epoll instance")?;
        Ok(Self {
            epoll,
            next_id: 0,
            entries: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn infos(&self) -> impl Iterator<Item = &ConnectedNamespaceInfo> {
        self.entries.values().map(|e| &e.info)
    }

    fn validate(
        datapath: &Datapath,
        shill: &ShillClient,
        client_fd: Option<BorrowedFd<'_>>,
        req: &ConnectNamespaceRequest,
    ) -> Result<()> {
        let mut problems = Vec::new();
        if client_fd.is_none() {
            problems.push("invalid file descriptor".to_string());
        }
        if req.pid <= 0 || !datapath.kernel().has_netns(req.pid) {
            problems.push(format!("invalid namespace pid {}", req.pid));
        }
        if !req.outbound_ifname.is_empty() && !shill.has_device(&req.outbound_ifname) {
            problems.push(format!("invalid outbound ifname {}", req.outbound_ifname));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(problems.join(", ")))
        }
    }

    /// Wire the network namespace of `req.pid` to the host.
    ///
    /// Every step is unwound if a later one fails.
    #[tracing::instrument(name = "connected_ns.connect", skip(self, datapath, addrs, shill, client_fd), fields(pid = req.pid))]
    pub fn connect(
        &mut self,
        datapath: &Datapath,
        addrs: &mut AddressManager,
        shill: &ShillClient,
        client_fd: Option<BorrowedFd<'_>>,
        req: &ConnectNamespaceRequest,
    ) -> Result<ConnectedNamespaceInfo> {
        Self::validate(datapath, shill, client_fd, req)?;
        let Some(client_fd) = client_fd else {
            return Err(Error::InvalidArgument("invalid file descriptor".to_string()));
        };

        let subnet = addrs.allocate_ipv4_subnet(GuestClass::MinijailNetns, None)?;
        let (Some(host_ipv4), Some(peer_ipv4)) = (subnet.address_at_offset(0), subnet.address_at_offset(1)) else {
            return Err(Error::SubnetExhausted(format!(
                "subnet {} has no room for host and client",
                subnet.cidr_string()
            )));
        };
        let prefix_len = subnet.prefix_length();

        let id = self.next_id;
        let info = ConnectedNamespaceInfo {
            pid: req.pid,
            netns_name: format!("connected_netns_{id}"),
            outbound_ifname: req.outbound_ifname.clone(),
            route_on_vpn: req.route_on_vpn,
            host_ifname: format!("arc_ns{id}"),
            client_ifname: format!("veth{id}"),
            host_ipv4,
            peer_ipv4,
            subnet: (subnet.base_address(), prefix_len),
        };

        datapath
            .netns_attach(&info.netns_name, req.pid)
            .map_err(|e| Error::namespace(&e))?;

        let links = datapath
            .connect_veth_pair(
                &info.netns_name,
                &info.host_ifname,
                &info.client_ifname,
                addrs.generate_mac_address(),
                peer_ipv4,
                prefix_len,
                false,
            )
            .and_then(|()| {
                datapath.configure_interface(
                    None,
                    &info.host_ifname,
                    addrs.generate_mac_address(),
                    host_ipv4,
                    prefix_len,
                    true,
                    false,
                )
            })
            .and_then(|()| datapath.add_default_route_in_netns(&info.netns_name, host_ipv4));
        if let Err(e) = links {
            error!("Failed to wire namespace of pid {}: {:#}", req.pid, e);
            datapath.remove_interface(&info.host_ifname);
            datapath.netns_delete(&info.netns_name);
            return Err(Error::interface(&e));
        }

        let host_route = Ipv4Route::dev(&info.host_ifname, subnet.base_address(), prefix_len);
        if let Err(e) = datapath.add_ipv4_route(&host_route) {
            error!("Failed to route {} to {}: {:#}", subnet, info.host_ifname, e);
            datapath.remove_interface(&info.host_ifname);
            datapath.netns_delete(&info.netns_name);
            return Err(Error::interface(&e));
        }

        let rules = datapath.add_outbound_ipv4(&info.host_ifname).and_then(|()| {
            datapath.add_outbound_ipv4_snat_mark(&info.host_ifname).inspect_err(|_| {
                datapath.remove_outbound_ipv4(&info.host_ifname);
            })
        });
        if let Err(e) = rules {
            error!("Failed to allow traffic from {}: {:#}", info.host_ifname, e);
            datapath.remove_interface(&info.host_ifname);
            datapath.delete_ipv4_route(&host_route);
            datapath.netns_delete(&info.netns_name);
            return Err(Error::packet_filter(&e));
        }

        let fd = match self.watch(client_fd) {
            Ok(fd) => fd,
            Err(e) => {
                error!("Failed to watch client descriptor: {:#}", e);
                datapath.remove_interface(&info.host_ifname);
                datapath.delete_ipv4_route(&host_route);
                datapath.remove_outbound_ipv4(&info.host_ifname);
                datapath.remove_outbound_ipv4_snat_mark(&info.host_ifname);
                datapath.netns_delete(&info.netns_name);
                return Err(Error::interface(&e));
            }
        };
        let entry = Entry { info, fd, subnet };

        self.next_id += 1;
        info!("Connected network namespace {}", entry.info);
        let info = entry.info.clone();
        self.entries.insert(entry.fd.as_raw_fd(), entry);
        Ok(info)
    }

    /// Duplicate the client descriptor and add the copy to the epoll set.
    fn watch(&self, client_fd: BorrowedFd<'_>) -> anyhow::Result<OwnedFd> {
        let fd = client_fd
            .try_clone_to_owned()
            .context("Failed to duplicate client descriptor")?;
        let key = u64::try_from(fd.as_raw_fd()).context("Negative descriptor")?;
        // Hangup and error are always reported
        self.epoll
            .add(&fd, EpollEvent::new(EpollFlags::EPOLLIN, key))
            .context("Failed to add client descriptor to epoll")?;
        Ok(fd)
    }

    #[tracing::instrument(name = "connected_ns.disconnect", skip(self, datapath))]
    pub fn disconnect(&mut self, datapath: &Datapath, key: RawFd) {
        let Some(entry) = self.entries.remove(&key) else {
            warn!("No connected namespace for descriptor {}", key);
            return;
        };
        if let Err(e) = self.epoll.delete(&entry.fd) {
            warn!("Failed to remove descriptor {} from epoll: {}", key, e);
        }

        // The default route inside the client namespace is left to the
        // client, which owns the namespace.
        let host_ifname = &entry.info.host_ifname;
        datapath.remove_interface(host_ifname);
        datapath.remove_outbound_ipv4(host_ifname);
        datapath.remove_outbound_ipv4_snat_mark(host_ifname);
        datapath.delete_ipv4_route(&entry.host_route());
        datapath.netns_delete(&entry.info.netns_name);

        info!("Disconnected network namespace {}", entry.info);
        // Dropping the entry closes our descriptor and frees the subnet
    }

    /// Tear down every connection whose client hung up. Never blocks.
    pub fn check_liveness(&mut self, datapath: &Datapath) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let ready = match self.epoll.wait(&mut events, EpollTimeout::ZERO) {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to poll connected namespace clients: {}", e);
                return 0;
            }
        };

        let hung_up: Vec<RawFd> = events[..ready]
            .iter()
            .filter(|ev| ev.events().intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR))
            .filter_map(|ev| RawFd::try_from(ev.data()).ok())
            .collect();
        for key in &hung_up {
            self.disconnect(datapath, *key);
        }
        hung_up.len()
    }

    pub fn disconnect_all(&mut self, datapath: &Datapath) {
        let keys: Vec<RawFd> = self.entries.keys().copied().collect();
        for key in keys {
            self.disconnect(datapath, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::testing::FakeHost;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    const PID: i32 = 5000;

    fn request() -> ConnectNamespaceRequest {
        ConnectNamespaceRequest {
            pid: PID,
            ..Default::default()
        }
    }

    struct Fixture {
        host: FakeHost,
        datapath: Datapath,
        addrs: AddressManager,
        shill: ShillClient,
        svc: ConnectedNamespaces,
    }

    impl Fixture {
        fn new() -> Self {
            let host = FakeHost::new();
            host.add_pid(PID);
            let datapath = host.datapath();
            Self {
                host,
                datapath,
                addrs: AddressManager::new(),
                shill: ShillClient::new(),
                svc: ConnectedNamespaces::new().unwrap(),
            }
        }

        fn connect(&mut self, fd: BorrowedFd<'_>) -> Result<ConnectedNamespaceInfo> {
            self.svc
                .connect(&self.datapath, &mut self.addrs, &self.shill, Some(fd), &request())
        }
    }

    #[test]
    fn test_connect_wires_namespace() {
        let mut fx = Fixture::new();
        let (client, _peer) = UnixStream::pair().unwrap();

        let info = fx.connect(client.as_fd()).unwrap();
        assert_eq!(info.host_ifname, "arc_ns0");
        assert_eq!(info.client_ifname, "veth0");
        assert_eq!(info.netns_name, "connected_netns_0");
        assert_eq!(info.host_ipv4, Ipv4Addr::new(100, 115, 92, 129));
        assert_eq!(info.peer_ipv4, Ipv4Addr::new(100, 115, 92, 130));
        assert_eq!(info.subnet, (Ipv4Addr::new(100, 115, 92, 128), 30));

        let host_link = fx.host.link("arc_ns0").unwrap();
        assert!(host_link.up);
        assert!(host_link.addrs.contains("100.115.92.129/30"));
        let client_link = fx.host.link_in("connected_netns_0", "veth0").unwrap();
        assert!(client_link.up);
        assert!(client_link.addrs.contains("100.115.92.130/30"));

        assert!(fx.host.has_route("connected_netns_0:default via 100.115.92.129"));
        assert!(fx.host.has_route("100.115.92.128/30 dev arc_ns0"));
        assert!(fx.host.has_rule("iptables -t filter FORWARD -o arc_ns0 -j ACCEPT"));
        assert!(fx
            .host
            .has_rule("iptables -t mangle PREROUTING -i arc_ns0 -j MARK --set-mark 1/1"));
        assert_eq!(fx.svc.len(), 1);
        assert_eq!(fx.addrs.available(GuestClass::MinijailNetns), 7);
    }

    #[test]
    fn test_second_connection_gets_next_names() {
        let mut fx = Fixture::new();
        let (a, _pa) = UnixStream::pair().unwrap();
        let (b, _pb) = UnixStream::pair().unwrap();
        fx.connect(a.as_fd()).unwrap();
        fx.host.add_pid(PID + 1);
        let info = fx
            .svc
            .connect(
                &fx.datapath,
                &mut fx.addrs,
                &fx.shill,
                Some(b.as_fd()),
                &ConnectNamespaceRequest {
                    pid: PID + 1,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(info.host_ifname, "arc_ns1");
        assert_eq!(info.host_ipv4, Ipv4Addr::new(100, 115, 92, 133));
    }

    #[test]
    fn test_hangup_tears_down() {
        let mut fx = Fixture::new();
        let before = fx.host.topology();
        let (client, peer) = UnixStream::pair().unwrap();
        fx.connect(client.as_fd()).unwrap();

        assert_eq!(fx.svc.check_liveness(&fx.datapath), 0);
        assert_eq!(fx.svc.len(), 1);

        drop(client);
        drop(peer);
        assert_eq!(fx.svc.check_liveness(&fx.datapath), 1);
        assert!(fx.svc.is_empty());
        assert!(fx.host.link("arc_ns0").is_none());
        assert_eq!(fx.addrs.available(GuestClass::MinijailNetns), 8);

        let mut after = fx.host.topology();
        // Left to the client, which owns the namespace
        assert!(after.routes.remove("connected_netns_0:default via 100.115.92.129"));
        assert_eq!(after, before);
    }

    #[test]
    fn test_invalid_requests_rejected() {
        let mut fx = Fixture::new();
        let (client, _peer) = UnixStream::pair().unwrap();

        let err = fx
            .svc
            .connect(&fx.datapath, &mut fx.addrs, &fx.shill, None, &request())
            .unwrap_err();
        assert_eq!(err.kind(), guestnet_common::ErrorKind::InvalidArgument);

        let err = fx
            .svc
            .connect(
                &fx.datapath,
                &mut fx.addrs,
                &fx.shill,
                Some(client.as_fd()),
                &ConnectNamespaceRequest {
                    pid: 4242,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), guestnet_common::ErrorKind::InvalidArgument);

        let err = fx
            .svc
            .connect(
                &fx.datapath,
                &mut fx.addrs,
                &fx.shill,
                Some(client.as_fd()),
                &ConnectNamespaceRequest {
                    pid: PID,
                    outbound_ifname: "eth7".to_string(),
                    route_on_vpn: false,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), guestnet_common::ErrorKind::InvalidArgument);
        assert!(fx.host.commands().is_empty());
    }

    #[test]
    fn test_failed_connect_unwinds() {
        let mut fx = Fixture::new();
        let before = fx.host.topology();
        let (client, _peer) = UnixStream::pair().unwrap();

        fx.host.fail_on("-o arc_ns0 -j ACCEPT");
        let err = fx.connect(client.as_fd()).unwrap_err();
        assert_eq!(err.kind(), guestnet_common::ErrorKind::PacketFilterFailed);
        // Left to the client, which owns the namespace
        let client_route = "connected_netns_0:default via 100.115.92.129";
        let mut after = fx.host.topology();
        assert!(after.routes.remove(client_route));
        assert_eq!(after, before);
        assert_eq!(fx.addrs.available(GuestClass::MinijailNetns), 8);

        fx.host.clear_failures();
        fx.host.fail_on("route add default");
        let err = fx.connect(client.as_fd()).unwrap_err();
        assert_eq!(err.kind(), guestnet_common::ErrorKind::InterfaceSetupFailed);
        let mut after = fx.host.topology();
        after.routes.remove(client_route);
        assert_eq!(after, before);
        assert!(fx.svc.is_empty());
    }

    #[test]
    fn test_namespace_attach_failure() {
        let mut fx = Fixture::new();
        let (client, _peer) = UnixStream::pair().unwrap();
        fx.host.fail_on("netns attach");
        let err = fx.connect(client.as_fd()).unwrap_err();
        assert_eq!(err.kind(), guestnet_common::ErrorKind::NamespaceSetupFailed);
        assert!(fx.host.link("arc_ns0").is_none());
    }

    #[test]
    fn test_disconnect_all() {
        let mut fx = Fixture::new();
        let (a, _pa) = UnixStream::pair().unwrap();
        fx.connect(a.as_fd()).unwrap();
        fx.svc.disconnect_all(&fx.datapath);
        assert!(fx.svc.is_empty());
        assert!(fx.host.rules().is_empty());
    }
}
