pub mod filter;
pub mod kernel;
pub mod runner;
#[cfg(test)]
pub mod testing;

pub use filter::{IpFamily, IptablesFilter, PacketFilter};
pub use kernel::{Ipv4Route, LinuxKernel, NetKernel, RouteOp, TapRequest};
pub use runner::{CommandRunner, ProcessRunner};

use anyhow::{Context, Result};
use guestnet_common::addr::MacAddress;
use guestnet_common::fwmark::{TrafficSource, GUEST_TRAFFIC_MARK, GUEST_TRAFFIC_MASK};
use guestnet_common::net_util::{ipv4_broadcast, ipv4_cidr};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{info, warn};

/// Guest-side address the ADB daemon listens on inside Android
const ARC_ADB_ADDR: Ipv4Addr = Ipv4Addr::new(100, 115, 92, 2);
const ARC_ADB_PORT: u16 = 5555;
/// Port the ADB proxy listens on in the host
pub const ADB_PROXY_PORT: u16 = 5550;

/// A single packet-filter rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub family: IpFamily,
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: String,
    /// Insert at the head of the chain rather than append
    pub head: bool,
}

impl Rule {
    pub fn v4(table: &'static str, chain: &'static str, spec: impl Into<String>) -> Self {
        Self {
            family: IpFamily::V4,
            table,
            chain,
            spec: spec.into(),
            head: false,
        }
    }

    pub fn v6(table: &'static str, chain: &'static str, spec: impl Into<String>) -> Self {
        Self {
            family: IpFamily::V6,
            ..Self::v4(table, chain, spec)
        }
    }

    #[must_use]
    pub fn at_head(mut self) -> Self {
        self.head = true;
        self
    }
}

fn snat_mark_spec() -> String {
    format!("{GUEST_TRAFFIC_MARK}/{GUEST_TRAFFIC_MASK}")
}

fn outbound_snat_mark_rule(ifname: &str) -> Rule {
    Rule::v4(
        "mangle",
        "PREROUTING",
        format!("-i {} -j MARK --set-mark {}", ifname, snat_mark_spec()),
    )
}

fn inbound_dnat_rules(ifname: &str, ipv4: Ipv4Addr) -> Vec<Rule> {
    vec![
        Rule::v4(
            "nat",
            "PREROUTING",
            format!("-i {ifname} -m socket --nowildcard -j ACCEPT"),
        ),
        Rule::v4(
            "nat",
            "PREROUTING",
            format!("-i {ifname} -p tcp -j DNAT --to-destination {ipv4}"),
        ),
        Rule::v4(
            "nat",
            "PREROUTING",
            format!("-i {ifname} -p udp -j DNAT --to-destination {ipv4}"),
        ),
    ]
}

fn forward_rule(family: IpFamily, iif: &str, oif: &str) -> Option<Rule> {
    let mut spec = Vec::new();
    if !iif.is_empty() {
        spec.push(format!("-i {iif}"));
    }
    if !oif.is_empty() {
        spec.push(format!("-o {oif}"));
    }
    if spec.is_empty() {
        return None;
    }
    spec.push("-j ACCEPT".to_string());
    let rule = Rule::v4("filter", "FORWARD", spec.join(" "));
    Some(Rule { family, ..rule })
}

fn source_tag_rules(ifname: &str, source: TrafficSource) -> Vec<Rule> {
    let spec = format!("-i {} -j MARK --set-mark {}", ifname, source.mark_arg());
    vec![
        Rule::v4("mangle", "PREROUTING", spec.clone()),
        Rule::v6("mangle", "PREROUTING", spec),
    ]
}

fn routing_device_rules(ext: &str, int: &str, int_ipv4: Ipv4Addr, source: TrafficSource) -> Vec<Rule> {
    let mut rules = Vec::new();
    if !ext.is_empty() {
        rules.extend(inbound_dnat_rules(ext, int_ipv4));
    }
    rules.extend(forward_rule(IpFamily::V4, ext, int));
    rules.extend(forward_rule(IpFamily::V4, int, ext));
    rules.extend(source_tag_rules(int, source));
    rules
}

fn snat_mark_rules() -> Vec<Rule> {
    let mark = snat_mark_spec();
    vec![
        Rule::v4(
            "filter",
            "FORWARD",
            format!("-m mark --mark {mark} -m state --state INVALID -j DROP"),
        ),
        Rule::v4("filter", "FORWARD", format!("-m mark --mark {mark} -j ACCEPT")),
        Rule::v4("nat", "POSTROUTING", format!("-m mark --mark {mark} -j MASQUERADE")),
    ]
}

fn adb_forward_rule(ifname: &str) -> Rule {
    Rule::v4(
        "nat",
        "PREROUTING",
        format!(
            "-i {ifname} -p tcp -d {ARC_ADB_ADDR} --dport {ARC_ADB_PORT} -j DNAT --to-destination 127.0.0.1:{ADB_PROXY_PORT}"
        ),
    )
}

fn adb_access_rule(ifname: &str) -> Rule {
    Rule::v4(
        "filter",
        "INPUT",
        format!("-i {ifname} -p tcp --dport {ADB_PROXY_PORT} -j ACCEPT"),
    )
}

/// Host datapath primitives.
///
/// Every compound operation unwinds the steps it already applied before
/// returning an error. Removal operations are best-effort and only log.
pub struct Datapath {
    runner: Box<dyn ProcessRunner>,
    filter: Box<dyn PacketFilter>,
    kernel: Box<dyn NetKernel>,
}

impl Datapath {
    pub fn new(
        runner: Box<dyn ProcessRunner>,
        filter: Box<dyn PacketFilter>,
        kernel: Box<dyn NetKernel>,
    ) -> Self {
        Self {
            runner,
            filter,
            kernel,
        }
    }

    /// Datapath driving the real host tools and kernel
    pub fn system() -> Result<Self> {
        Ok(Self::new(
            Box::new(CommandRunner),
            Box::new(IptablesFilter::new()?),
            Box::new(LinuxKernel),
        ))
    }

    pub fn filter(&self) -> &dyn PacketFilter {
        self.filter.as_ref()
    }

    pub fn kernel(&self) -> &dyn NetKernel {
        self.kernel.as_ref()
    }

    // Packet filter

    /// Install `rules` in order. Rules already present are left alone, so
    /// re-applying is a no-op. If any fails, the rules this call installed
    /// are removed again.
    pub fn add_rules(&self, rules: &[Rule]) -> Result<()> {
        let mut added: Vec<Rule> = Vec::new();
        for rule in rules {
            let res = match self.filter.exists(rule.family, rule.table, rule.chain, &rule.spec) {
                Ok(true) => continue,
                Ok(false) if rule.head => self.filter.insert(rule.family, rule.table, rule.chain, &rule.spec),
                Ok(false) => self.filter.append(rule.family, rule.table, rule.chain, &rule.spec),
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                self.remove_rules(&added);
                return Err(e);
            }
            added.push(rule.clone());
        }
        Ok(())
    }

    /// Remove `rules` in reverse order, ignoring missing ones.
    pub fn remove_rules(&self, rules: &[Rule]) {
        for rule in rules.iter().rev() {
            if let Err(e) = self.filter.delete(rule.family, rule.table, rule.chain, &rule.spec) {
                warn!("Failed to remove rule (may not exist): {:#}", e);
            }
        }
    }

    pub fn add_snat_mark_rules(&self) -> Result<()> {
        self.add_rules(&snat_mark_rules())
            .context("Failed to install SNAT mark rules")
    }

    pub fn remove_snat_mark_rules(&self) {
        self.remove_rules(&snat_mark_rules());
    }

    fn established_rule() -> Rule {
        Rule::v4(
            "filter",
            "FORWARD",
            "-m state --state ESTABLISHED,RELATED -j ACCEPT",
        )
    }

    pub fn add_forward_established_rule(&self) -> Result<()> {
        self.add_rules(&[Self::established_rule()])
    }

    pub fn remove_forward_established_rule(&self) {
        self.remove_rules(&[Self::established_rule()]);
    }

    fn interface_snat_rule(ifname: &str) -> Rule {
        Rule::v4("nat", "POSTROUTING", format!("-o {ifname} -j MASQUERADE"))
    }

    /// Masquerade everything leaving `ifname`, which may be a `+` wildcard.
    pub fn add_interface_snat(&self, ifname: &str) -> Result<()> {
        self.add_rules(&[Self::interface_snat_rule(ifname)])
    }

    pub fn remove_interface_snat(&self, ifname: &str) {
        self.remove_rules(&[Self::interface_snat_rule(ifname)]);
    }

    /// Mark traffic entering from `ifname` as guest traffic.
    pub fn add_outbound_ipv4_snat_mark(&self, ifname: &str) -> Result<()> {
        self.add_rules(&[outbound_snat_mark_rule(ifname)])
    }

    pub fn remove_outbound_ipv4_snat_mark(&self, ifname: &str) {
        self.remove_rules(&[outbound_snat_mark_rule(ifname)]);
    }

    fn outbound_rule(ifname: &str) -> Option<Rule> {
        forward_rule(IpFamily::V4, "", ifname)
    }

    /// Accept forwarded IPv4 traffic towards `ifname`.
    pub fn add_outbound_ipv4(&self, ifname: &str) -> Result<()> {
        let rules: Vec<Rule> = Self::outbound_rule(ifname).into_iter().collect();
        self.add_rules(&rules)
    }

    pub fn remove_outbound_ipv4(&self, ifname: &str) {
        let rules: Vec<Rule> = Self::outbound_rule(ifname).into_iter().collect();
        self.remove_rules(&rules);
    }

    fn source_drop_rule(prefix: &str, cidr: &str) -> Rule {
        Rule::v4("filter", "OUTPUT", format!("-o {prefix}+ -s {cidr} -j DROP")).at_head()
    }

    /// Drop packets sourced from `cidr` leaving on any `<prefix>N` interface.
    pub fn add_source_ipv4_drop(&self, prefix: &str, cidr: &str) -> Result<()> {
        self.add_rules(&[Self::source_drop_rule(prefix, cidr)])
    }

    pub fn remove_source_ipv4_drop(&self, prefix: &str, cidr: &str) {
        self.remove_rules(&[Self::source_drop_rule(prefix, cidr)]);
    }

    /// Wire `int_ifname` to `ext_ifname`: DNAT of new inbound connections
    /// (skipped when `ext_ifname` is empty), forwarding in both directions,
    /// and the source tag on traffic entering from `int_ifname`.
    #[tracing::instrument(name = "datapath.start_routing_device", skip(self), fields(ext = %ext_ifname, int = %int_ifname))]
    pub fn start_routing_device(
        &self,
        ext_ifname: &str,
        int_ifname: &str,
        int_ipv4: Ipv4Addr,
        source: TrafficSource,
    ) -> Result<()> {
        self.add_rules(&routing_device_rules(ext_ifname, int_ifname, int_ipv4, source))
            .with_context(|| format!("Failed to route {int_ifname} through {ext_ifname:?}"))
    }

    pub fn stop_routing_device(
        &self,
        ext_ifname: &str,
        int_ifname: &str,
        int_ipv4: Ipv4Addr,
        source: TrafficSource,
    ) {
        self.remove_rules(&routing_device_rules(ext_ifname, int_ifname, int_ipv4, source));
    }

    /// Accept IPv6 forwarding between `a` and `b` in both directions.
    /// Rules already present are left alone.
    pub fn add_ipv6_forwarding(&self, a: &str, b: &str) -> Result<()> {
        let rules: Vec<Rule> = [(a, b), (b, a)]
            .into_iter()
            .filter_map(|(iif, oif)| forward_rule(IpFamily::V6, iif, oif))
            .collect();
        self.add_rules(&rules)
    }

    pub fn remove_ipv6_forwarding(&self, a: &str, b: &str) {
        let rules: Vec<Rule> = [(a, b), (b, a)]
            .iter()
            .filter_map(|(iif, oif)| forward_rule(IpFamily::V6, iif, oif))
            .collect();
        self.remove_rules(&rules);
    }

    /// DNAT the Android ADB port arriving on `ifname` to the host proxy.
    pub fn add_adb_port_forward_rule(&self, ifname: &str) -> Result<()> {
        self.add_rules(&[adb_forward_rule(ifname)])
    }

    pub fn remove_adb_port_forward_rule(&self, ifname: &str) {
        self.remove_rules(&[adb_forward_rule(ifname)]);
    }

    pub fn add_adb_port_access_rule(&self, ifname: &str) -> Result<()> {
        self.add_rules(&[adb_access_rule(ifname)])
    }

    pub fn remove_adb_port_access_rule(&self, ifname: &str) {
        self.remove_rules(&[adb_access_rule(ifname)]);
    }

    // Namespaces

    /// Name the network namespace of `pid`, replacing any stale binding.
    pub fn netns_attach(&self, name: &str, pid: i32) -> Result<()> {
        if self.runner.ip(&["netns", "delete", name]).is_ok() {
            info!("Removed stale netns name {}", name);
        }
        let pid = pid.to_string();
        self.runner
            .ip(&["netns", "attach", name, &pid])
            .with_context(|| format!("Failed to attach netns name {name} to pid {pid}"))
    }

    pub fn netns_delete(&self, name: &str) {
        if let Err(e) = self.runner.ip(&["netns", "delete", name]) {
            warn!("Failed to delete netns name {}: {:#}", name, e);
        }
    }

    // Links

    fn ip_in(&self, netns: Option<&str>, args: &[&str]) -> Result<()> {
        match netns {
            Some(ns) => self.runner.ip_netns(ns, args),
            None => self.runner.ip(args),
        }
    }

    /// Create bridge `ifname` addressed with `ipv4/prefix_len`, bring it up
    /// and mark traffic entering from it as guest traffic.
    #[tracing::instrument(name = "datapath.add_bridge", skip(self), fields(bridge = %ifname, ipv4 = %ipv4))]
    pub fn add_bridge(&self, ifname: &str, ipv4: Ipv4Addr, prefix_len: u8) -> Result<()> {
        self.runner
            .ip(&["link", "add", ifname, "type", "bridge"])
            .with_context(|| format!("Failed to create bridge {ifname}"))?;

        let cidr = ipv4_cidr(ipv4, prefix_len);
        let brd = ipv4_broadcast(ipv4, prefix_len).to_string();
        let res = self
            .runner
            .ip(&["addr", "add", &cidr, "brd", &brd, "dev", ifname])
            .and_then(|()| self.runner.ip(&["link", "set", ifname, "up"]))
            .and_then(|()| self.add_outbound_ipv4_snat_mark(ifname));
        if let Err(e) = res {
            self.remove_bridge(ifname);
            return Err(e.context(format!("Failed to set up bridge {ifname}")));
        }

        info!("Created bridge {} at {}", ifname, cidr);
        Ok(())
    }

    pub fn remove_bridge(&self, ifname: &str) {
        self.remove_outbound_ipv4_snat_mark(ifname);
        if let Err(e) = self.runner.ip(&["link", "set", ifname, "down"]) {
            warn!("Failed to bring down bridge {}: {:#}", ifname, e);
        }
        self.remove_interface(ifname);
    }

    pub fn add_to_bridge(&self, br_ifname: &str, ifname: &str) -> Result<()> {
        self.runner
            .ip(&["link", "set", ifname, "master", br_ifname])
            .with_context(|| format!("Failed to attach {ifname} to bridge {br_ifname}"))?;
        info!("Attached {} to bridge {}", ifname, br_ifname);
        Ok(())
    }

    /// Create a veth pair with `peer_ifname` placed in namespace `netns`.
    pub fn add_virtual_interface_pair(&self, netns: &str, veth_ifname: &str, peer_ifname: &str) -> Result<()> {
        self.runner
            .ip(&[
                "link", "add", veth_ifname, "type", "veth", "peer", "name", peer_ifname, "netns", netns,
            ])
            .with_context(|| format!("Failed to create veth pair {veth_ifname} <-> {netns}/{peer_ifname}"))
    }

    pub fn configure_interface(
        &self,
        netns: Option<&str>,
        ifname: &str,
        mac: MacAddress,
        ipv4: Ipv4Addr,
        prefix_len: u8,
        up: bool,
        multicast: bool,
    ) -> Result<()> {
        let cidr = ipv4_cidr(ipv4, prefix_len);
        let brd = ipv4_broadcast(ipv4, prefix_len).to_string();
        self.ip_in(netns, &["addr", "add", &cidr, "brd", &brd, "dev", ifname])
            .with_context(|| format!("Failed to address {ifname}"))?;

        let mac = mac.to_string();
        self.ip_in(
            netns,
            &[
                "link",
                "set",
                "dev",
                ifname,
                if up { "up" } else { "down" },
                "addr",
                &mac,
                "multicast",
                if multicast { "on" } else { "off" },
            ],
        )
        .with_context(|| format!("Failed to configure {ifname}"))
    }

    pub fn toggle_interface(&self, ifname: &str, up: bool) -> Result<()> {
        self.runner
            .ip(&["link", "set", ifname, if up { "up" } else { "down" }])
            .with_context(|| format!("Failed to bring {} {ifname}", if up { "up" } else { "down" }))
    }

    /// Create `veth_ifname` in the host and `peer_ifname` in `netns`,
    /// configure the peer and bring both ends up.
    #[tracing::instrument(name = "datapath.connect_veth_pair", skip(self, peer_mac), fields(netns = %netns, veth = %veth_ifname, peer = %peer_ifname))]
    pub fn connect_veth_pair(
        &self,
        netns: &str,
        veth_ifname: &str,
        peer_ifname: &str,
        peer_mac: MacAddress,
        peer_ipv4: Ipv4Addr,
        peer_prefix_len: u8,
        multicast: bool,
    ) -> Result<()> {
        self.add_virtual_interface_pair(netns, veth_ifname, peer_ifname)?;

        let res = self
            .configure_interface(
                Some(netns),
                peer_ifname,
                peer_mac,
                peer_ipv4,
                peer_prefix_len,
                true,
                multicast,
            )
            .and_then(|()| self.toggle_interface(veth_ifname, true));
        if let Err(e) = res {
            // Deleting one end removes both
            self.remove_interface(veth_ifname);
            return Err(e);
        }
        Ok(())
    }

    pub fn remove_interface(&self, ifname: &str) {
        if let Err(e) = self.runner.ip(&["link", "delete", ifname]) {
            warn!("Failed to delete interface {} (may not exist): {:#}", ifname, e);
        }
    }

    /// Create a persistent TAP owned by `user` and return its name.
    #[tracing::instrument(name = "datapath.add_tap", skip(self, mac))]
    pub fn add_tap(
        &self,
        name: &str,
        mac: Option<MacAddress>,
        ipv4: Option<(Ipv4Addr, u8)>,
        user: &str,
    ) -> Result<String> {
        let owner_uid = if user.is_empty() {
            None
        } else {
            Some(self.kernel.lookup_uid(user)?)
        };
        self.kernel.create_tap(&TapRequest {
            name,
            mac,
            ipv4,
            owner_uid,
        })
    }

    pub fn remove_tap(&self, ifname: &str) {
        if let Err(e) = self.runner.ip(&["tuntap", "del", ifname, "mode", "tap"]) {
            warn!("Failed to delete TAP device {}: {:#}", ifname, e);
        }
    }

    /// Set the bits of `on` and clear the bits of `off` in the link flags.
    pub fn mask_interface_flags(&self, ifname: &str, on: i32, off: i32) -> Result<()> {
        let flags = self.kernel.interface_flags(ifname)?;
        self.kernel.set_interface_flags(ifname, (flags | on) & !off)
    }

    // Routes and addresses

    pub fn add_ipv4_route(&self, route: &Ipv4Route) -> Result<()> {
        self.kernel.modify_route(RouteOp::Add, route)
    }

    pub fn delete_ipv4_route(&self, route: &Ipv4Route) {
        if let Err(e) = self.kernel.modify_route(RouteOp::Delete, route) {
            warn!("Failed to delete route: {:#}", e);
        }
    }

    /// Default route inside `netns` through `gateway`.
    pub fn add_default_route_in_netns(&self, netns: &str, gateway: Ipv4Addr) -> Result<()> {
        let gw = gateway.to_string();
        self.runner
            .ip_netns(netns, &["route", "add", "default", "via", &gw])
            .with_context(|| format!("Failed to add default route via {gw} in {netns}"))
    }

    pub fn add_ipv6_host_route(&self, ifname: &str, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        let dst = format!("{addr}/{prefix_len}");
        self.runner
            .ip(&["-6", "route", "replace", &dst, "dev", ifname])
            .with_context(|| format!("Failed to route {dst} to {ifname}"))
    }

    pub fn remove_ipv6_host_route(&self, ifname: &str, addr: Ipv6Addr, prefix_len: u8) {
        let dst = format!("{addr}/{prefix_len}");
        if let Err(e) = self.runner.ip(&["-6", "route", "del", &dst, "dev", ifname]) {
            warn!("Failed to remove route {}: {:#}", dst, e);
        }
    }

    pub fn add_ipv6_address(&self, ifname: &str, addr: Ipv6Addr) -> Result<()> {
        let cidr = format!("{addr}/64");
        self.runner
            .ip(&["-6", "addr", "add", &cidr, "dev", ifname])
            .with_context(|| format!("Failed to add {cidr} to {ifname}"))
    }

    pub fn remove_ipv6_address(&self, ifname: &str, addr: Ipv6Addr) {
        let cidr = format!("{addr}/64");
        if let Err(e) = self.runner.ip(&["-6", "addr", "del", &cidr, "dev", ifname]) {
            warn!("Failed to remove {} from {}: {:#}", cidr, ifname, e);
        }
    }

    pub fn add_ipv6_neighbor_proxy(&self, ifname: &str, addr: Ipv6Addr) -> Result<()> {
        let addr = addr.to_string();
        self.runner
            .ip(&["-6", "neigh", "add", "proxy", &addr, "dev", ifname])
            .with_context(|| format!("Failed to proxy {addr} on {ifname}"))
    }

    pub fn remove_ipv6_neighbor_proxy(&self, ifname: &str, addr: Ipv6Addr) {
        let addr = addr.to_string();
        if let Err(e) = self.runner.ip(&["-6", "neigh", "del", "proxy", &addr, "dev", ifname]) {
            warn!("Failed to remove neighbor proxy {}: {:#}", addr, e);
        }
    }

    // Sysctl

    pub fn sysctl_w(&self, key: &str, value: &str) -> Result<()> {
        self.runner.sysctl_w(key, value)
    }

    pub fn set_route_localnet(&self, ifname: &str, enable: bool) -> Result<()> {
        self.sysctl_w(
            &format!("net.ipv4.conf.{ifname}.route_localnet"),
            if enable { "1" } else { "0" },
        )
    }
}
