//! In-memory host used by datapath and guest-service tests.
//!
//! The fake interprets the `ip`/`sysctl` command lines the datapath emits,
//! keeps the packet-filter rules as strings, and models TAP creation and
//! routes for the kernel trait. Any mutation whose command line contains a
//! registered needle fails.

use super::{Datapath, IpFamily, Ipv4Route, NetKernel, PacketFilter, ProcessRunner, RouteOp, TapRequest};
use anyhow::{anyhow, bail, Result};
use guestnet_common::addr::MacAddress;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

pub const CROSVM_UID: u32 = 299;
pub const HELPER_UID: u32 = 20100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Physical,
    Bridge,
    /// Key of the other end
    Veth { peer: String },
    Tap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub kind: LinkKind,
    pub netns: Option<String>,
    pub addrs: BTreeSet<String>,
    pub up: bool,
    pub master: Option<String>,
    pub mac: Option<MacAddress>,
    pub flags: i32,
    pub owner: Option<u32>,
    pub multicast: bool,
}

impl Link {
    fn new(kind: LinkKind, netns: Option<&str>) -> Self {
        Self {
            kind,
            netns: netns.map(str::to_string),
            addrs: BTreeSet::new(),
            up: false,
            master: None,
            mac: None,
            flags: 0,
            owner: None,
            multicast: true,
        }
    }
}

/// Everything observable about the fake host's network state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Keyed by `ns:name`, or `name` in the root namespace
    pub links: BTreeMap<String, Link>,
    pub netns: BTreeMap<String, i32>,
    pub routes: BTreeSet<String>,
    /// Sorted; `<family> -t <table> <chain> <rule>`
    pub rules: Vec<String>,
    pub chains: BTreeSet<String>,
}

#[derive(Default)]
struct FakeState {
    topo: Topology,
    commands: Vec<String>,
    failures: Vec<String>,
    sysctls: BTreeMap<String, String>,
    counters: HashMap<IpFamily, String>,
    pids: BTreeSet<i32>,
}

impl FakeState {
    fn check(&mut self, line: &str) -> Result<()> {
        self.commands.push(line.to_string());
        if let Some(needle) = self.failures.iter().find(|n| line.contains(n.as_str())) {
            bail!("injected failure '{}' for: {}", needle, line);
        }
        Ok(())
    }
}

fn link_key(netns: Option<&str>, name: &str) -> String {
    match netns {
        Some(ns) => format!("{ns}:{name}"),
        None => name.to_string(),
    }
}

#[derive(Clone, Default)]
pub struct FakeHost(Rc<RefCell<FakeState>>);

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn datapath(&self) -> Datapath {
        Datapath::new(
            Box::new(FakeRunner(self.clone())),
            Box::new(FakeFilter(self.clone())),
            Box::new(FakeKernel(self.clone())),
        )
    }

    pub fn add_physical(&self, name: &str, flags: i32) {
        let mut link = Link::new(LinkKind::Physical, None);
        link.flags = flags;
        link.up = true;
        link.mac = Some(MacAddress::new([0x00, 0x1a, 0x11, 0x00, 0x00, 0x01]));
        self.0.borrow_mut().topo.links.insert(name.to_string(), link);
    }

    pub fn add_pid(&self, pid: i32) {
        self.0.borrow_mut().pids.insert(pid);
    }

    pub fn kill_pid(&self, pid: i32) {
        self.0.borrow_mut().pids.remove(&pid);
    }

    pub fn fail_on(&self, needle: &str) {
        self.0.borrow_mut().failures.push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.0.borrow_mut().failures.clear();
    }

    pub fn topology(&self) -> Topology {
        let mut topo = self.0.borrow().topo.clone();
        topo.rules.sort();
        topo
    }

    pub fn link(&self, name: &str) -> Option<Link> {
        self.0.borrow().topo.links.get(name).cloned()
    }

    pub fn link_in(&self, netns: &str, name: &str) -> Option<Link> {
        self.0.borrow().topo.links.get(&link_key(Some(netns), name)).cloned()
    }

    pub fn has_rule(&self, rule: &str) -> bool {
        self.0.borrow().topo.rules.iter().any(|r| r == rule)
    }

    pub fn rules(&self) -> Vec<String> {
        self.0.borrow().topo.rules.clone()
    }

    pub fn has_route(&self, route: &str) -> bool {
        self.0.borrow().topo.routes.contains(route)
    }

    pub fn commands(&self) -> Vec<String> {
        self.0.borrow().commands.clone()
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.0.borrow().sysctls.get(key).cloned()
    }

    /// Listing returned by `list_counters` for `family`
    pub fn set_counters(&self, family: IpFamily, listing: &str) {
        self.0.borrow_mut().counters.insert(family, listing.to_string());
    }
}

struct FakeRunner(FakeHost);

impl FakeRunner {
    fn ip(state: &mut FakeState, netns: Option<&str>, v6: bool, args: &[&str]) -> Result<()> {
        let topo = &mut state.topo;
        match args {
            ["link", "add", name, "type", "bridge"] => {
                let key = link_key(netns, name);
                if topo.links.contains_key(&key) {
                    bail!("RTNETLINK answers: File exists");
                }
                topo.links.insert(key, Link::new(LinkKind::Bridge, netns));
            }
            ["link", "add", veth, "type", "veth", "peer", "name", peer, "netns", ns] => {
                if !topo.netns.contains_key(*ns) {
                    bail!("Invalid netns value \"{}\"", ns);
                }
                let veth_key = link_key(netns, veth);
                let peer_key = link_key(Some(*ns), peer);
                if topo.links.contains_key(&veth_key) || topo.links.contains_key(&peer_key) {
                    bail!("RTNETLINK answers: File exists");
                }
                topo.links.insert(
                    veth_key.clone(),
                    Link::new(LinkKind::Veth { peer: peer_key.clone() }, netns),
                );
                topo.links
                    .insert(peer_key, Link::new(LinkKind::Veth { peer: veth_key }, Some(*ns)));
            }
            ["link", "set", name, "master", br] => {
                if !topo.links.contains_key(*br) {
                    bail!("Cannot find device \"{}\"", br);
                }
                let link = topo
                    .links
                    .get_mut(&link_key(netns, name))
                    .ok_or_else(|| anyhow!("Cannot find device \"{}\"", name))?;
                link.master = Some((*br).to_string());
            }
            ["link", "set", "dev", name, rest @ ..] | ["link", "set", name, rest @ ..] => {
                let link = topo
                    .links
                    .get_mut(&link_key(netns, name))
                    .ok_or_else(|| anyhow!("Cannot find device \"{}\"", name))?;
                let mut it = rest.iter();
                while let Some(tok) = it.next() {
                    match *tok {
                        "up" => link.up = true,
                        "down" => link.up = false,
                        "addr" => {
                            let mac = it.next().ok_or_else(|| anyhow!("missing address"))?;
                            link.mac = Some(mac.parse()?);
                        }
                        "multicast" => link.multicast = it.next() == Some(&"on"),
                        other => bail!("unsupported link attribute {}", other),
                    }
                }
            }
            ["link", "delete", name] => {
                let link = topo
                    .links
                    .remove(&link_key(netns, name))
                    .ok_or_else(|| anyhow!("Cannot find device \"{}\"", name))?;
                if let LinkKind::Veth { peer } = link.kind {
                    topo.links.remove(&peer);
                }
                for other in topo.links.values_mut() {
                    if other.master.as_deref() == Some(*name) {
                        other.master = None;
                    }
                }
            }
            ["addr", op, cidr, .., "dev", name] => {
                let link = topo
                    .links
                    .get_mut(&link_key(netns, name))
                    .ok_or_else(|| anyhow!("Cannot find device \"{}\"", name))?;
                match *op {
                    "add" if !link.addrs.insert((*cidr).to_string()) => {
                        bail!("RTNETLINK answers: File exists")
                    }
                    "del" if !link.addrs.remove(*cidr) => {
                        bail!("RTNETLINK answers: Cannot assign requested address")
                    }
                    "add" | "del" => {}
                    other => bail!("unsupported addr op {}", other),
                }
            }
            ["tuntap", "del", name, "mode", "tap"] => {
                if topo.links.remove(*name).is_none() {
                    bail!("ioctl(TUNSETIFF): Device or resource busy");
                }
            }
            ["netns", "attach", name, pid] => {
                let pid: i32 = pid.parse()?;
                if !state.pids.contains(&pid) {
                    bail!("No such process");
                }
                if topo.netns.contains_key(*name) {
                    bail!("Cannot create namespace file \"/run/netns/{}\": File exists", name);
                }
                topo.netns.insert((*name).to_string(), pid);
            }
            ["netns", "delete", name] => {
                if topo.netns.remove(*name).is_none() {
                    bail!("Cannot remove namespace file \"/run/netns/{}\"", name);
                }
            }
            ["route", "add", "default", "via", gw] => {
                let ns = netns.unwrap_or("");
                if !topo.routes.insert(format!("{ns}:default via {gw}")) {
                    bail!("RTNETLINK answers: File exists");
                }
            }
            ["route", "replace", dst, "dev", name] if v6 => {
                topo.routes.insert(format!("{dst} dev {name}"));
            }
            ["route", "del", dst, "dev", name] if v6 => {
                if !topo.routes.remove(&format!("{dst} dev {name}")) {
                    bail!("RTNETLINK answers: No such process");
                }
            }
            ["neigh", op, "proxy", addr, "dev", name] if v6 => {
                let entry = format!("proxy {addr} dev {name}");
                match *op {
                    "add" => {
                        topo.routes.insert(entry);
                    }
                    "del" if !topo.routes.remove(&entry) => bail!("RTNETLINK answers: No such file"),
                    _ => {}
                }
            }
            other => bail!("unsupported ip command: {:?}", other),
        }
        Ok(())
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut state = self.0 .0.borrow_mut();
        state.check(&format!("{} {}", program, args.join(" ")))?;

        match program {
            "ip" => {
                let mut args = args;
                let mut netns = None;
                let mut v6 = false;
                loop {
                    match args {
                        ["-n", ns, rest @ ..] => {
                            if !state.topo.netns.contains_key(*ns) {
                                bail!("Cannot open network namespace \"{}\"", ns);
                            }
                            netns = Some(*ns);
                            args = rest;
                        }
                        ["-6", rest @ ..] => {
                            v6 = true;
                            args = rest;
                        }
                        _ => break,
                    }
                }
                Self::ip(&mut state, netns, v6, args)?;
            }
            "sysctl" => {
                let [_, kv] = args else {
                    bail!("unsupported sysctl invocation");
                };
                let (k, v) = kv.split_once('=').ok_or_else(|| anyhow!("bad sysctl {}", kv))?;
                state.sysctls.insert(k.to_string(), v.to_string());
            }
            other => bail!("unexpected program {}", other),
        }
        Ok(String::new())
    }
}

struct FakeFilter(FakeHost);

fn rule_line(family: IpFamily, table: &str, chain: &str, rule: &str) -> String {
    format!("{family} -t {table} {chain} {rule}")
}

impl PacketFilter for FakeFilter {
    fn append(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        state.check(&format!("{family} -t {table} -A {chain} {rule}"))?;
        state.topo.rules.push(rule_line(family, table, chain, rule));
        Ok(())
    }

    fn insert(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        state.check(&format!("{family} -t {table} -I {chain} {rule}"))?;
        state.topo.rules.insert(0, rule_line(family, table, chain, rule));
        Ok(())
    }

    fn delete(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        state.check(&format!("{family} -t {table} -D {chain} {rule}"))?;
        let line = rule_line(family, table, chain, rule);
        let pos = state
            .topo
            .rules
            .iter()
            .position(|r| *r == line)
            .ok_or_else(|| anyhow!("Bad rule (does a matching rule exist in that chain?)"))?;
        state.topo.rules.remove(pos);
        Ok(())
    }

    fn exists(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<bool> {
        let line = rule_line(family, table, chain, rule);
        Ok(self.0 .0.borrow().topo.rules.contains(&line))
    }

    fn new_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        state.check(&format!("{family} -t {table} -N {chain}"))?;
        if !state.topo.chains.insert(format!("{family} -t {table} {chain}")) {
            bail!("Chain already exists.");
        }
        Ok(())
    }

    fn chain_exists(&self, family: IpFamily, table: &str, chain: &str) -> Result<bool> {
        let state = self.0 .0.borrow();
        Ok(state.topo.chains.contains(&format!("{family} -t {table} {chain}")))
    }

    fn list_counters(&self, family: IpFamily, _table: &str) -> Result<String> {
        Ok(self.0 .0.borrow().counters.get(&family).cloned().unwrap_or_default())
    }
}

struct FakeKernel(FakeHost);

fn route_line(route: &Ipv4Route) -> String {
    match (&route.gateway, &route.dev) {
        (Some(gw), _) => format!("{}/{} via {}", route.dst, route.prefix_len, gw),
        (None, Some(dev)) => format!("{}/{} dev {}", route.dst, route.prefix_len, dev),
        (None, None) => format!("{}/{}", route.dst, route.prefix_len),
    }
}

impl NetKernel for FakeKernel {
    fn create_tap(&self, req: &TapRequest<'_>) -> Result<String> {
        let mut state = self.0 .0.borrow_mut();
        let template = if req.name.is_empty() {
            super::kernel::TAP_TEMPLATE
        } else {
            req.name
        };
        let name = if template.contains("%d") {
            (0..)
                .map(|n| template.replace("%d", &n.to_string()))
                .find(|n| !state.topo.links.contains_key(n))
                .ok_or_else(|| anyhow!("no free TAP name"))?
        } else {
            template.to_string()
        };
        state.check(&format!("tuntap add {name}"))?;
        if state.topo.links.contains_key(&name) {
            bail!("ioctl(TUNSETIFF): Device or resource busy");
        }

        let mut link = Link::new(LinkKind::Tap, None);
        link.mac = req.mac;
        link.owner = req.owner_uid;
        link.up = true;
        if let Some((addr, len)) = req.ipv4 {
            link.addrs.insert(format!("{addr}/{len}"));
        }
        state.topo.links.insert(name.clone(), link);

        // Owner, address and flag setup after the device is persisted
        if let Err(e) = state.check(&format!("tuntap configure {name}")) {
            state.topo.links.remove(&name);
            return Err(e);
        }
        Ok(name)
    }

    fn interface_flags(&self, ifname: &str) -> Result<i32> {
        let state = self.0 .0.borrow();
        let link = state
            .topo
            .links
            .get(ifname)
            .ok_or_else(|| anyhow!("No such device: {}", ifname))?;
        Ok(if link.up {
            link.flags | libc::IFF_UP
        } else {
            link.flags & !libc::IFF_UP
        })
    }

    fn set_interface_flags(&self, ifname: &str, flags: i32) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        state.check(&format!("set flags {ifname} {flags:#x}"))?;
        let link = state
            .topo
            .links
            .get_mut(ifname)
            .ok_or_else(|| anyhow!("No such device: {}", ifname))?;
        link.flags = flags & !libc::IFF_UP;
        link.up = flags & libc::IFF_UP != 0;
        Ok(())
    }

    fn interface_mac(&self, ifname: &str) -> Result<MacAddress> {
        let state = self.0 .0.borrow();
        state
            .topo
            .links
            .get(ifname)
            .and_then(|l| l.mac)
            .ok_or_else(|| anyhow!("No such device: {}", ifname))
    }

    fn modify_route(&self, op: RouteOp, route: &Ipv4Route) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        let line = route_line(route);
        match op {
            RouteOp::Add => {
                state.check(&format!("route add {line}"))?;
                state.topo.routes.insert(line);
            }
            RouteOp::Delete => {
                state.check(&format!("route del {line}"))?;
                state.topo.routes.remove(&line);
            }
        }
        Ok(())
    }

    fn lookup_uid(&self, user: &str) -> Result<u32> {
        match user {
            "crosvm" => Ok(CROSVM_UID),
            "guestnet" => Ok(HELPER_UID),
            other => bail!("Unknown user {}", other),
        }
    }

    fn has_netns(&self, pid: i32) -> bool {
        self.0 .0.borrow().pids.contains(&pid)
    }

    fn write_sentinel(&self, pid: i32) -> Result<()> {
        let mut state = self.0 .0.borrow_mut();
        state.check(&format!("sentinel {pid}"))?;
        if !state.pids.contains(&pid) {
            bail!("No such process");
        }
        Ok(())
    }
}
