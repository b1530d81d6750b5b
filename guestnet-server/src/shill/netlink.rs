//! Device backend sampling the kernel over rtnetlink.
//!
//! Managed devices are links whose name carries a physical prefix. The
//! default device is the output interface of the lowest-metric IPv4 default
//! route.

use super::{DeviceSnapshot, DeviceType, RawIpConfig, Snapshot};
use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
use rtnetlink::{new_connection, Handle, RouteMessageBuilder};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const MANAGED_PREFIXES: [&str; 6] = ["eth", "usb", "wlan", "mlan", "wwan", "rmnet"];

pub fn is_managed(ifname: &str) -> bool {
    MANAGED_PREFIXES.iter().any(|p| ifname.starts_with(p))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub oif: u32,
    pub gateway: IpAddr,
    pub metric: u32,
}

/// Assemble a snapshot from raw kernel state.
pub fn build_snapshot(
    links: &[(u32, String)],
    addrs: &[(u32, IpAddr, u8)],
    default_routes: &[DefaultRoute],
) -> Snapshot {
    let mut devices = Vec::new();
    for (index, ifname) in links.iter().filter(|(_, name)| is_managed(name)) {
        let mut ipconfigs = Vec::new();
        for (_, addr, prefix_len) in addrs.iter().filter(|(i, _, _)| i == index) {
            let v6 = addr.is_ipv6();
            let gateway = default_routes
                .iter()
                .filter(|r| r.oif == *index && r.gateway.is_ipv6() == v6)
                .min_by_key(|r| r.metric)
                .map(|r| r.gateway.to_string())
                .unwrap_or_default();
            ipconfigs.push(RawIpConfig {
                method: if v6 { "ipv6" } else { "ipv4" }.to_string(),
                address: addr.to_string(),
                gateway,
                prefix_len: *prefix_len,
                dns: Vec::new(),
            });
        }
        devices.push(DeviceSnapshot {
            ifname: ifname.clone(),
            device_type: DeviceType::from_ifname(ifname),
            ipconfigs,
        });
    }

    let names: BTreeMap<u32, &String> = links.iter().map(|(i, n)| (*i, n)).collect();
    let default_ifname = default_routes
        .iter()
        .filter(|r| r.gateway.is_ipv4())
        .filter_map(|r| names.get(&r.oif).map(|n| (r.metric, *n)))
        .filter(|(_, n)| is_managed(n))
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, n)| n.clone());

    Snapshot {
        devices,
        default_ifname,
    }
}

fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => a.is_link_local(),
        IpAddr::V6(a) => (a.segments()[0] & 0xffc0) == 0xfe80,
    }
}

async fn default_routes(handle: &Handle, msg: rtnetlink::packet_route::route::RouteMessage) -> Result<Vec<DefaultRoute>> {
    let mut routes = Vec::new();
    let mut stream = handle.route().get(msg).execute();
    while let Some(route) = stream.try_next().await.context("Failed to dump routes")? {
        if route.header.destination_prefix_length != 0 {
            continue;
        }
        let mut oif = None;
        let mut gateway = None;
        let mut metric = 0;
        for attr in &route.attributes {
            match attr {
                RouteAttribute::Oif(i) => oif = Some(*i),
                RouteAttribute::Gateway(RouteAddress::Inet(a)) => gateway = Some(IpAddr::V4(*a)),
                RouteAttribute::Gateway(RouteAddress::Inet6(a)) => gateway = Some(IpAddr::V6(*a)),
                RouteAttribute::Priority(p) => metric = *p,
                _ => {}
            }
        }
        if let (Some(oif), Some(gateway)) = (oif, gateway) {
            routes.push(DefaultRoute { oif, gateway, metric });
        }
    }
    Ok(routes)
}

/// Take one sample of links, addresses and default routes.
pub async fn sample(handle: &Handle) -> Result<Snapshot> {
    let mut links = Vec::new();
    let mut stream = handle.link().get().execute();
    while let Some(link) = stream.try_next().await.context("Failed to dump links")? {
        let name = link.attributes.iter().find_map(|a| match a {
            LinkAttribute::IfName(n) => Some(n.clone()),
            _ => None,
        });
        if let Some(name) = name {
            links.push((link.header.index, name));
        }
    }

    let mut addrs = Vec::new();
    let mut stream = handle.address().get().execute();
    while let Some(msg) = stream.try_next().await.context("Failed to dump addresses")? {
        for attr in &msg.attributes {
            if let AddressAttribute::Address(addr) = attr {
                if !is_link_local(addr) {
                    addrs.push((msg.header.index, *addr, msg.header.prefix_len));
                }
            }
        }
    }

    let mut routes = default_routes(handle, RouteMessageBuilder::<Ipv4Addr>::new().build()).await?;
    routes.extend(default_routes(handle, RouteMessageBuilder::<Ipv6Addr>::new().build()).await?);

    Ok(build_snapshot(&links, &addrs, &routes))
}

/// Sample every `period` and forward snapshots that differ from the last.
pub fn spawn_poller(period: Duration, tx: mpsc::Sender<Snapshot>) -> Result<JoinHandle<()>> {
    let (connection, handle, _) = new_connection().context("Failed to open rtnetlink socket")?;
    tokio::spawn(connection);

    Ok(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        let mut last: Option<Snapshot> = None;
        loop {
            interval.tick().await;
            match sample(&handle).await {
                Ok(snapshot) => {
                    if last.as_ref() == Some(&snapshot) {
                        continue;
                    }
                    debug!("Device snapshot: {} devices", snapshot.devices.len());
                    last = Some(snapshot.clone());
                    if tx.send(snapshot).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to sample devices: {:#}", e),
            }
        }
    }))
}
