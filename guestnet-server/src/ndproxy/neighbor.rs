//! IPv6 neighbor table snapshots over rtnetlink.

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use guestnet_common::addr::MacAddress;
use rtnetlink::packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
use rtnetlink::Handle;
use std::collections::HashMap;
use std::net::Ipv6Addr;

pub type NeighborTable = HashMap<(u32, Ipv6Addr), MacAddress>;

fn parse_entry(msg: &NeighbourMessage) -> Option<((u32, Ipv6Addr), MacAddress)> {
    let mut dst = None;
    let mut lladdr = None;
    for attr in &msg.attributes {
        match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet6(a)) => dst = Some(*a),
            NeighbourAttribute::LinkLocalAddress(bytes) => {
                lladdr = <[u8; 6]>::try_from(bytes.as_slice()).ok().map(MacAddress::new);
            }
            _ => {}
        }
    }
    Some(((msg.header.ifindex, dst?), lladdr?))
}

/// Dump every IPv6 neighbor entry that has a link-layer address.
pub async fn dump(handle: &Handle) -> Result<NeighborTable> {
    let mut table = NeighborTable::new();
    let mut stream = handle.neighbours().get().execute();
    while let Some(msg) = stream.try_next().await.context("Failed to dump neighbors")? {
        if let Some((key, mac)) = parse_entry(&msg) {
            table.insert(key, mac);
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry() {
        let mut msg = NeighbourMessage::default();
        msg.header.ifindex = 4;
        msg.attributes.push(NeighbourAttribute::Destination(NeighbourAddress::Inet6(
            "fe80::1".parse().unwrap(),
        )));
        assert!(parse_entry(&msg).is_none());

        msg.attributes.push(NeighbourAttribute::LinkLocalAddress(vec![0, 0x11, 0x22, 0x33, 0x44, 0x55]));
        let (key, mac) = parse_entry(&msg).unwrap();
        assert_eq!(key, (4, "fe80::1".parse().unwrap()));
        assert_eq!(mac.to_string(), "00:11:22:33:44:55");
    }

    #[tokio::test]
    #[ignore] // Requires netlink access
    async fn test_dump_host_table() {
        let (connection, handle, _) = rtnetlink::new_connection().unwrap();
        tokio::spawn(connection);
        dump(&handle).await.unwrap();
    }
}
