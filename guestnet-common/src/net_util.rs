use crate::addr::MacAddress;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Kernel interface name limit including the trailing NUL
pub const IFNAMSIZ: usize = 16;

/// Reserved range every guest subnet is carved out of
pub const GUEST_RANGE: (Ipv4Addr, u8) = (Ipv4Addr::new(100, 115, 92, 0), 23);

pub fn ipv4_netmask(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix_len.min(32))))
}

pub fn ipv4_broadcast(base: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base) | !u32::from(ipv4_netmask(prefix_len)))
}

pub fn ipv4_cidr(addr: Ipv4Addr, prefix_len: u8) -> String {
    format!("{addr}/{prefix_len}")
}

/// Prepend `prefix` to `ifname`, truncating to fit in `IFNAMSIZ`.
///
/// When the result would be too long, it is cut to 15 bytes and the last
/// byte is replaced by the last byte of `ifname` so that names such as
/// `arc_wlan0`/`arc_wlan1` stay distinct.
pub fn prefix_ifname(prefix: &str, ifname: &str) -> String {
    let mut n: Vec<u8> = format!("{prefix}{ifname}").into_bytes();
    if n.len() < IFNAMSIZ {
        return String::from_utf8_lossy(&n).into_owned();
    }

    n.truncate(IFNAMSIZ - 1);
    if let (Some(last), Some(src)) = (n.last_mut(), ifname.as_bytes().last()) {
        *last = *src;
    }
    String::from_utf8_lossy(&n).into_owned()
}

/// Host-side bridge name for the Android interface mirroring `ifname`
pub fn arc_bridge_name(ifname: &str) -> String {
    prefix_ifname("arc_", ifname)
}

/// Host-side veth name for the Android interface mirroring `ifname`
pub fn arc_veth_host_name(ifname: &str) -> String {
    prefix_ifname("veth", ifname)
}

/// Accepts names the kernel would take: non-empty, shorter than
/// `IFNAMSIZ`, no whitespace, slash, or colon, and not `.`/`..`.
pub fn is_valid_ifname(ifname: &str) -> bool {
    if ifname.is_empty() || ifname.len() >= IFNAMSIZ || ifname == "." || ifname == ".." {
        return false;
    }
    ifname
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b'/' && b != b':')
}

/// Modified EUI-64 address built from `prefix` (upper 64 bits) and `mac`.
pub fn generate_eui64_address(prefix: Ipv6Addr, mac: MacAddress) -> Ipv6Addr {
    let mac = mac.octets();
    let mut b = prefix.octets();
    b[8..11].copy_from_slice(&mac[0..3]);
    b[11] = 0xff;
    b[12] = 0xfe;
    b[13..16].copy_from_slice(&mac[3..6]);
    b[8] ^= 0x02;
    Ipv6Addr::from(b)
}

/// One's complement sum over `data`, continuing from `sum`.
pub fn checksum_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([c[0], c[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold a 32-bit accumulator to its final 16-bit one's complement checksum
pub fn checksum_fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// ICMPv6 checksum over the pseudo-header plus `payload`.
///
/// The checksum field inside `payload` must be zero.
pub fn icmpv6_checksum(src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> u16 {
    let mut sum = checksum_add(0, &src.octets());
    sum = checksum_add(sum, &dst.octets());
    sum = checksum_add(sum, &(payload.len() as u32).to_be_bytes());
    sum = checksum_add(sum, &[0, 0, 0, 58]);
    sum = checksum_add(sum, payload);
    checksum_fold(sum)
}
