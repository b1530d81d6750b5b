//! IPv6 Neighbor Discovery frame parsing and proxy translation (RFC 4389).
//!
//! Frames are raw Ethernet frames as read from an `AF_PACKET` socket. All
//! offsets are relative to the start of the Ethernet header.

use crate::addr::MacAddress;
use crate::net_util::icmpv6_checksum;
use std::fmt;
use std::net::Ipv6Addr;

pub const ETH_HLEN: usize = 14;
pub const ETH_ALEN: usize = 6;
pub const IPV6_HLEN: usize = 40;
pub const ICMPV6_HLEN: usize = 8;
pub const ETH_P_IPV6: u16 = 0x86DD;
pub const IPPROTO_ICMPV6: u8 = 58;

/// Largest frame the proxy reads
pub const IP_MAXPACKET: usize = 65535;

pub const ND_ROUTER_SOLICIT: u8 = 133;
pub const ND_ROUTER_ADVERT: u8 = 134;
pub const ND_NEIGHBOR_SOLICIT: u8 = 135;
pub const ND_NEIGHBOR_ADVERT: u8 = 136;

pub const ND_OPT_SOURCE_LINKADDR: u8 = 1;
pub const ND_OPT_TARGET_LINKADDR: u8 = 2;
pub const ND_OPT_PREFIX_INFORMATION: u8 = 3;

/// RA flags bit announcing the message was proxied
pub const ND_RA_FLAG_PROXY: u8 = 0x04;

const IP6_NXT_OFFSET: usize = ETH_HLEN + 6;
const IP6_SRC_OFFSET: usize = ETH_HLEN + 8;
const IP6_DST_OFFSET: usize = ETH_HLEN + 24;
const ICMP_OFFSET: usize = ETH_HLEN + IPV6_HLEN;
const ICMP_CKSUM_OFFSET: usize = ICMP_OFFSET + 2;
const RA_FLAGS_OFFSET: usize = ICMP_OFFSET + 5;
const PREFIX_INFO_LEN: usize = 32;

/// Length of the fixed ND header preceding the options, per message type
fn nd_header_len(icmp_type: u8) -> Option<usize> {
    match icmp_type {
        ND_ROUTER_SOLICIT => Some(8),
        ND_ROUTER_ADVERT => Some(16),
        ND_NEIGHBOR_SOLICIT | ND_NEIGHBOR_ADVERT => Some(24),
        _ => None,
    }
}

/// Reasons a frame cannot be proxied. Callers drop the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    NotIcmpv6Frame,
    NotNdFrame,
    InsufficientLength,
    BufferMisaligned,
}

impl TranslateError {
    /// Negative sentinel used in log lines
    pub const fn code(self) -> isize {
        match self {
            TranslateError::NotIcmpv6Frame => -1,
            TranslateError::NotNdFrame => -2,
            TranslateError::InsufficientLength => -3,
            TranslateError::BufferMisaligned => -4,
        }
    }
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TranslateError::NotIcmpv6Frame => "not an ICMPv6 frame",
            TranslateError::NotNdFrame => "not a neighbor discovery frame",
            TranslateError::InsufficientLength => "frame too short",
            TranslateError::BufferMisaligned => "frame buffer misaligned",
        };
        write!(f, "{} ({})", s, self.code())
    }
}

impl std::error::Error for TranslateError {}

/// Heap buffer whose usable region starts 2 bytes off a 4-byte boundary,
/// so that the IPv6 header following the Ethernet header is 4-aligned.
pub struct FrameBuffer {
    storage: Vec<u8>,
    offset: usize,
}

impl FrameBuffer {
    pub fn new(len: usize) -> Self {
        let storage = vec![0u8; len + 3];
        let addr = storage.as_ptr() as usize;
        let offset = 3 - ((addr + 1) & 3);
        Self { storage, offset }
    }

    pub fn len(&self) -> usize {
        self.storage.len() - 3
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        let len = self.len();
        &self.storage[self.offset..self.offset + len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len();
        &mut self.storage[self.offset..self.offset + len]
    }
}

fn is_aligned(buf: &[u8]) -> bool {
    (buf.as_ptr() as usize + ETH_HLEN) & 0x3 == 0
}

fn read_ipv6(frame: &[u8], offset: usize) -> Ipv6Addr {
    let mut b = [0u8; 16];
    b.copy_from_slice(&frame[offset..offset + 16]);
    Ipv6Addr::from(b)
}

/// Header fields the proxy needs before deciding where a frame goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdFrameInfo {
    pub icmp_type: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

/// Classify a received frame; `None` unless it is an ICMPv6 ND message.
pub fn parse_nd_frame(frame: &[u8]) -> Option<NdFrameInfo> {
    if frame.len() < ICMP_OFFSET + ICMPV6_HLEN {
        return None;
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETH_P_IPV6
        || frame[IP6_NXT_OFFSET] != IPPROTO_ICMPV6
    {
        return None;
    }
    let icmp_type = frame[ICMP_OFFSET];
    nd_header_len(icmp_type)?;
    Some(NdFrameInfo {
        icmp_type,
        src: read_ipv6(frame, IP6_SRC_OFFSET),
        dst: read_ipv6(frame, IP6_DST_OFFSET),
    })
}

/// Overwrite the link-layer address in every option of `opt_type`.
fn replace_mac_in_options(frame: &mut [u8], nd_hdr_len: usize, opt_type: u8, mac: MacAddress) {
    let mut pos = ICMP_OFFSET + nd_hdr_len;
    while pos + 2 <= frame.len() {
        let len = usize::from(frame[pos + 1]) * 8;
        if len == 0 {
            break;
        }
        if frame[pos] == opt_type && pos + 2 + ETH_ALEN <= frame.len() {
            frame[pos + 2..pos + 2 + ETH_ALEN].copy_from_slice(&mac.octets());
        }
        pos += len;
    }
}

/// Translate `input` into a frame to be sent on the interface owning
/// `local_mac`, writing it to `out` and returning its length.
///
/// `neighbor_lookup` resolves the IPv6 destination when the Ethernet
/// destination is unicast or broadcast; unresolved destinations are sent to
/// the broadcast address.
pub fn translate_nd_frame<F>(
    input: &[u8],
    local_mac: MacAddress,
    neighbor_lookup: F,
    out: &mut [u8],
) -> Result<usize, TranslateError>
where
    F: FnOnce(Ipv6Addr) -> Option<MacAddress>,
{
    if !is_aligned(input) || !is_aligned(out) {
        return Err(TranslateError::BufferMisaligned);
    }
    let len = input.len();
    if len < ICMP_OFFSET + ICMPV6_HLEN || out.len() < len {
        return Err(TranslateError::InsufficientLength);
    }
    if u16::from_be_bytes([input[12], input[13]]) != ETH_P_IPV6
        || input[IP6_NXT_OFFSET] != IPPROTO_ICMPV6
    {
        return Err(TranslateError::NotIcmpv6Frame);
    }

    let frame = &mut out[..len];
    frame.copy_from_slice(input);

    let dst_mac = MacAddress::new([frame[0], frame[1], frame[2], frame[3], frame[4], frame[5]]);
    if !dst_mac.is_multicast() || dst_mac.is_broadcast() {
        let resolved = neighbor_lookup(read_ipv6(frame, IP6_DST_OFFSET)).unwrap_or(MacAddress::BROADCAST);
        frame[..ETH_ALEN].copy_from_slice(&resolved.octets());
    }

    let icmp_type = frame[ICMP_OFFSET];
    let nd_hdr_len = nd_header_len(icmp_type).ok_or(TranslateError::NotNdFrame)?;
    match icmp_type {
        ND_ROUTER_ADVERT => {
            // Already-proxied RAs are forwarded again: host to VM to container
            // cascades only ever flow in one direction.
            frame[RA_FLAGS_OFFSET] |= ND_RA_FLAG_PROXY;
            replace_mac_in_options(frame, nd_hdr_len, ND_OPT_SOURCE_LINKADDR, local_mac);
        }
        ND_NEIGHBOR_ADVERT => {
            replace_mac_in_options(frame, nd_hdr_len, ND_OPT_TARGET_LINKADDR, local_mac);
        }
        _ => {
            replace_mac_in_options(frame, nd_hdr_len, ND_OPT_SOURCE_LINKADDR, local_mac);
        }
    }

    frame[ICMP_CKSUM_OFFSET] = 0;
    frame[ICMP_CKSUM_OFFSET + 1] = 0;
    let payload_len = usize::from(u16::from_be_bytes([frame[ETH_HLEN + 4], frame[ETH_HLEN + 5]]));
    let icmp_end = (ICMP_OFFSET + payload_len).min(len);
    let cksum = icmpv6_checksum(
        read_ipv6(frame, IP6_SRC_OFFSET),
        read_ipv6(frame, IP6_DST_OFFSET),
        &frame[ICMP_OFFSET..icmp_end],
    );
    frame[ICMP_CKSUM_OFFSET..ICMP_CKSUM_OFFSET + 2].copy_from_slice(&cksum.to_be_bytes());

    frame[ETH_ALEN..2 * ETH_ALEN].copy_from_slice(&local_mac.octets());
    Ok(len)
}

/// Prefix Information option carried by a router advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixInfo {
    pub prefix_len: u8,
    pub prefix: Ipv6Addr,
}

/// First well-formed Prefix Information option of an RA frame.
pub fn prefix_info_option(frame: &[u8]) -> Option<PrefixInfo> {
    let mut pos = ICMP_OFFSET + 16;
    while pos + 2 <= frame.len() {
        let len = usize::from(frame[pos + 1]) * 8;
        if len == 0 {
            break;
        }
        if frame[pos] == ND_OPT_PREFIX_INFORMATION
            && len == PREFIX_INFO_LEN
            && pos + PREFIX_INFO_LEN <= frame.len()
        {
            return Some(PrefixInfo {
                prefix_len: frame[pos + 2],
                prefix: read_ipv6(frame, pos + 16),
            });
        }
        pos += len;
    }
    None
}

/// Target address of a neighbor advertisement frame
pub fn neighbor_advert_target(frame: &[u8]) -> Option<Ipv6Addr> {
    if frame.len() < ICMP_OFFSET + 24 || frame[ICMP_OFFSET] != ND_NEIGHBOR_ADVERT {
        return None;
    }
    Some(read_ipv6(frame, ICMP_OFFSET + 8))
}

/// Global unicast (`2000::/3`) or unique local (`fc00::/7`)
pub fn is_guest_routable(addr: Ipv6Addr) -> bool {
    let first = addr.octets()[0];
    first & 0xe0 == 0x20 || first & 0xfe == 0xfc
}

#[cfg(test)]
mod tests {
    use super::*;

    // RS from fe80::1 to ff02::2 with a source link-layer option
    fn rs_frame() -> Vec<u8> {
        let mut f = vec![
            0x33, 0x33, 0x00, 0x00, 0x00, 0x02, // dst
            0x02, 0x11, 0x22, 0x33, 0x44, 0x55, // src
            0x86, 0xdd,
        ];
        f.extend_from_slice(&[0x60, 0, 0, 0, 0, 16, IPPROTO_ICMPV6, 255]);
        f.extend_from_slice(&"fe80::1".parse::<Ipv6Addr>().unwrap().octets());
        f.extend_from_slice(&"ff02::2".parse::<Ipv6Addr>().unwrap().octets());
        f.extend_from_slice(&[ND_ROUTER_SOLICIT, 0, 0, 0, 0, 0, 0, 0]);
        f.extend_from_slice(&[ND_OPT_SOURCE_LINKADDR, 1, 0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        f
    }

    fn aligned(frame: &[u8]) -> FrameBuffer {
        let mut buf = FrameBuffer::new(frame.len());
        buf.as_mut_slice().copy_from_slice(frame);
        buf
    }

    #[test]
    fn test_frame_buffer_alignment() {
        for len in [64, 100, 1500] {
            let buf = FrameBuffer::new(len);
            assert_eq!((buf.as_slice().as_ptr() as usize + ETH_HLEN) % 4, 0);
            assert_eq!(buf.len(), len);
        }
    }

    #[test]
    fn test_translate_rs() {
        let input = aligned(&rs_frame());
        let mut out = FrameBuffer::new(IP_MAXPACKET);
        let local = MacAddress::new([0x42, 0x37, 0x05, 0x13, 0x17, 0x01]);

        let len = translate_nd_frame(input.as_slice(), local, |_| None, out.as_mut_slice()).unwrap();
        let frame = &out.as_slice()[..len];

        // Multicast destination left alone
        assert_eq!(&frame[..6], &[0x33, 0x33, 0, 0, 0, 2]);
        assert_eq!(&frame[6..12], &local.octets());
        assert_eq!(&frame[64..70], &local.octets());

        let cksum = u16::from_be_bytes([frame[ICMP_CKSUM_OFFSET], frame[ICMP_CKSUM_OFFSET + 1]]);
        let mut zeroed = frame[ICMP_OFFSET..].to_vec();
        zeroed[2] = 0;
        zeroed[3] = 0;
        let expected = icmpv6_checksum(
            "fe80::1".parse().unwrap(),
            "ff02::2".parse().unwrap(),
            &zeroed,
        );
        assert_eq!(cksum, expected);
    }

    #[test]
    fn test_unicast_destination_resolved() {
        let mut raw = rs_frame();
        raw[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 9]);
        let input = aligned(&raw);
        let mut out = FrameBuffer::new(raw.len());
        let neighbor = MacAddress::new([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

        translate_nd_frame(input.as_slice(), MacAddress::default(), |_| Some(neighbor), out.as_mut_slice()).unwrap();
        assert_eq!(&out.as_slice()[..6], &neighbor.octets());

        translate_nd_frame(input.as_slice(), MacAddress::default(), |_| None, out.as_mut_slice()).unwrap();
        assert_eq!(&out.as_slice()[..6], &MacAddress::BROADCAST.octets());
    }

    #[test]
    fn test_translate_errors() {
        let mut out = FrameBuffer::new(IP_MAXPACKET);
        let mac = MacAddress::default();

        let short = aligned(&rs_frame()[..60]);
        assert_eq!(
            translate_nd_frame(short.as_slice(), mac, |_| None, out.as_mut_slice()),
            Err(TranslateError::InsufficientLength)
        );

        let mut raw = rs_frame();
        raw[IP6_NXT_OFFSET] = 17;
        let udp = aligned(&raw);
        assert_eq!(
            translate_nd_frame(udp.as_slice(), mac, |_| None, out.as_mut_slice()),
            Err(TranslateError::NotIcmpv6Frame)
        );

        let mut raw = rs_frame();
        raw[ICMP_OFFSET] = 128;
        let echo = aligned(&raw);
        assert_eq!(
            translate_nd_frame(echo.as_slice(), mac, |_| None, out.as_mut_slice()),
            Err(TranslateError::NotNdFrame)
        );

        let input = aligned(&rs_frame());
        let misaligned = &mut out.as_mut_slice()[1..];
        assert_eq!(
            translate_nd_frame(input.as_slice(), mac, |_| None, misaligned),
            Err(TranslateError::BufferMisaligned)
        );
    }

    #[test]
    fn test_guest_routable() {
        assert!(is_guest_routable("2001:db8::1".parse().unwrap()));
        assert!(is_guest_routable("fd00::1".parse().unwrap()));
        assert!(!is_guest_routable("fe80::1".parse().unwrap()));
        assert!(!is_guest_routable("ff02::1".parse().unwrap()));
    }

    #[test]
    fn test_parse_nd_frame() {
        let info = parse_nd_frame(&rs_frame()).unwrap();
        assert_eq!(info.icmp_type, ND_ROUTER_SOLICIT);
        assert_eq!(info.dst, "ff02::2".parse::<Ipv6Addr>().unwrap());
        assert!(parse_nd_frame(&rs_frame()[..40]).is_none());
    }
}
