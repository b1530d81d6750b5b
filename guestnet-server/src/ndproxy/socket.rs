//! Raw AF_PACKET socket receiving only ICMPv6 neighbor discovery frames.
#![allow(unsafe_code)]

use guestnet_common::ndp::{ETH_ALEN, ETH_P_IPV6};
use socket2::{Domain, Protocol, Socket, Type};
use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tracing::debug;

const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_JGT: u16 = 0x20;
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;

const fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt: 0, jf: 0, k }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Accept IPv6 frames carrying ICMPv6 types 133 to 136 with no extension
/// headers.
pub const ND_FILTER: [libc::sock_filter; 9] = [
    stmt(BPF_LD | BPF_H | BPF_ABS, 12),
    jump(BPF_JMP | BPF_JEQ | BPF_K, ETH_P_IPV6 as u32, 0, 6),
    stmt(BPF_LD | BPF_B | BPF_ABS, 20),
    jump(BPF_JMP | BPF_JEQ | BPF_K, 58, 0, 4),
    stmt(BPF_LD | BPF_B | BPF_ABS, 54),
    jump(BPF_JMP | BPF_JGE | BPF_K, 133, 0, 2),
    jump(BPF_JMP | BPF_JGT | BPF_K, 136, 1, 0),
    stmt(BPF_RET | BPF_K, 0xffff),
    stmt(BPF_RET | BPF_K, 0),
];

fn sockaddr_ll(ifindex: u32) -> libc::sockaddr_ll {
    // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ETH_P_IPV6.to_be();
    addr.sll_ifindex = ifindex as i32;
    addr
}

pub struct NdSocket {
    fd: AsyncFd<OwnedFd>,
}

impl NdSocket {
    pub fn open() -> io::Result<Self> {
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(ETH_P_IPV6.to_be()))),
        )?;
        socket.set_nonblocking(true)?;

        let mut filter = ND_FILTER;
        let prog = libc::sock_fprog {
            len: filter.len() as u16,
            filter: filter.as_mut_ptr(),
        };
        // SAFETY: prog points at a live filter array for the duration of
        // the call and the kernel copies it.
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                std::ptr::addr_of!(prog).cast(),
                std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::new(OwnedFd::from(socket))?,
        })
    }

    /// Receive one inbound frame and the index of the interface it arrived on.
    /// Frames the host itself transmitted are skipped.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, u32)> {
        loop {
            let mut guard = self.fd.readable().await?;
            let res = guard.try_io(|fd| {
                let mut from = sockaddr_ll(0);
                let mut from_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                // SAFETY: buf and from are valid for writes of the lengths passed.
                let ret = unsafe {
                    libc::recvfrom(
                        fd.as_raw_fd(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                        0,
                        std::ptr::addr_of_mut!(from).cast(),
                        &mut from_len,
                    )
                };
                if ret < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok((ret as usize, from))
            });
            match res {
                Ok(Ok((n, from))) => {
                    if from.sll_pkttype == libc::PACKET_OUTGOING as u8 {
                        continue;
                    }
                    return Ok((n, from.sll_ifindex as u32));
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Transmit `frame` on `ifindex`. The link-layer destination is taken
    /// from the frame itself.
    pub async fn send(&self, ifindex: u32, frame: &[u8]) -> io::Result<()> {
        if frame.len() < ETH_ALEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too short"));
        }
        let mut to = sockaddr_ll(ifindex);
        to.sll_halen = ETH_ALEN as u8;
        to.sll_addr[..ETH_ALEN].copy_from_slice(&frame[..ETH_ALEN]);

        loop {
            let mut guard = self.fd.writable().await?;
            let res = guard.try_io(|fd| {
                // SAFETY: frame and to are valid for reads of the lengths passed.
                let ret = unsafe {
                    libc::sendto(
                        fd.as_raw_fd(),
                        frame.as_ptr().cast(),
                        frame.len(),
                        0,
                        std::ptr::addr_of!(to).cast(),
                        std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                    )
                };
                if ret < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(ret as usize)
            });
            match res {
                Ok(Ok(n)) => {
                    debug!("Sent {} bytes on {}", n, ifindex);
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

pub fn ifindex_to_name(ifindex: u32) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: buf holds IF_NAMESIZE bytes as if_indextoname requires.
    let ret = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr()) };
    if ret.is_null() {
        return None;
    }
    // SAFETY: on success buf holds a NUL-terminated name.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    name.to_str().ok().map(str::to_string)
}

pub fn name_to_ifindex(ifname: &str) -> Option<u32> {
    nix::net::if_::if_nametoindex(ifname).ok().filter(|&i| i != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Evaluate a classic BPF program built from the opcodes above.
    fn run_filter(prog: &[libc::sock_filter], pkt: &[u8]) -> u32 {
        let mut acc: u32 = 0;
        let mut pc = 0;
        loop {
            let insn = prog[pc];
            pc += 1;
            let k = insn.k as usize;
            match insn.code {
                c if c == BPF_LD | BPF_H | BPF_ABS => {
                    if k + 2 > pkt.len() {
                        return 0;
                    }
                    acc = u32::from(u16::from_be_bytes([pkt[k], pkt[k + 1]]));
                }
                c if c == BPF_LD | BPF_B | BPF_ABS => {
                    if k >= pkt.len() {
                        return 0;
                    }
                    acc = u32::from(pkt[k]);
                }
                c if c & 0x07 == BPF_JMP => {
                    let taken = match c & 0xf0 {
                        BPF_JEQ => acc == insn.k,
                        BPF_JGT => acc > insn.k,
                        BPF_JGE => acc >= insn.k,
                        _ => unreachable!(),
                    };
                    pc += usize::from(if taken { insn.jt } else { insn.jf });
                }
                c if c & 0x07 == BPF_RET => return insn.k,
                _ => unreachable!(),
            }
        }
    }

    fn packet(ethertype: u16, next_header: u8, icmp_type: u8) -> Vec<u8> {
        let mut p = vec![0u8; 62];
        p[12..14].copy_from_slice(&ethertype.to_be_bytes());
        p[20] = next_header;
        p[54] = icmp_type;
        p
    }

    #[test]
    fn test_filter_accepts_nd_types() {
        for t in 133..=136 {
            assert_ne!(run_filter(&ND_FILTER, &packet(0x86dd, 58, t)), 0, "type {t}");
        }
    }

    #[test]
    fn test_filter_rejects_other_frames() {
        assert_eq!(run_filter(&ND_FILTER, &packet(0x86dd, 58, 128)), 0);
        assert_eq!(run_filter(&ND_FILTER, &packet(0x86dd, 58, 137)), 0);
        assert_eq!(run_filter(&ND_FILTER, &packet(0x86dd, 17, 134)), 0);
        assert_eq!(run_filter(&ND_FILTER, &packet(0x0800, 58, 134)), 0);
        assert_eq!(run_filter(&ND_FILTER, &[0u8; 10]), 0);
    }

    #[test]
    fn test_loopback_index_resolves() {
        let idx = name_to_ifindex("lo").unwrap();
        assert_eq!(ifindex_to_name(idx).as_deref(), Some("lo"));
        assert!(name_to_ifindex("nonexistent0").is_none());
    }

    #[tokio::test]
    #[ignore] // Requires root privileges
    async fn test_open_socket() {
        NdSocket::open().unwrap();
    }
}
