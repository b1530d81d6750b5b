//! Interface and route ioctls that have no command-line equivalent worth
//! spawning a process for.

#![allow(unsafe_code)]

use anyhow::{Context, Result};
use guestnet_common::addr::MacAddress;
use guestnet_common::net_util::{ipv4_netmask, IFNAMSIZ};
use nix::errno::Errno;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use std::fs::{File, OpenOptions};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use tracing::{info, warn};

/// Default template handed to the kernel when no TAP name is requested
pub const TAP_TEMPLATE: &str = "vmtap%d";

/// Parameters of a persistent TAP device
#[derive(Debug, Clone, Default)]
pub struct TapRequest<'a> {
    /// Exact name or a `%d` template; empty selects [`TAP_TEMPLATE`]
    pub name: &'a str,
    pub mac: Option<MacAddress>,
    pub ipv4: Option<(Ipv4Addr, u8)>,
    pub owner_uid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Delete,
}

/// IPv4 route in gateway form (`gateway` set) or device form (`dev` set)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Route {
    pub dst: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub dev: Option<String>,
}

impl Ipv4Route {
    pub fn via(gateway: Ipv4Addr, dst: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            dst,
            prefix_len,
            gateway: Some(gateway),
            dev: None,
        }
    }

    pub fn dev(ifname: &str, dst: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            dst,
            prefix_len,
            gateway: None,
            dev: Some(ifname.to_string()),
        }
    }
}

/// Kernel-facing operations of the datapath.
pub trait NetKernel {
    /// Create a persistent TAP device and return its actual name.
    fn create_tap(&self, req: &TapRequest<'_>) -> Result<String>;
    fn interface_flags(&self, ifname: &str) -> Result<i32>;
    fn set_interface_flags(&self, ifname: &str, flags: i32) -> Result<()>;
    fn interface_mac(&self, ifname: &str) -> Result<MacAddress>;
    /// Adding an existing route or deleting a missing one succeeds.
    fn modify_route(&self, op: RouteOp, route: &Ipv4Route) -> Result<()>;
    fn lookup_uid(&self, user: &str) -> Result<u32>;
    /// Whether `pid` is alive and has a network namespace
    fn has_netns(&self, pid: i32) -> bool;
    /// Create the network-ready marker in the root filesystem of `pid`.
    fn write_sentinel(&self, pid: i32) -> Result<()>;
}

pub const SENTINEL_PATH: &str = "dev/.arc_network_ready";

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const RTF_UP: u16 = 0x0001;
const RTF_GATEWAY: u16 = 0x0002;
const ARPHRD_ETHER: libc::sa_family_t = 1;

nix::ioctl_readwrite_bad!(tunsetiff, TUNSETIFF, libc::ifreq);
nix::ioctl_write_int!(tunsetpersist, b'T', 203);
nix::ioctl_write_int!(tunsetowner, b'T', 204);
nix::ioctl_read_bad!(siocgifflags, libc::SIOCGIFFLAGS, libc::ifreq);
nix::ioctl_write_ptr_bad!(siocsifflags, libc::SIOCSIFFLAGS, libc::ifreq);
nix::ioctl_write_ptr_bad!(siocsifaddr, libc::SIOCSIFADDR, libc::ifreq);
nix::ioctl_write_ptr_bad!(siocsifnetmask, libc::SIOCSIFNETMASK, libc::ifreq);
nix::ioctl_write_ptr_bad!(siocsifhwaddr, libc::SIOCSIFHWADDR, libc::ifreq);
nix::ioctl_read_bad!(siocgifhwaddr, libc::SIOCGIFHWADDR, libc::ifreq);
nix::ioctl_write_ptr_bad!(siocaddrt, libc::SIOCADDRT, RtEntry);
nix::ioctl_write_ptr_bad!(siocdelrt, libc::SIOCDELRT, RtEntry);

/// `struct rtentry` from `<linux/route.h>`
#[repr(C)]
struct RtEntry {
    rt_pad1: libc::c_ulong,
    rt_dst: libc::sockaddr,
    rt_gateway: libc::sockaddr,
    rt_genmask: libc::sockaddr,
    rt_flags: libc::c_ushort,
    rt_pad2: libc::c_short,
    rt_pad3: libc::c_ulong,
    rt_pad4: *mut libc::c_void,
    rt_metric: libc::c_short,
    rt_dev: *mut libc::c_char,
    rt_mtu: libc::c_ulong,
    rt_window: libc::c_ulong,
    rt_irtt: libc::c_ushort,
}

fn ifreq(ifname: &str) -> Result<libc::ifreq> {
    if ifname.len() >= IFNAMSIZ {
        anyhow::bail!("interface name {} is too long", ifname);
    }
    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.bytes()) {
        *dst = src as libc::c_char;
    }
    Ok(ifr)
}

fn ifreq_name(ifr: &libc::ifreq) -> String {
    let bytes: Vec<u8> = ifr
        .ifr_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    };
    // SAFETY: sockaddr_in and sockaddr have the same size and sockaddr is
    // the generic view of any socket address.
    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

fn control_socket() -> Result<OwnedFd> {
    socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("Failed to open ioctl socket")
}

/// [`NetKernel`] issuing real ioctls.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxKernel;

impl LinuxKernel {
    fn set_address(fd: &OwnedFd, ifname: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
        let mut ifr = ifreq(ifname)?;
        ifr.ifr_ifru.ifru_addr = sockaddr_in(addr);
        // SAFETY: fd is a valid socket and ifr outlives the call.
        unsafe { siocsifaddr(fd.as_raw_fd(), &ifr) }
            .with_context(|| format!("SIOCSIFADDR {addr} on {ifname}"))?;

        let mut ifr = ifreq(ifname)?;
        ifr.ifr_ifru.ifru_netmask = sockaddr_in(ipv4_netmask(prefix_len));
        // SAFETY: as above.
        unsafe { siocsifnetmask(fd.as_raw_fd(), &ifr) }
            .with_context(|| format!("SIOCSIFNETMASK /{prefix_len} on {ifname}"))?;
        Ok(())
    }

    /// Owner, address, MAC and link state of a freshly persisted TAP.
    fn configure_tap(&self, tun: &File, ifname: &str, req: &TapRequest<'_>) -> Result<()> {
        if let Some(uid) = req.owner_uid {
            // SAFETY: tun is an attached tun device and outlives the call.
            unsafe { tunsetowner(tun.as_raw_fd(), libc::c_ulong::from(uid)) }
                .with_context(|| format!("TUNSETOWNER {uid} on {ifname}"))?;
        }

        let sock = control_socket()?;
        if let Some((addr, prefix_len)) = req.ipv4 {
            Self::set_address(&sock, ifname, addr, prefix_len)?;
        }
        if let Some(mac) = req.mac {
            Self::set_mac(&sock, ifname, mac)?;
        }
        let flags = self.interface_flags(ifname)?;
        self.set_interface_flags(ifname, flags | libc::IFF_UP | libc::IFF_RUNNING)
    }

    fn set_mac(fd: &OwnedFd, ifname: &str, mac: MacAddress) -> Result<()> {
        let mut ifr = ifreq(ifname)?;
        // SAFETY: zeroed sockaddr is valid; only the hwaddr arm is written.
        let mut hw: libc::sockaddr = unsafe { std::mem::zeroed() };
        hw.sa_family = ARPHRD_ETHER;
        for (dst, src) in hw.sa_data.iter_mut().zip(mac.octets()) {
            *dst = src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_hwaddr = hw;
        // SAFETY: fd is a valid socket and ifr outlives the call.
        unsafe { siocsifhwaddr(fd.as_raw_fd(), &ifr) }
            .with_context(|| format!("SIOCSIFHWADDR {mac} on {ifname}"))?;
        Ok(())
    }
}

impl NetKernel for LinuxKernel {
    fn create_tap(&self, req: &TapRequest<'_>) -> Result<String> {
        let tun = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .context("Failed to open /dev/net/tun")?;

        let template = if req.name.is_empty() { TAP_TEMPLATE } else { req.name };
        let mut ifr = ifreq(template)?;
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

        // SAFETY: tun is an open tun device and ifr outlives the call; the
        // kernel writes the allocated name back into ifr.
        unsafe { tunsetiff(tun.as_raw_fd(), &mut ifr) }.context("TUNSETIFF failed")?;
        let ifname = ifreq_name(&ifr);

        // SAFETY: tun is an attached tun device for the calls below.
        unsafe { tunsetpersist(tun.as_raw_fd(), 1) }
            .with_context(|| format!("TUNSETPERSIST on {ifname}"))?;

        // Once persistent the device outlives `tun`, so undo that on failure.
        if let Err(e) = self.configure_tap(&tun, &ifname, req) {
            // SAFETY: tun is still attached to the device.
            if let Err(pe) = unsafe { tunsetpersist(tun.as_raw_fd(), 0) } {
                warn!("Failed to clear persistence on {}: {}", ifname, pe);
            }
            return Err(e);
        }

        info!("Created TAP device: {}", ifname);
        Ok(ifname)
    }

    fn interface_flags(&self, ifname: &str) -> Result<i32> {
        let sock = control_socket()?;
        let mut ifr = ifreq(ifname)?;
        // SAFETY: sock is a valid socket and ifr outlives the call.
        unsafe { siocgifflags(sock.as_raw_fd(), &mut ifr) }
            .with_context(|| format!("SIOCGIFFLAGS on {ifname}"))?;
        // SAFETY: SIOCGIFFLAGS fills the flags arm.
        Ok(i32::from(unsafe { ifr.ifr_ifru.ifru_flags }))
    }

    fn set_interface_flags(&self, ifname: &str, flags: i32) -> Result<()> {
        let sock = control_socket()?;
        let mut ifr = ifreq(ifname)?;
        ifr.ifr_ifru.ifru_flags = flags as libc::c_short;
        // SAFETY: sock is a valid socket and ifr outlives the call.
        unsafe { siocsifflags(sock.as_raw_fd(), &ifr) }
            .with_context(|| format!("SIOCSIFFLAGS {flags:#x} on {ifname}"))?;
        Ok(())
    }

    fn interface_mac(&self, ifname: &str) -> Result<MacAddress> {
        let sock = control_socket()?;
        let mut ifr = ifreq(ifname)?;
        // SAFETY: sock is a valid socket and ifr outlives the call.
        unsafe { siocgifhwaddr(sock.as_raw_fd(), &mut ifr) }
            .with_context(|| format!("SIOCGIFHWADDR on {ifname}"))?;
        // SAFETY: SIOCGIFHWADDR fills the hwaddr arm.
        let data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
        let mut octets = [0u8; 6];
        for (dst, src) in octets.iter_mut().zip(data) {
            *dst = src as u8;
        }
        Ok(MacAddress::new(octets))
    }

    fn modify_route(&self, op: RouteOp, route: &Ipv4Route) -> Result<()> {
        let mut dev_name = route
            .dev
            .as_deref()
            .map(|d| {
                let mut v = d.as_bytes().to_vec();
                v.push(0);
                v
            });

        // SAFETY: RtEntry is plain old data; all-zero is a valid value.
        let mut rt: RtEntry = unsafe { std::mem::zeroed() };
        rt.rt_dst = sockaddr_in(route.dst);
        rt.rt_genmask = sockaddr_in(ipv4_netmask(route.prefix_len));
        rt.rt_flags = RTF_UP;
        if let Some(gw) = route.gateway {
            rt.rt_gateway = sockaddr_in(gw);
            rt.rt_flags |= RTF_GATEWAY;
        }
        if let Some(name) = dev_name.as_mut() {
            rt.rt_dev = name.as_mut_ptr().cast();
        }

        let sock = control_socket()?;
        // SAFETY: sock is a valid socket; rt and the device name buffer
        // outlive the call.
        let res = unsafe {
            match op {
                RouteOp::Add => siocaddrt(sock.as_raw_fd(), &rt),
                RouteOp::Delete => siocdelrt(sock.as_raw_fd(), &rt),
            }
        };
        match (op, res) {
            (_, Ok(_)) | (RouteOp::Add, Err(Errno::EEXIST)) | (RouteOp::Delete, Err(Errno::ESRCH)) => Ok(()),
            (_, Err(e)) => Err(anyhow::anyhow!("{:?} route {:?} failed: {}", op, route, e)),
        }
    }

    fn lookup_uid(&self, user: &str) -> Result<u32> {
        let user_entry = nix::unistd::User::from_name(user)
            .with_context(|| format!("Failed to look up user {user}"))?
            .ok_or_else(|| anyhow::anyhow!("Unknown user {}", user))?;
        Ok(user_entry.uid.as_raw())
    }

    fn has_netns(&self, pid: i32) -> bool {
        pid > 0 && Path::new(&format!("/proc/{pid}/ns/net")).exists()
    }

    fn write_sentinel(&self, pid: i32) -> Result<()> {
        let path = Path::new("/proc").join(pid.to_string()).join("root").join(SENTINEL_PATH);
        std::fs::write(&path, b"")
            .with_context(|| format!("Failed to create {}", path.display()))
    }
}
