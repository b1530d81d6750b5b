//! Guest network services: Android (container or VM) and other VMs.

pub mod arc;
pub mod crostini;

use crate::datapath::Datapath;
use crate::helper::HelperKind;
use crate::shill::ShillDevice;
use guestnet_common::addr::{AddressManager, MacAddress, Subnet};
use guestnet_common::ipc::DeviceMessage;
use guestnet_common::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{info, warn};

/// Shared state a guest service operates on, borrowed from the manager for
/// the duration of one call.
pub struct GuestContext<'a> {
    pub datapath: &'a Datapath,
    pub addrs: &'a mut AddressManager,
    pub forwarder: &'a mut Forwarder,
}

/// Reactions of a guest service to uplink changes and shutdown.
///
/// Start and stop take guest-specific arguments and stay on the services.
pub trait GuestService {
    fn on_devices_changed(&mut self, _ctx: &mut GuestContext<'_>, _added: &BTreeSet<String>, _removed: &BTreeSet<String>) {}

    fn on_default_device_changed(
        &mut self,
        _ctx: &mut GuestContext<'_>,
        _new: Option<&ShillDevice>,
        _prev: Option<&ShillDevice>,
    ) {
    }

    /// Stop every guest still running.
    fn shutdown(&mut self, ctx: &mut GuestContext<'_>);
}

/// Lifecycle of a guest as seen by its service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for GuestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestState::Stopped => write!(f, "Stopped"),
            GuestState::Starting => write!(f, "Starting"),
            GuestState::Started => write!(f, "Started"),
            GuestState::Stopping => write!(f, "Stopping"),
        }
    }
}

impl GuestState {
    /// Validate and apply a state transition.
    pub fn transition_to(&mut self, next: GuestState) -> anyhow::Result<()> {
        let is_valid = match (*self, next) {
            (GuestState::Stopped, GuestState::Starting) => true,
            (GuestState::Starting, GuestState::Started) => true,
            // Failed start
            (GuestState::Starting, GuestState::Stopped) => true,
            (GuestState::Started, GuestState::Stopping) => true,
            (GuestState::Stopping, GuestState::Stopped) => true,
            _ => false,
        };
        if !is_valid {
            anyhow::bail!("Invalid state transition from {} to {}", self, next);
        }
        *self = next;
        Ok(())
    }
}

/// Addressing of one guest-facing link. The subnet slot is held until the
/// config is dropped.
#[derive(Debug)]
pub struct DeviceConfig {
    pub mac: MacAddress,
    pub subnet: Subnet,
    pub host_ipv4: Ipv4Addr,
    pub guest_ipv4: Ipv4Addr,
    /// TAP carrying this link for VM guests
    pub tap_ifname: String,
}

impl DeviceConfig {
    pub fn new(subnet: Subnet, mac: MacAddress) -> Result<Self> {
        let (Some(host_ipv4), Some(guest_ipv4)) = (subnet.address_at_offset(0), subnet.address_at_offset(1)) else {
            return Err(Error::SubnetExhausted(format!(
                "subnet {} has no room for host and guest",
                subnet.cidr_string()
            )));
        };
        Ok(Self {
            mac,
            subnet,
            host_ipv4,
            guest_ipv4,
            tap_ifname: String::new(),
        })
    }

    pub fn prefix_len(&self) -> u8 {
        self.subnet.prefix_length()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceOptions {
    pub fwd_multicast: bool,
    pub ipv6_enabled: bool,
    pub adb_allowed: bool,
}

/// A guest link: uplink name, host-side interface, guest-side interface.
#[derive(Debug)]
pub struct Device {
    pub phys_ifname: String,
    pub host_ifname: String,
    pub guest_ifname: String,
    pub config: DeviceConfig,
    pub options: DeviceOptions,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{phys: {}, host: {}, guest: {}, host_ipv4: {}, guest_ipv4: {}, mac: {}",
            self.phys_ifname,
            self.host_ifname,
            self.guest_ifname,
            self.config.host_ipv4,
            self.config.guest_ipv4,
            self.config.mac
        )?;
        if !self.config.tap_ifname.is_empty() {
            write!(f, ", tap: {}", self.config.tap_ifname)?;
        }
        write!(f, "}}")
    }
}

/// Starts and stops IPv6 and multicast forwarding between an uplink and a
/// guest-facing interface.
///
/// Datapath changes happen immediately; the matching helper messages are
/// queued for the manager to deliver. Pairs that are still forwarding can be
/// queued again for a helper that lost its state.
#[derive(Debug, Default)]
pub struct Forwarder {
    pending: Vec<(HelperKind, DeviceMessage)>,
    active: Vec<(HelperKind, DeviceMessage)>,
}

impl Forwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_forwarding(&mut self, datapath: &Datapath, phys: &str, virt: &str, ipv6: bool, multicast: bool) {
        if phys.is_empty() || virt.is_empty() {
            return;
        }
        let msg = DeviceMessage {
            dev_ifname: phys.to_string(),
            br_ifname: virt.to_string(),
            teardown: false,
        };

        if ipv6 {
            info!("Starting IPv6 forwarding from {} to {}", phys, virt);
            if let Err(e) = datapath.add_ipv6_forwarding(phys, virt) {
                warn!("Failed to set up IPv6 forwarding rules: {:#}", e);
            }
            for ifname in [phys, virt] {
                if let Err(e) = datapath.mask_interface_flags(ifname, libc::IFF_ALLMULTI, 0) {
                    warn!("Failed to enable all-multicast on {}: {:#}", ifname, e);
                }
            }
            self.queue(HelperKind::NdProxy, &msg);
        }
        if multicast {
            info!("Starting multicast forwarding from {} to {}", phys, virt);
            self.queue(HelperKind::McastProxy, &msg);
        }
    }

    /// An empty `virt` stops forwarding for every guest of `phys`.
    pub fn stop_forwarding(&mut self, datapath: &Datapath, phys: &str, virt: &str, ipv6: bool, multicast: bool) {
        if phys.is_empty() {
            return;
        }
        let msg = DeviceMessage {
            dev_ifname: phys.to_string(),
            br_ifname: virt.to_string(),
            teardown: true,
        };

        if ipv6 {
            if virt.is_empty() {
                info!("Stopping IPv6 forwarding on {}", phys);
            } else {
                info!("Stopping IPv6 forwarding from {} to {}", phys, virt);
                datapath.remove_ipv6_forwarding(phys, virt);
            }
            self.queue(HelperKind::NdProxy, &msg);
        }
        if multicast {
            info!("Stopping multicast forwarding on {}", phys);
            self.queue(HelperKind::McastProxy, &msg);
        }
    }

    fn queue(&mut self, kind: HelperKind, msg: &DeviceMessage) {
        if msg.teardown {
            // An empty bridge name matches every guest of the uplink
            let stopped = |m: &DeviceMessage| {
                m.dev_ifname == msg.dev_ifname && (msg.br_ifname.is_empty() || m.br_ifname == msg.br_ifname)
            };
            self.active.retain(|(k, m)| *k != kind || !stopped(m));
        } else if !self.active.iter().any(|(k, m)| *k == kind && m == msg) {
            self.active.push((kind, msg.clone()));
        }
        self.pending.push((kind, msg.clone()));
    }

    /// Queue every active pair for `kind` again.
    pub fn replay(&mut self, kind: HelperKind) {
        let active: Vec<_> = self.active.iter().filter(|(k, _)| *k == kind).cloned().collect();
        if !active.is_empty() {
            info!("Replaying {} forwarding pairs to {}", active.len(), kind.name());
        }
        self.pending.extend(active);
    }

    pub fn take_pending(&mut self) -> Vec<(HelperKind, DeviceMessage)> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Forwarder, GuestContext};
    use crate::datapath::testing::FakeHost;
    use crate::datapath::Datapath;
    use guestnet_common::addr::AddressManager;

    /// Everything a guest service needs, backed by a [`FakeHost`].
    pub struct Fixture {
        pub host: FakeHost,
        pub datapath: Datapath,
        pub addrs: AddressManager,
        pub forwarder: Forwarder,
    }

    impl Fixture {
        pub fn new() -> Self {
            let host = FakeHost::new();
            let datapath = host.datapath();
            Self {
                host,
                datapath,
                addrs: AddressManager::new(),
                forwarder: Forwarder::new(),
            }
        }

        pub fn ctx(&mut self) -> GuestContext<'_> {
            GuestContext {
                datapath: &self.datapath,
                addrs: &mut self.addrs,
                forwarder: &mut self.forwarder,
            }
        }
    }
}
