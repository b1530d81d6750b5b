//! View of the host's managed network devices.
//!
//! A backend (see [`netlink`]) samples the system into [`Snapshot`]s;
//! [`ShillClient::apply`] diffs each snapshot against the previous state and
//! turns it into the ordered events the manager consumes.

pub mod netlink;

use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    #[default]
    Unknown,
    Cellular,
    Ethernet,
    EthernetEap,
    GuestInterface,
    Loopback,
    Ppp,
    PppOe,
    Tunnel,
    Vpn,
    Wifi,
}

impl DeviceType {
    /// Classify a device from its interface name prefix.
    pub fn from_ifname(ifname: &str) -> Self {
        const PREFIXES: [(&str, DeviceType); 6] = [
            ("eth", DeviceType::Ethernet),
            ("usb", DeviceType::Ethernet),
            ("wlan", DeviceType::Wifi),
            ("mlan", DeviceType::Wifi),
            ("wwan", DeviceType::Cellular),
            ("rmnet", DeviceType::Cellular),
        ];
        PREFIXES
            .iter()
            .find(|(p, _)| ifname.starts_with(p))
            .map_or(DeviceType::Unknown, |(_, t)| *t)
    }

    pub fn is_ethernet(self) -> bool {
        matches!(self, DeviceType::Ethernet | DeviceType::EthernetEap)
    }

    pub fn is_wifi(self) -> bool {
        self == DeviceType::Wifi
    }

    pub fn is_cellular(self) -> bool {
        self == DeviceType::Cellular
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// IP configuration of a device, one slot per family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpConfig {
    pub ipv4_prefix_length: u8,
    pub ipv4_address: String,
    pub ipv4_gateway: String,
    pub ipv4_dns_addresses: Vec<String>,

    pub ipv6_prefix_length: u8,
    pub ipv6_address: String,
    pub ipv6_gateway: String,
    pub ipv6_dns_addresses: Vec<String>,
}

/// One ipconfig object as reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawIpConfig {
    /// `ipv4`, `dhcp`, `bootp`, `zeroconf` or `ipv6`
    pub method: String,
    pub address: String,
    pub gateway: String,
    pub prefix_len: u8,
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl IpConfig {
    /// Fold the backend's ipconfig objects into one [`IpConfig`].
    ///
    /// Entries with an unknown method, a missing gateway, or an address and
    /// prefix length that do not form a network of the method's family are
    /// dropped, as is any second entry for a family.
    pub fn from_raw(ifname: &str, raw: &[RawIpConfig]) -> Self {
        let mut config = IpConfig::default();
        for entry in raw {
            let family = match entry.method.as_str() {
                "ipv4" | "dhcp" | "bootp" | "zeroconf" => Family::V4,
                "ipv6" => Family::V6,
                other => {
                    warn!("[{}]: unknown ipconfig method {:?}", ifname, other);
                    continue;
                }
            };
            let taken = match family {
                Family::V4 => !config.ipv4_address.is_empty(),
                Family::V6 => !config.ipv6_address.is_empty(),
            };
            if taken {
                warn!("[{}]: duplicated ipconfig for {}", ifname, entry.method);
                continue;
            }
            if entry.address.is_empty() || entry.gateway.is_empty() || entry.prefix_len == 0 {
                warn!("[{}]: incomplete {} ipconfig dropped", ifname, entry.method);
                continue;
            }
            let network = entry
                .address
                .parse::<IpAddr>()
                .ok()
                .and_then(|addr| IpNetwork::new(addr, entry.prefix_len).ok());
            if !network.is_some_and(|net| net.is_ipv4() == (family == Family::V4)) {
                warn!(
                    "[{}]: invalid {} address {}/{}",
                    ifname, entry.method, entry.address, entry.prefix_len
                );
                continue;
            }

            match family {
                Family::V4 => {
                    config.ipv4_address.clone_from(&entry.address);
                    config.ipv4_gateway.clone_from(&entry.gateway);
                    config.ipv4_prefix_length = entry.prefix_len;
                    config.ipv4_dns_addresses.clone_from(&entry.dns);
                }
                Family::V6 => {
                    config.ipv6_address.clone_from(&entry.address);
                    config.ipv6_gateway.clone_from(&entry.gateway);
                    config.ipv6_prefix_length = entry.prefix_len;
                    config.ipv6_dns_addresses.clone_from(&entry.dns);
                }
            }
        }
        config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShillDevice {
    pub ifname: String,
    pub device_type: DeviceType,
    pub ipconfig: IpConfig,
}

impl fmt::Display for ShillDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ifname: {}, type: {}}}", self.ifname, self.device_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub ifname: String,
    pub device_type: DeviceType,
    pub ipconfigs: Vec<RawIpConfig>,
}

/// Full state sampled from the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub devices: Vec<DeviceSnapshot>,
    /// Interface carrying the system default service, if any
    pub default_ifname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShillEvent {
    DevicesChanged {
        added: BTreeSet<String>,
        removed: BTreeSet<String>,
    },
    DefaultDeviceChanged {
        new: Option<ShillDevice>,
        prev: Option<ShillDevice>,
    },
    IpConfigsChanged {
        ifname: String,
        ipconfig: IpConfig,
    },
}

/// Last known device state.
#[derive(Debug, Default)]
pub struct ShillClient {
    devices: BTreeMap<String, ShillDevice>,
    default_device: Option<ShillDevice>,
}

impl ShillClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff `snapshot` against the current state.
    ///
    /// Events come out as: device set changes, then ipconfig changes of
    /// devices present before and after, then the default device change.
    pub fn apply(&mut self, snapshot: &Snapshot) -> Vec<ShillEvent> {
        let mut events = Vec::new();

        let new_devices: BTreeMap<String, ShillDevice> = snapshot
            .devices
            .iter()
            .map(|d| {
                let device = ShillDevice {
                    ifname: d.ifname.clone(),
                    device_type: d.device_type,
                    ipconfig: IpConfig::from_raw(&d.ifname, &d.ipconfigs),
                };
                (d.ifname.clone(), device)
            })
            .collect();

        let added: BTreeSet<String> = new_devices
            .keys()
            .filter(|k| !self.devices.contains_key(*k))
            .cloned()
            .collect();
        let removed: BTreeSet<String> = self
            .devices
            .keys()
            .filter(|k| !new_devices.contains_key(*k))
            .cloned()
            .collect();
        if !added.is_empty() || !removed.is_empty() {
            info!("Devices changed: added {:?}, removed {:?}", added, removed);
            events.push(ShillEvent::DevicesChanged { added, removed });
        }

        for (ifname, device) in &new_devices {
            if let Some(old) = self.devices.get(ifname) {
                if old.ipconfig != device.ipconfig {
                    events.push(ShillEvent::IpConfigsChanged {
                        ifname: ifname.clone(),
                        ipconfig: device.ipconfig.clone(),
                    });
                }
            }
        }
        self.devices = new_devices;

        // With no default service, fall back to the first known device
        let new_default = snapshot
            .default_ifname
            .as_ref()
            .and_then(|name| self.devices.get(name))
            .or_else(|| self.devices.values().next())
            .cloned();
        let changed = new_default.as_ref().map(|d| &d.ifname)
            != self.default_device.as_ref().map(|d| &d.ifname);
        if changed {
            info!(
                "Default device changed from {} to {}",
                self.default_device.as_ref().map_or("none".to_string(), ToString::to_string),
                new_default.as_ref().map_or("none".to_string(), ToString::to_string)
            );
            let prev = std::mem::replace(&mut self.default_device, new_default.clone());
            events.push(ShillEvent::DefaultDeviceChanged {
                new: new_default,
                prev,
            });
        } else if let Some(default) = new_default {
            // Keep the ipconfig of the default device current
            self.default_device = Some(default);
        }

        events
    }

    /// Report every known device as newly added.
    pub fn scan_devices(&self) -> ShillEvent {
        ShillEvent::DevicesChanged {
            added: self.devices.keys().cloned().collect(),
            removed: BTreeSet::new(),
        }
    }

    pub fn get_device_properties(&self, ifname: &str) -> Option<&ShillDevice> {
        self.devices.get(ifname)
    }

    pub fn has_device(&self, ifname: &str) -> bool {
        self.devices.contains_key(ifname)
    }

    pub fn devices(&self) -> impl Iterator<Item = &ShillDevice> {
        self.devices.values()
    }

    pub fn default_device(&self) -> Option<&ShillDevice> {
        self.default_device.as_ref()
    }
}
