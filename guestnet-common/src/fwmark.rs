//! Packet mark layout shared by the packet filter rules, the routing
//! intent API, and the counters service.

use std::fmt;

/// Set on every packet entering from a guest-facing bridge
pub const GUEST_TRAFFIC_MARK: u32 = 0x1;
pub const GUEST_TRAFFIC_MASK: u32 = 0x1;

pub const ROUTE_ON_VPN: u32 = 0x8000_0000;
pub const BYPASS_VPN: u32 = 0x4000_0000;
pub const VPN_MASK: u32 = 0xC000_0000;

pub const SOURCE_MASK: u32 = 0x0000_3f00;
const SOURCE_SHIFT: u32 = 8;

/// Who originated a flow. Encoded into the mark and reported by counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrafficSource {
    Unknown,
    Chrome,
    User,
    Update,
    SystemVpn,
    HostVpn,
    Arc,
    CrosVm,
    PluginVm,
}

impl TrafficSource {
    pub const ALL: [TrafficSource; 9] = [
        TrafficSource::Unknown,
        TrafficSource::Chrome,
        TrafficSource::User,
        TrafficSource::Update,
        TrafficSource::SystemVpn,
        TrafficSource::HostVpn,
        TrafficSource::Arc,
        TrafficSource::CrosVm,
        TrafficSource::PluginVm,
    ];

    const fn tag(self) -> u32 {
        match self {
            TrafficSource::Unknown => 0x00,
            TrafficSource::Chrome => 0x01,
            TrafficSource::User => 0x02,
            TrafficSource::Update => 0x03,
            TrafficSource::SystemVpn => 0x04,
            TrafficSource::HostVpn => 0x05,
            TrafficSource::Arc => 0x20,
            TrafficSource::CrosVm => 0x21,
            TrafficSource::PluginVm => 0x22,
        }
    }

    /// Mark value with only the source bits set
    pub const fn fwmark(self) -> u32 {
        self.tag() << SOURCE_SHIFT
    }

    pub fn from_fwmark(mark: u32) -> Option<Self> {
        let bits = mark & SOURCE_MASK;
        Self::ALL.iter().copied().find(|s| s.fwmark() == bits)
    }

    /// `value/mask` form used in iptables arguments
    pub fn mark_arg(self) -> String {
        format!("0x{:x}/0x{:x}", self.fwmark(), SOURCE_MASK)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficSource::Unknown => "unknown",
            TrafficSource::Chrome => "chrome",
            TrafficSource::User => "user",
            TrafficSource::Update => "update",
            TrafficSource::SystemVpn => "system_vpn",
            TrafficSource::HostVpn => "host_vpn",
            TrafficSource::Arc => "arc",
            TrafficSource::CrosVm => "crosvm",
            TrafficSource::PluginVm => "pluginvm",
        }
    }
}

impl fmt::Display for TrafficSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-socket routing intent relative to VPNs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VpnRoutingPolicy {
    DefaultRouting,
    RouteOnVpn,
    BypassVpn,
}

impl VpnRoutingPolicy {
    const fn bits(self) -> u32 {
        match self {
            VpnRoutingPolicy::DefaultRouting => 0,
            VpnRoutingPolicy::RouteOnVpn => ROUTE_ON_VPN,
            VpnRoutingPolicy::BypassVpn => BYPASS_VPN,
        }
    }

    /// Replace the VPN bits of `mark`, keeping every other bit.
    pub const fn apply(self, mark: u32) -> u32 {
        (mark & !VPN_MASK) | self.bits()
    }
}
