use super::mac::{MacAddress, MacAddressGenerator};
use super::subnet::{Subnet, SubnetPool};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::debug;

/// Consumers of guest subnets. Each class owns a fixed slice of
/// `100.115.92.0/23`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestClass {
    /// Management interface of the Android container or VM
    ContainerAndroid,
    /// Android interface mirroring one physical uplink
    AndroidNet,
    /// Linux VM
    VmLinux,
    /// Pluggable VM; the only class allocating by index
    VmPlugin,
    /// Containers nested inside a Linux VM
    VmContainer,
    /// Client-owned namespace wired to the host
    MinijailNetns,
}

impl GuestClass {
    pub const ALL: [GuestClass; 6] = [
        GuestClass::ContainerAndroid,
        GuestClass::AndroidNet,
        GuestClass::VmLinux,
        GuestClass::VmPlugin,
        GuestClass::VmContainer,
        GuestClass::MinijailNetns,
    ];

    /// `(base, prefix length, slot count)`
    pub const fn plan(self) -> (Ipv4Addr, u8, usize) {
        match self {
            GuestClass::ContainerAndroid => (Ipv4Addr::new(100, 115, 92, 0), 30, 1),
            GuestClass::AndroidNet => (Ipv4Addr::new(100, 115, 92, 4), 30, 5),
            GuestClass::VmLinux => (Ipv4Addr::new(100, 115, 92, 24), 30, 26),
            GuestClass::MinijailNetns => (Ipv4Addr::new(100, 115, 92, 128), 30, 8),
            GuestClass::VmContainer => (Ipv4Addr::new(100, 115, 92, 192), 28, 4),
            GuestClass::VmPlugin => (Ipv4Addr::new(100, 115, 93, 0), 29, 32),
        }
    }
}

impl fmt::Display for GuestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Hands out guest subnets and MAC addresses.
///
/// Lives on the manager thread; subnets hold a reference to their pool and
/// return their slot on drop.
pub struct AddressManager {
    pools: HashMap<GuestClass, SubnetPool>,
    macs: MacAddressGenerator,
}

impl AddressManager {
    pub fn new() -> Self {
        let pools = GuestClass::ALL
            .iter()
            .map(|&class| {
                let (base, prefix_len, slots) = class.plan();
                (class, SubnetPool::new(base, prefix_len, slots))
            })
            .collect();

        Self {
            pools,
            macs: MacAddressGenerator::new(),
        }
    }

    /// Allocate a subnet for `class`.
    ///
    /// `index` (1-based) requests a specific slot and is only accepted for
    /// [`GuestClass::VmPlugin`].
    pub fn allocate_ipv4_subnet(&self, class: GuestClass, index: Option<u32>) -> Result<Subnet> {
        if index.is_some() && class != GuestClass::VmPlugin {
            return Err(Error::InvalidArgument(format!(
                "subnet indexing not supported for {class}"
            )));
        }

        let pool = self
            .pools
            .get(&class)
            .ok_or_else(|| Error::SubnetExhausted(class.to_string()))?;

        let subnet = pool
            .allocate(index)
            .ok_or_else(|| Error::SubnetExhausted(class.to_string()))?;

        debug!("Allocated {} for {}", subnet, class);
        Ok(subnet)
    }

    pub fn available(&self, class: GuestClass) -> usize {
        self.pools.get(&class).map_or(0, SubnetPool::available_count)
    }

    pub fn generate_mac_address(&mut self) -> MacAddress {
        self.macs.generate()
    }

    pub fn generate_stable_mac_address(&self, index: u32) -> MacAddress {
        MacAddressGenerator::generate_stable(index)
    }
}

impl Default for AddressManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_management_subnet() {
        let mgr = AddressManager::new();
        let subnet = mgr
            .allocate_ipv4_subnet(GuestClass::ContainerAndroid, None)
            .unwrap();
        assert_eq!(subnet.address_at_offset(0), Some(Ipv4Addr::new(100, 115, 92, 1)));
        assert_eq!(subnet.address_at_offset(1), Some(Ipv4Addr::new(100, 115, 92, 2)));

        let err = mgr
            .allocate_ipv4_subnet(GuestClass::ContainerAndroid, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SubnetExhausted);
    }

    #[test]
    fn test_index_only_for_plugin_vms() {
        let mgr = AddressManager::new();
        let err = mgr
            .allocate_ipv4_subnet(GuestClass::VmLinux, Some(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let subnet = mgr
            .allocate_ipv4_subnet(GuestClass::VmPlugin, Some(2))
            .unwrap();
        assert_eq!(subnet.base_address(), Ipv4Addr::new(100, 115, 93, 8));
    }

    #[test]
    fn test_release_on_drop() {
        let mgr = AddressManager::new();
        assert_eq!(mgr.available(GuestClass::MinijailNetns), 8);
        {
            let _s = mgr
                .allocate_ipv4_subnet(GuestClass::MinijailNetns, None)
                .unwrap();
            assert_eq!(mgr.available(GuestClass::MinijailNetns), 7);
        }
        assert_eq!(mgr.available(GuestClass::MinijailNetns), 8);
    }

    #[test]
    fn test_stable_mac_from_manager() {
        let mgr = AddressManager::new();
        assert_eq!(
            mgr.generate_stable_mac_address(3).to_string(),
            "42:37:05:13:17:03"
        );
    }
}
