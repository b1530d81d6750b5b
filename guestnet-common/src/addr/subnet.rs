use crate::net_util::{ipv4_broadcast, ipv4_netmask};
use bitvec::prelude::*;
use std::cell::RefCell;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;

/// Pool of equally sized, contiguous IPv4 subnets.
///
/// Slot `i` covers `base + i * size .. base + (i + 1) * size`. Allocated
/// slots are tracked in a bitmap shared with every live [`Subnet`] so that
/// dropping a subnet hands its slot back.
pub struct SubnetPool {
    base: u32,
    prefix_len: u8,
    slots: Rc<RefCell<BitVec>>,
}

impl SubnetPool {
    /// Create a pool of `num_subnets` subnets of size `/prefix_len` starting at `base`
    pub fn new(base: Ipv4Addr, prefix_len: u8, num_subnets: usize) -> Self {
        Self {
            base: u32::from(base),
            prefix_len,
            slots: Rc::new(RefCell::new(bitvec![0; num_subnets])),
        }
    }

    /// Allocate a subnet.
    ///
    /// With `None` the lowest free slot is handed out. With `Some(i)` the
    /// 1-based slot `i` is reserved if it is free. Returns `None` when the
    /// requested slot is taken or out of range, or when the pool is full.
    pub fn allocate(&self, index: Option<u32>) -> Option<Subnet> {
        let mut slots = self.slots.borrow_mut();

        let slot = match index {
            None => slots.first_zero()?,
            Some(0) => return None,
            Some(i) => {
                let slot = (i - 1) as usize;
                if slot >= slots.len() || slots[slot] {
                    return None;
                }
                slot
            }
        };

        slots.set(slot, true);

        let size = 1u32 << (32 - u32::from(self.prefix_len));
        Some(Subnet {
            base: self.base + slot as u32 * size,
            prefix_len: self.prefix_len,
            slot,
            pool: Rc::clone(&self.slots),
        })
    }

    /// Number of slots in the pool
    pub fn capacity(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Number of free slots
    pub fn available_count(&self) -> usize {
        self.slots.borrow().count_zeros()
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn base_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }
}

/// One reserved slot of a [`SubnetPool`]. Released when dropped.
pub struct Subnet {
    base: u32,
    prefix_len: u8,
    slot: usize,
    pool: Rc<RefCell<BitVec>>,
}

impl Subnet {
    pub fn base_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    pub fn prefix_length(&self) -> u8 {
        self.prefix_len
    }

    pub fn netmask(&self) -> Ipv4Addr {
        ipv4_netmask(self.prefix_len)
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        ipv4_broadcast(self.base_address(), self.prefix_len)
    }

    /// Number of usable host addresses (network and broadcast excluded)
    pub fn available_count(&self) -> u32 {
        (1u32 << (32 - u32::from(self.prefix_len))) - 2
    }

    /// Usable address at `offset`; offset 0 is the first host address.
    pub fn address_at_offset(&self, offset: u32) -> Option<Ipv4Addr> {
        if offset >= self.available_count() {
            return None;
        }
        Some(Ipv4Addr::from(self.base + offset + 1))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.netmask()) == self.base
    }

    /// Base address in CIDR notation, e.g. `100.115.92.4/30`
    pub fn cidr_string(&self) -> String {
        format!("{}/{}", self.base_address(), self.prefix_len)
    }

    /// Zero-based slot within the owning pool
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for Subnet {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.pool.try_borrow_mut() {
            slots.set(self.slot, false);
        }
    }
}

impl fmt::Debug for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subnet({})", self.cidr_string())
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cidr_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool() -> SubnetPool {
        SubnetPool::new(Ipv4Addr::new(100, 115, 92, 4), 30, 5)
    }

    #[test]
    fn test_allocate_first_subnet() {
        let pool = pool();
        let subnet = pool.allocate(None).unwrap();
        assert_eq!(subnet.base_address(), Ipv4Addr::new(100, 115, 92, 4));
        assert_eq!(subnet.address_at_offset(0), Some(Ipv4Addr::new(100, 115, 92, 5)));
        assert_eq!(subnet.address_at_offset(1), Some(Ipv4Addr::new(100, 115, 92, 6)));
        assert_eq!(subnet.address_at_offset(2), None);
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 255, 252));
        assert_eq!(subnet.broadcast_address(), Ipv4Addr::new(100, 115, 92, 7));
        assert_eq!(subnet.cidr_string(), "100.115.92.4/30");
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let pool = pool();
        let subnets: Vec<_> = (0..5).map(|_| pool.allocate(None).unwrap()).collect();
        assert_eq!(subnets[4].base_address(), Ipv4Addr::new(100, 115, 92, 20));
        assert!(pool.allocate(None).is_none());
        assert_eq!(pool.available_count(), 0);
    }

    #[test]
    fn test_drop_releases_slot() {
        let pool = pool();
        let first = pool.allocate(None).unwrap();
        let _second = pool.allocate(None).unwrap();
        assert_eq!(pool.available_count(), 3);

        drop(first);
        assert_eq!(pool.available_count(), 4);

        // Lowest free slot is handed out again
        let again = pool.allocate(None).unwrap();
        assert_eq!(again.base_address(), Ipv4Addr::new(100, 115, 92, 4));
    }

    #[test]
    fn test_allocate_specific_index() {
        let pool = SubnetPool::new(Ipv4Addr::new(100, 115, 93, 0), 29, 32);
        let subnet = pool.allocate(Some(3)).unwrap();
        assert_eq!(subnet.base_address(), Ipv4Addr::new(100, 115, 93, 16));
        assert_eq!(subnet.slot(), 2);

        // Taken, zero, and out of range indices are refused
        assert!(pool.allocate(Some(3)).is_none());
        assert!(pool.allocate(Some(0)).is_none());
        assert!(pool.allocate(Some(33)).is_none());
    }

    #[test]
    fn test_contains() {
        let pool = SubnetPool::new(Ipv4Addr::new(100, 115, 92, 192), 28, 4);
        let subnet = pool.allocate(None).unwrap();
        assert!(subnet.contains(Ipv4Addr::new(100, 115, 92, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(100, 115, 92, 208)));
        assert_eq!(subnet.available_count(), 14);
    }

    proptest! {
        #[test]
        fn prop_live_subnets_disjoint(ops in proptest::collection::vec(any::<Option<u8>>(), 1..64)) {
            let pool = SubnetPool::new(Ipv4Addr::new(100, 115, 92, 128), 30, 8);
            let mut live: Vec<Subnet> = Vec::new();
            for op in ops {
                match op {
                    // Release the n-th live subnet
                    Some(n) if !live.is_empty() => {
                        let idx = usize::from(n) % live.len();
                        live.remove(idx);
                    }
                    _ => {
                        let lowest_free = (0..8).find(|slot| live.iter().all(|s| s.slot() != *slot));
                        let allocated = pool.allocate(None);
                        prop_assert_eq!(allocated.as_ref().map(Subnet::slot), lowest_free);
                        live.extend(allocated);
                    }
                }

                prop_assert_eq!(pool.available_count(), 8 - live.len());
                for (i, a) in live.iter().enumerate() {
                    for b in &live[i + 1..] {
                        prop_assert!(!a.contains(b.base_address()));
                        prop_assert!(!b.contains(a.base_address()));
                    }
                }
            }
        }
    }
}
