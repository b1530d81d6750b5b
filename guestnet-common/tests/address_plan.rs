//! Address plan properties: live subnets never overlap and released slots
//! are reusable.

use guestnet_common::addr::{AddressManager, GuestClass, MacAddressGenerator, Subnet};
use proptest::prelude::*;
use std::net::Ipv4Addr;

fn range(s: &Subnet) -> (u32, u32) {
    let base = u32::from(s.base_address());
    let size = 1u32 << (32 - u32::from(s.prefix_length()));
    (base, base + size)
}

fn overlaps(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

#[test]
fn test_class_ranges_are_disjoint_and_reserved() {
    let reserved = (u32::from(Ipv4Addr::new(100, 115, 92, 0)), u32::from(Ipv4Addr::new(100, 115, 94, 0)));
    let ranges: Vec<_> = GuestClass::ALL
        .iter()
        .map(|c| {
            let (base, prefix, slots) = c.plan();
            let start = u32::from(base);
            (start, start + (1u32 << (32 - u32::from(prefix))) * slots as u32)
        })
        .collect();

    for (i, a) in ranges.iter().enumerate() {
        assert!(a.0 >= reserved.0 && a.1 <= reserved.1);
        for b in &ranges[i + 1..] {
            assert!(!overlaps(*a, *b), "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn test_first_android_uplink_addresses() {
    let mgr = AddressManager::new();
    let s = mgr.allocate_ipv4_subnet(GuestClass::AndroidNet, None).unwrap();
    assert_eq!(s.address_at_offset(0), Some(Ipv4Addr::new(100, 115, 92, 5)));
    assert_eq!(s.address_at_offset(1), Some(Ipv4Addr::new(100, 115, 92, 6)));
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Drop(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..GuestClass::ALL.len()).prop_map(Op::Alloc),
        any::<usize>().prop_map(Op::Drop),
    ]
}

proptest! {
    #[test]
    fn live_subnets_never_overlap(ops in proptest::collection::vec(op(), 1..200)) {
        let mgr = AddressManager::new();
        let mut live: Vec<Subnet> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(c) => {
                    if let Ok(s) = mgr.allocate_ipv4_subnet(GuestClass::ALL[c], None) {
                        live.push(s);
                    }
                }
                Op::Drop(i) => {
                    if !live.is_empty() {
                        let idx = i % live.len();
                        live.swap_remove(idx);
                    }
                }
            }

            for (i, a) in live.iter().enumerate() {
                for b in &live[i + 1..] {
                    prop_assert!(!overlaps(range(a), range(b)), "{:?} overlaps {:?}", a, b);
                }
            }
        }

        // Everything handed back once the holders are gone
        drop(live);
        for class in GuestClass::ALL {
            prop_assert_eq!(mgr.available(class), class.plan().2);
        }
    }

    #[test]
    fn stable_mac_is_a_function(i in 0u32..0x0100_0000, j in 0u32..0x0100_0000) {
        let a = MacAddressGenerator::generate_stable(i);
        prop_assert_eq!(a, MacAddressGenerator::generate_stable(i));
        if i != j {
            prop_assert_ne!(a, MacAddressGenerator::generate_stable(j));
        }
    }
}
