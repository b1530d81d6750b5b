//! Guest address allocation: subnets out of the reserved range and MAC
//! addresses for guest-facing interfaces.

mod mac;
mod manager;
mod subnet;

pub use mac::{MacAddress, MacAddressGenerator, ParseMacError};
pub use manager::{AddressManager, GuestClass};
pub use subnet::{Subnet, SubnetPool};
