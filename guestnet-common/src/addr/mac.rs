use rand::RngCore;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// 48-bit Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMacError(String);

impl fmt::Display for ParseMacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address: {}", self.0)
    }
}

impl std::error::Error for ParseMacError {}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for o in &mut octets {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *o = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(Self(octets))
    }
}

/// Prefix shared by every stable address; random addresses never use it.
const STABLE_PREFIX: [u8; 3] = [0x42, 0x37, 0x05];
const STABLE_BASE: u32 = 0x13_17_00;

/// Issues locally administered unicast addresses.
#[derive(Debug, Default)]
pub struct MacAddressGenerator {
    issued: HashSet<MacAddress>,
}

impl MacAddressGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Random address, never returned twice by the same generator.
    pub fn generate(&mut self) -> MacAddress {
        let mut rng = rand::thread_rng();
        loop {
            let mut b = [0u8; 6];
            rng.fill_bytes(&mut b);
            // Unicast, locally administered
            b[0] &= 0xfe;
            b[0] |= 0x02;

            let addr = MacAddress(b);
            if b[..3] == STABLE_PREFIX || self.issued.contains(&addr) {
                continue;
            }
            self.issued.insert(addr);
            return addr;
        }
    }

    /// Address derived only from `index`; the same index always yields the
    /// same address, distinct indices (below 2^24) distinct addresses.
    pub fn generate_stable(index: u32) -> MacAddress {
        let low = STABLE_BASE ^ (index & 0x00ff_ffff);
        let [_, b3, b4, b5] = low.to_be_bytes();
        MacAddress([STABLE_PREFIX[0], STABLE_PREFIX[1], STABLE_PREFIX[2], b3, b4, b5])
    }

    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}
