//! Per-source, per-uplink traffic accounting.
//!
//! Each uplink gets four chains in the mangle table of both families. Every
//! chain holds one RETURN rule per known source tag followed by a catch-all
//! RETURN, so the packet counters of those rules are the accounting data.
//! Chains are never removed, which keeps counters monotonic across uplink
//! flaps.

use crate::datapath::{Datapath, IpFamily};
use anyhow::{anyhow, Result};
use guestnet_common::fwmark::{TrafficSource, GUEST_TRAFFIC_MARK, GUEST_TRAFFIC_MASK};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

const MANGLE: &str = "mangle";
/// iptables chain names are limited to 28 characters
const MAX_CHAIN_NAME_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Rx,
    Tx,
}

/// Accounting chain kinds: `(prefix, builtin chain, direction)`
const CHAINS: [(&str, &str, Direction); 4] = [
    ("rx_input", "INPUT", Direction::Rx),
    ("rx_fwd", "FORWARD", Direction::Rx),
    ("tx_postrt", "POSTROUTING", Direction::Tx),
    ("tx_fwd", "FORWARD", Direction::Tx),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

pub type CounterMap = BTreeMap<(TrafficSource, String), Counter>;

fn jump_spec(prefix: &str, uplink: &str, chain: &str) -> String {
    match prefix {
        "rx_input" | "rx_fwd" => format!("-i {uplink} -j {chain}"),
        "tx_fwd" => format!("-o {uplink} -j {chain}"),
        // Forwarded guest traffic carries the guest mark and is counted in tx_fwd
        _ => format!(
            "-o {uplink} -m mark ! --mark {GUEST_TRAFFIC_MARK}/{GUEST_TRAFFIC_MASK} -j {chain}"
        ),
    }
}

fn accounting_specs() -> Vec<String> {
    TrafficSource::ALL
        .iter()
        .filter(|&&s| s != TrafficSource::Unknown)
        .map(|s| format!("-m mark --mark {} -j RETURN", s.mark_arg()))
        .chain(std::iter::once("-j RETURN".to_string()))
        .collect()
}

pub struct CountersService;

impl CountersService {
    /// Create the accounting chains and rules for `uplink` where missing.
    #[tracing::instrument(name = "counters.setup", skip(datapath))]
    pub fn setup_uplink(datapath: &Datapath, uplink: &str) {
        for (prefix, builtin, _) in CHAINS {
            let chain = format!("{prefix}_{uplink}");
            if chain.len() > MAX_CHAIN_NAME_LEN {
                warn!("Chain name {} too long, not accounting {}", chain, uplink);
                return;
            }
            for family in IpFamily::BOTH {
                if let Err(e) = Self::setup_chain(datapath, family, builtin, &chain, &jump_spec(prefix, uplink, &chain)) {
                    warn!("Failed to set up {} {}: {:#}", family, chain, e);
                }
            }
        }
    }

    fn setup_chain(datapath: &Datapath, family: IpFamily, builtin: &str, chain: &str, jump: &str) -> Result<()> {
        let filter = datapath.filter();
        if !filter.chain_exists(family, MANGLE, chain)? {
            filter.new_chain(family, MANGLE, chain)?;
        }
        for spec in accounting_specs() {
            if !filter.exists(family, MANGLE, chain, &spec)? {
                filter.append(family, MANGLE, chain, &spec)?;
            }
        }
        if !filter.exists(family, MANGLE, builtin, jump)? {
            filter.append(family, MANGLE, builtin, jump)?;
        }
        Ok(())
    }

    pub fn on_devices_changed(datapath: &Datapath, added: &BTreeSet<String>) {
        for uplink in added {
            Self::setup_uplink(datapath, uplink);
        }
    }

    /// Read both families' counters, restricted to `uplinks` unless empty.
    ///
    /// Fails as a whole if either family cannot be read, since counters for
    /// one family alone would be biased.
    pub fn get_counters(datapath: &Datapath, uplinks: &BTreeSet<String>) -> Result<CounterMap> {
        let mut counters = CounterMap::new();
        for family in IpFamily::BOTH {
            let listing = datapath.filter().list_counters(family, MANGLE)?;
            if listing.trim().is_empty() {
                return Err(anyhow!("Empty {} counters listing", family));
            }
            parse_listing(&listing, uplinks, &mut counters)?;
        }
        Ok(counters)
    }
}

/// Split `rx_input_eth0` into its direction and uplink.
fn parse_chain_name(name: &str) -> Option<(Direction, &str)> {
    CHAINS.iter().find_map(|(prefix, _, dir)| {
        name.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|uplink| !uplink.is_empty())
            .map(|uplink| (*dir, uplink))
    })
}

/// Source named by a `mark match 0x2000/0x3f00` clause
fn parse_source(line: &str) -> Option<TrafficSource> {
    let (_, rest) = line.split_once("mark match ")?;
    let value = rest.split(['/', ' ']).next()?;
    let mark = u32::from_str_radix(value.trim_start_matches("0x"), 16).ok()?;
    TrafficSource::from_fwmark(mark)
}

/// Accumulate an `iptables -L -x -v -n` listing into `counters`.
fn parse_listing(listing: &str, uplinks: &BTreeSet<String>, counters: &mut CounterMap) -> Result<()> {
    let mut current: Option<(Direction, String)> = None;

    for line in listing.lines() {
        if let Some(rest) = line.strip_prefix("Chain ") {
            let name = rest.split_whitespace().next().unwrap_or_default();
            current = parse_chain_name(name)
                .filter(|(_, uplink)| uplinks.is_empty() || uplinks.contains(*uplink))
                .map(|(dir, uplink)| (dir, uplink.to_string()));
            continue;
        }
        let Some((dir, uplink)) = &current else {
            continue;
        };

        let mut fields = line.split_whitespace();
        let (Some(pkts), Some(bytes)) = (fields.next(), fields.next()) else {
            continue;
        };
        // Column header
        if pkts == "pkts" {
            continue;
        }
        let pkts: u64 = pkts
            .parse()
            .map_err(|_| anyhow!("Cannot parse counter line {:?}", line))?;
        let bytes: u64 = bytes
            .parse()
            .map_err(|_| anyhow!("Cannot parse counter line {:?}", line))?;

        let source = parse_source(line).unwrap_or(TrafficSource::Unknown);
        let counter = counters.entry((source, uplink.clone())).or_default();
        match dir {
            Direction::Rx => {
                counter.rx_packets += pkts;
                counter.rx_bytes += bytes;
            }
            Direction::Tx => {
                counter.tx_packets += pkts;
                counter.tx_bytes += bytes;
            }
        }
        debug!("{:?} {} {:?}: {} pkts {} bytes", source, uplink, dir, pkts, bytes);
    }
    Ok(())
}
