//! Per-socket VPN routing intent.

use guestnet_common::fwmark::VpnRoutingPolicy;
use guestnet_common::{Error, Result};
use nix::sys::socket::{getsockopt, setsockopt, sockopt};
use std::os::fd::AsFd;
use tracing::info;

/// Write the VPN intent bits of `policy` into the `SO_MARK` of `sock`,
/// preserving every other bit of the mark.
pub fn set_vpn_intent<F: AsFd>(sock: &F, policy: VpnRoutingPolicy) -> Result<()> {
    let mark = getsockopt(sock, sockopt::Mark)
        .map_err(|e| Error::InvalidArgument(format!("cannot read SO_MARK: {e}")))?;
    let new_mark = policy.apply(mark);
    setsockopt(sock, sockopt::Mark, &new_mark)
        .map_err(|e| Error::InvalidArgument(format!("cannot write SO_MARK: {e}")))?;
    info!("SO_MARK {:#010x} -> {:#010x} ({:?})", mark, new_mark, policy);
    Ok(())
}
