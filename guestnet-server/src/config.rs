//! Daemon settings read from the environment.

use crate::guest::arc::ArcKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_LSB_RELEASE: &str = "/etc/lsb-release";
pub const DEFAULT_HYPERVISOR_USER: &str = "crosvm";
pub const DEFAULT_HELPER_USER: &str = "guestnet";
pub const DEFAULT_DEVICE_POLL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub lsb_release: PathBuf,
    /// Owner of guest TAP devices
    pub hypervisor_user: String,
    /// Unprivileged user the helpers run as
    pub helper_user: String,
    pub adb_proxy: Option<String>,
    pub mcast_proxy: Option<String>,
    pub adb_sideload_query: Option<String>,
    pub arc_kind: ArcKind,
    pub nd_proxy_boards: Vec<String>,
    pub device_poll: Duration,
    pub otlp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lsb_release: PathBuf::from(DEFAULT_LSB_RELEASE),
            hypervisor_user: DEFAULT_HYPERVISOR_USER.to_string(),
            helper_user: DEFAULT_HELPER_USER.to_string(),
            adb_proxy: None,
            mcast_proxy: None,
            adb_sideload_query: None,
            arc_kind: ArcKind::Container,
            nd_proxy_boards: Vec::new(),
            device_poll: DEFAULT_DEVICE_POLL,
            otlp: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unparseable values fall back
    /// to their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let arc_kind = match non_empty("GUESTNET_ARC_GUEST").as_deref() {
            None | Some("container") => ArcKind::Container,
            Some("vm") => ArcKind::Vm,
            Some(other) => {
                warn!("Unknown GUESTNET_ARC_GUEST {}, using container", other);
                ArcKind::Container
            }
        };

        let device_poll = match non_empty("GUESTNET_DEVICE_POLL_MS") {
            None => defaults.device_poll,
            Some(v) => match v.parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    warn!("Invalid GUESTNET_DEVICE_POLL_MS {}, using default", v);
                    defaults.device_poll
                }
            },
        };

        let otlp = !matches!(
            non_empty("GUESTNET_OTLP").as_deref(),
            Some("off" | "0" | "false")
        );

        Self {
            lsb_release: non_empty("GUESTNET_LSB_RELEASE").map_or(defaults.lsb_release, PathBuf::from),
            hypervisor_user: non_empty("GUESTNET_HYPERVISOR_USER").unwrap_or(defaults.hypervisor_user),
            helper_user: non_empty("GUESTNET_HELPER_USER").unwrap_or(defaults.helper_user),
            adb_proxy: non_empty("GUESTNET_ADB_PROXY"),
            mcast_proxy: non_empty("GUESTNET_MCAST_PROXY"),
            adb_sideload_query: non_empty("GUESTNET_ADB_SIDELOAD_QUERY"),
            arc_kind,
            nd_proxy_boards: non_empty("GUESTNET_NDPROXY_BOARDS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|b| !b.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            device_poll,
            otlp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.lsb_release, PathBuf::from("/etc/lsb-release"));
        assert_eq!(cfg.device_poll, Duration::from_secs(2));
        assert!(cfg.otlp);
        assert!(cfg.adb_proxy.is_none());
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("GUESTNET_ARC_GUEST", "vm"),
            ("GUESTNET_ADB_PROXY", "/usr/bin/adb_proxy --verbose"),
            ("GUESTNET_NDPROXY_BOARDS", "atlas, eve,,nocturne"),
            ("GUESTNET_DEVICE_POLL_MS", "500"),
            ("GUESTNET_OTLP", "off"),
            ("GUESTNET_HYPERVISOR_USER", "vmuser"),
        ]);
        assert_eq!(cfg.arc_kind, ArcKind::Vm);
        assert_eq!(cfg.adb_proxy.as_deref(), Some("/usr/bin/adb_proxy --verbose"));
        assert_eq!(cfg.nd_proxy_boards, vec!["atlas", "eve", "nocturne"]);
        assert_eq!(cfg.device_poll, Duration::from_millis(500));
        assert!(!cfg.otlp);
        assert_eq!(cfg.hypervisor_user, "vmuser");
    }

    #[test]
    fn test_bad_values_fall_back() {
        let cfg = config(&[
            ("GUESTNET_ARC_GUEST", "phone"),
            ("GUESTNET_DEVICE_POLL_MS", "soon"),
            ("GUESTNET_MCAST_PROXY", "   "),
        ]);
        assert_eq!(cfg.arc_kind, ArcKind::Container);
        assert_eq!(cfg.device_poll, DEFAULT_DEVICE_POLL);
        assert!(cfg.mcast_proxy.is_none());
    }
}
