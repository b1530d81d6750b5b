//! Release-based feature gating.

use std::collections::HashMap;
use std::path::Path;
use tracing::{error, info};

pub const ND_PROXY_FEATURE: &str = "ND proxy";
pub const ND_PROXY_MIN_ANDROID_SDK: u32 = 28;
pub const ND_PROXY_MIN_MILESTONE: u32 = 80;

const SDK_KEY: &str = "CHROMEOS_ARC_ANDROID_SDK_VERSION";
const MILESTONE_KEY: &str = "CHROMEOS_RELEASE_CHROME_MILESTONE";
const BOARD_KEY: &str = "CHROMEOS_RELEASE_BOARD";

/// Parse `KEY=value` lines; comments and malformed lines are skipped.
pub fn parse_lsb_release(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureGate {
    pub name: &'static str,
    pub min_android_sdk: u32,
    pub min_milestone: u32,
    /// Empty allows every board
    pub boards: Vec<String>,
}

impl FeatureGate {
    pub fn nd_proxy(boards: Vec<String>) -> Self {
        Self {
            name: ND_PROXY_FEATURE,
            min_android_sdk: ND_PROXY_MIN_ANDROID_SDK,
            min_milestone: ND_PROXY_MIN_MILESTONE,
            boards,
        }
    }

    fn number(&self, release: &HashMap<String, String>, key: &str, what: &str) -> Option<u32> {
        let Some(value) = release.get(key) else {
            error!("{} disabled - cannot determine {}", self.name, what);
            return None;
        };
        match value.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                error!("{} disabled - invalid {} {}", self.name, what, value);
                None
            }
        }
    }

    pub fn evaluate(&self, release: &HashMap<String, String>) -> bool {
        let Some(sdk) = self.number(release, SDK_KEY, "Android SDK version") else {
            return false;
        };
        if sdk < self.min_android_sdk {
            info!("{} disabled for Android SDK {}", self.name, sdk);
            return false;
        }

        let Some(milestone) = self.number(release, MILESTONE_KEY, "milestone") else {
            return false;
        };
        if milestone < self.min_milestone {
            info!("{} disabled for milestone {}", self.name, milestone);
            return false;
        }

        let Some(board) = release.get(BOARD_KEY) else {
            error!("{} disabled - cannot determine board", self.name);
            return false;
        };
        if !self.boards.is_empty() && !self.boards.contains(board) {
            info!("{} disabled for board {}", self.name, board);
            return false;
        }
        true
    }

    /// Evaluate against the release file at `path`. An unreadable file
    /// disables the feature.
    pub fn evaluate_file(&self, path: &Path) -> bool {
        match std::fs::read_to_string(path) {
            Ok(contents) => self.evaluate(&parse_lsb_release(&contents)),
            Err(e) => {
                error!("Could not read {}: {}", path.display(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RELEASE: &str = "\
CHROMEOS_RELEASE_BOARD=eve
# comment
CHROMEOS_RELEASE_CHROME_MILESTONE=81
CHROMEOS_ARC_ANDROID_SDK_VERSION=\"28\"
garbage line
";

    #[test]
    fn test_parse_lsb_release() {
        let release = parse_lsb_release(RELEASE);
        assert_eq!(release.len(), 3);
        assert_eq!(release["CHROMEOS_ARC_ANDROID_SDK_VERSION"], "28");
        assert_eq!(release["CHROMEOS_RELEASE_BOARD"], "eve");
    }

    #[test]
    fn test_gate_conditions() {
        let release = parse_lsb_release(RELEASE);
        assert!(FeatureGate::nd_proxy(vec![]).evaluate(&release));
        assert!(FeatureGate::nd_proxy(vec!["eve".into(), "atlas".into()]).evaluate(&release));
        assert!(!FeatureGate::nd_proxy(vec!["atlas".into()]).evaluate(&release));

        let mut old_sdk = release.clone();
        old_sdk.insert(SDK_KEY.into(), "25".into());
        assert!(!FeatureGate::nd_proxy(vec![]).evaluate(&old_sdk));

        let mut old_milestone = release.clone();
        old_milestone.insert(MILESTONE_KEY.into(), "79".into());
        assert!(!FeatureGate::nd_proxy(vec![]).evaluate(&old_milestone));

        let mut bad = release;
        bad.insert(MILESTONE_KEY.into(), "eighty".into());
        assert!(!FeatureGate::nd_proxy(vec![]).evaluate(&bad));
    }

    #[test]
    fn test_missing_keys_disable() {
        let release = parse_lsb_release("CHROMEOS_ARC_ANDROID_SDK_VERSION=30\n");
        assert!(!FeatureGate::nd_proxy(vec![]).evaluate(&release));
    }

    #[test]
    fn test_evaluate_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RELEASE.as_bytes()).unwrap();
        let gate = FeatureGate::nd_proxy(vec![]);
        assert!(gate.evaluate_file(file.path()));
        assert!(!gate.evaluate_file(Path::new("/nonexistent/lsb-release")));
    }
}
