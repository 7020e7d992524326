use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for snapshot manager
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Enable periodic snapshots and restore at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Interval between snapshots (seconds)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Directory to store snapshots
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Number of snapshots to keep (delete oldest)
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_directory() -> PathBuf {
    PathBuf::from("./data/snapshots")
}

fn default_keep_count() -> usize {
    5
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            directory: default_directory(),
            keep_count: default_keep_count(),
        }
    }
}
