use crate::appliance::Appliance;
use crate::store::MemoryStore;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

pub mod config;
pub mod manager;
pub mod recovery;

pub use config::SnapshotConfig;
pub use manager::SnapshotManager;
pub use recovery::load_latest_snapshot;

#[cfg(test)]
mod tests;

/// Current on-disk format version
pub const SNAPSHOT_VERSION: &str = "1";

/// Every appliance record at a point in time
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot format version (for future schema evolution)
    pub snapshot_version: String,

    pub created_at: DateTime<Utc>,

    /// Appliance records ordered by key
    pub appliances: Vec<Appliance>,
}

impl Snapshot {
    /// Capture the current contents of the store
    pub fn from_store(store: &MemoryStore) -> Self {
        Self {
            snapshot_version: SNAPSHOT_VERSION.to_string(),
            created_at: Utc::now(),
            appliances: store.all(),
        }
    }

    /// Save snapshot to filesystem as compressed JSON (gzip)
    ///
    /// Uses atomic write: writes to .tmp file, fsyncs, then renames.
    /// A crash mid-write never leaves a partial snapshot under the final name.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self).context("Failed to serialize snapshot to JSON")?;

        let tmp_path = path.with_extension("tmp");
        {
            let tmp_file =
                File::create(&tmp_path).context("Failed to create temporary snapshot file")?;

            let mut encoder = GzEncoder::new(tmp_file, Compression::default());
            encoder
                .write_all(&json)
                .context("Failed to write compressed snapshot data")?;

            let file = encoder.finish().context("Failed to finish compression")?;
            file.sync_all()
                .context("Failed to sync snapshot file to disk")?;
        }

        fs::rename(&tmp_path, path).context("Failed to rename temporary snapshot file")?;
        Ok(())
    }

    /// Load a gzip-compressed snapshot (`.json.gz`)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).context("Failed to open snapshot file")?;

        let mut json = String::new();
        GzDecoder::new(file)
            .read_to_string(&mut json)
            .context("Failed to decompress snapshot file")?;

        let snapshot: Snapshot =
            serde_json::from_str(&json).context("Failed to deserialize snapshot JSON")?;

        if snapshot.snapshot_version != SNAPSHOT_VERSION {
            bail!(
                "Unsupported snapshot version '{}' (expected '{}')",
                snapshot.snapshot_version,
                SNAPSHOT_VERSION
            );
        }

        Ok(snapshot)
    }

    pub fn appliance_count(&self) -> usize {
        self.appliances.len()
    }
}
