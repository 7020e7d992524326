use crate::snapshot::{config::SnapshotConfig, Snapshot};
use crate::store::MemoryStore;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

#[cfg(test)]
mod tests;

/// Writes periodic snapshots of the memory store
pub struct SnapshotManager {
    store: Arc<MemoryStore>,
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new(store: Arc<MemoryStore>, config: SnapshotConfig) -> Self {
        Self { store, config }
    }

    /// Run background snapshot loop until shutdown, then write a final snapshot
    pub async fn run_snapshot_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            info!("Snapshot manager disabled, exiting loop");
            return Ok(());
        }

        info!(
            interval_secs = self.config.interval_secs,
            directory = %self.config.directory.display(),
            keep_count = self.config.keep_count,
            "Starting snapshot manager"
        );

        fs::create_dir_all(&self.config.directory)
            .context("Failed to create snapshot directory")?;

        let mut timer = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; nothing worth saving yet
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = timer.tick() => {
                    if let Err(e) = self.create_and_save_snapshot() {
                        error!(error = %e, "Failed to create snapshot");
                    }
                }
            }
        }

        info!("Writing final snapshot before shutdown");
        self.create_and_save_snapshot()?;
        Ok(())
    }

    /// Create snapshot and save to filesystem, then prune old ones
    pub fn create_and_save_snapshot(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.directory)
            .context("Failed to create snapshot directory")?;

        let snapshot = Snapshot::from_store(&self.store);
        let path = self.snapshot_path();
        snapshot.save_to_file(&path)?;

        info!(
            appliances = snapshot.appliance_count(),
            path = %path.display(),
            "Snapshot saved"
        );

        self.cleanup_old_snapshots()?;
        Ok(path)
    }

    /// Format: snapshot-{timestamp}.json.gz
    /// Example: snapshot-20260212T153045.123Z.json.gz
    fn snapshot_path(&self) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        self.config
            .directory
            .join(format!("snapshot-{}.json.gz", timestamp))
    }

    /// Delete old snapshots, keeping only the most recent N
    fn cleanup_old_snapshots(&self) -> Result<()> {
        let mut snapshots = list_snapshots(&self.config.directory)?;
        if snapshots.len() <= self.config.keep_count {
            return Ok(());
        }

        // Timestamped names sort chronologically
        snapshots.sort();
        let delete_count = snapshots.len() - self.config.keep_count;

        for path in &snapshots[..delete_count] {
            if let Err(e) = fs::remove_file(path) {
                error!(error = %e, path = %path.display(), "Failed to delete old snapshot");
            } else {
                info!(path = %path.display(), "Deleted old snapshot");
            }
        }

        Ok(())
    }
}

/// Snapshot files (`snapshot-*.json.gz`) in a directory, unordered
pub(crate) fn list_snapshots(directory: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(directory).context("Failed to read snapshot directory")?;

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry.context("Failed to read directory entry")?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
            if filename.starts_with("snapshot-") && filename.ends_with(".json.gz") {
                snapshots.push(path);
            }
        }
    }

    Ok(snapshots)
}
