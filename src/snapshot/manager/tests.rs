use super::*;
use crate::appliance::{ApplianceKey, ApplianceSpec};
use crate::store::StateStore;
use tempfile::TempDir;

fn config(dir: &Path, keep_count: usize) -> SnapshotConfig {
    SnapshotConfig {
        enabled: true,
        interval_secs: 3600,
        directory: dir.to_path_buf(),
        keep_count,
    }
}

async fn store_with_one() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .apply(&ApplianceKey::new("default", "kitchen1"), ApplianceSpec { power: true })
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_snapshot_path_format() {
    let temp_dir = TempDir::new().unwrap();
    let manager = SnapshotManager::new(Arc::new(MemoryStore::new()), config(temp_dir.path(), 5));

    let path = manager.snapshot_path();
    let filename = path.file_name().unwrap().to_str().unwrap();

    assert!(filename.starts_with("snapshot-"));
    assert!(filename.ends_with("Z.json.gz"));
}

#[tokio::test]
async fn test_create_and_save_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let manager = SnapshotManager::new(store_with_one().await, config(temp_dir.path(), 5));

    let path = manager.create_and_save_snapshot().unwrap();

    let snapshots = list_snapshots(temp_dir.path()).unwrap();
    assert_eq!(snapshots, vec![path.clone()]);

    let snapshot = Snapshot::load_from_file(&path).unwrap();
    assert_eq!(snapshot.appliance_count(), 1);
}

#[tokio::test]
async fn test_cleanup_keeps_newest() {
    let temp_dir = TempDir::new().unwrap();
    let manager = SnapshotManager::new(store_with_one().await, config(temp_dir.path(), 2));

    for stamp in ["20260101T000000.000Z", "20260102T000000.000Z", "20260103T000000.000Z"] {
        Snapshot::from_store(&manager.store)
            .save_to_file(&temp_dir.path().join(format!("snapshot-{}.json.gz", stamp)))
            .unwrap();
    }

    manager.cleanup_old_snapshots().unwrap();

    let mut remaining = list_snapshots(temp_dir.path()).unwrap();
    remaining.sort();
    let names: Vec<String> = remaining
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "snapshot-20260102T000000.000Z.json.gz".to_string(),
            "snapshot-20260103T000000.000Z.json.gz".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_loop_writes_final_snapshot_on_shutdown() {
    let temp_dir = TempDir::new().unwrap();
    let manager = Arc::new(SnapshotManager::new(
        store_with_one().await,
        config(&temp_dir.path().join("snaps"), 5),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run_snapshot_loop(shutdown_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let snapshots = list_snapshots(&temp_dir.path().join("snaps")).unwrap();
    assert_eq!(snapshots.len(), 1);
}

#[tokio::test]
async fn test_disabled_manager_returns_immediately() {
    let temp_dir = TempDir::new().unwrap();
    let mut disabled = config(&temp_dir.path().join("never"), 5);
    disabled.enabled = false;

    let manager = SnapshotManager::new(Arc::new(MemoryStore::new()), disabled);
    let (_tx, rx) = watch::channel(false);
    manager.run_snapshot_loop(rx).await.unwrap();

    assert!(!temp_dir.path().join("never").exists());
}
