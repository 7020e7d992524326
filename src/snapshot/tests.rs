use super::*;
use crate::appliance::{ApplianceKey, ApplianceSpec};
use crate::store::StateStore;
use tempfile::TempDir;

async fn populated_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .apply(&ApplianceKey::new("default", "kitchen1"), ApplianceSpec { power: true })
        .await
        .unwrap();
    store
        .apply(&ApplianceKey::new("lab", "espresso"), ApplianceSpec { power: false })
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_snapshot_from_store() {
    let store = populated_store().await;
    let snapshot = Snapshot::from_store(&store);

    assert_eq!(snapshot.snapshot_version, SNAPSHOT_VERSION);
    assert_eq!(snapshot.appliance_count(), 2);
    assert_eq!(snapshot.appliances[0].key.to_string(), "default/kitchen1");
    assert_eq!(snapshot.appliances[1].key.to_string(), "lab/espresso");
}

#[tokio::test]
async fn test_snapshot_save_and_load_into_fresh_store() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("snapshot-test.json.gz");

    let original = populated_store().await;
    Snapshot::from_store(&original).save_to_file(&path).unwrap();

    let loaded = Snapshot::load_from_file(&path).unwrap();
    let restored = MemoryStore::new();
    restored.restore(loaded.appliances);

    assert_eq!(restored.all(), original.all());
}

#[test]
fn test_load_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let result = Snapshot::load_from_file(&temp_dir.path().join("missing.json.gz"));
    assert!(result.is_err());
}

#[test]
fn test_load_invalid_gzip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.json.gz");
    fs::write(&path, b"plain text, not gzip").unwrap();

    assert!(Snapshot::load_from_file(&path).is_err());
}

#[test]
fn test_load_rejects_unknown_version() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("future.json.gz");

    let snapshot = Snapshot {
        snapshot_version: "99".to_string(),
        created_at: Utc::now(),
        appliances: Vec::new(),
    };
    snapshot.save_to_file(&path).unwrap();

    let err = Snapshot::load_from_file(&path).unwrap_err();
    assert!(err.to_string().contains("Unsupported snapshot version"));
}

#[tokio::test]
async fn test_atomic_write_no_tmp_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("snapshot-atomic.json.gz");

    Snapshot::from_store(&populated_store().await)
        .save_to_file(&path)
        .unwrap();

    assert!(path.exists());
    assert!(!path.with_extension("tmp").exists());
}
