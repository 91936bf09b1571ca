use dashling::storage::{BandwidthStore, FileStore, BANDWIDTH_KEY};

#[test]
fn test_file_store_persists() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bandwidth.json");

    let store = FileStore::open(&path)?;
    assert_eq!(store.get(BANDWIDTH_KEY), None);
    store.set(BANDWIDTH_KEY, 250_000.0);

    let reopened = FileStore::open(&path)?;
    assert_eq!(reopened.get(BANDWIDTH_KEY), Some(250_000.0));
    Ok(())
}

#[test]
fn test_file_store_accepts_empty_file() -> anyhow::Result<()> {
    let file = tempfile::NamedTempFile::new()?;
    let store = FileStore::open(file.path())?;
    assert_eq!(store.get(BANDWIDTH_KEY), None);
    Ok(())
}

#[test]
fn test_file_store_rejects_garbage() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bandwidth.json");
    std::fs::write(&path, "not json")?;

    assert!(FileStore::open(&path).is_err());
    Ok(())
}
