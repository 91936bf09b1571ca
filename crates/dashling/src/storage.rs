use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::error::DashlingResult;

/// Key the video stream persists its measured bytes per second under.
pub const BANDWIDTH_KEY: &str = "Dashling.Stream.bytesPerSecond";

/// Durable key-value storage for values that should outlive a session.
pub trait BandwidthStore: Send + Sync {
    fn get(&self, key: &str) -> Option<f64>;

    fn set(&self, key: &str, value: f64);
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, f64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BandwidthStore for MemoryStore {
    fn get(&self, key: &str) -> Option<f64> {
        self.values.lock().unwrap().get(key).copied()
    }

    fn set(&self, key: &str, value: f64) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }
}

/// Stores values as a flat JSON object on disk.
///
/// The file is read once on open and rewritten on every `set`. Write
/// failures are logged and otherwise ignored.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, f64>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> DashlingResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn flush(&self, values: &HashMap<String, f64>) -> DashlingResult<()> {
        let content = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl BandwidthStore for FileStore {
    fn get(&self, key: &str) -> Option<f64> {
        self.values.lock().unwrap().get(key).copied()
    }

    fn set(&self, key: &str, value: f64) {
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), value);
        if let Err(e) = self.flush(&values) {
            tracing::warn!("Failed to persist {key} to {}: {e}", self.path.display());
        }
    }
}
