//! File-backed `KvStore` (§6.3). Stands in for the NVS the spec calls out
//! of scope: one JSON file holding the whole key/value map, rewritten
//! atomically (write-to-temp, rename) on every `put`.

use std::collections::HashMap;
use std::path::PathBuf;

use ecowatt_diagnostics::{KvStore, StoreError};

pub struct FileKvStore {
    path: PathBuf,
    entries: HashMap<String, Vec<u8>>,
}

impl FileKvStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    fn flush(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&self.entries).map_err(|_| StoreError::StoreCorrupt)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|_| StoreError::StoreBusy)?;
        std::fs::rename(&tmp, &self.path).map_err(|_| StoreError::StoreBusy)
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_vec());
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("ecowatt-kv-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        {
            let mut store = FileKvStore::open(&dir);
            store.put("security.nonce", &42u32.to_le_bytes()).unwrap();
        }
        let store = FileKvStore::open(&dir);
        assert_eq!(store.get("security.nonce"), Some(42u32.to_le_bytes().to_vec()));
        let _ = std::fs::remove_file(&dir);
        let _ = std::fs::remove_file(dir.with_extension("tmp"));
    }
}
