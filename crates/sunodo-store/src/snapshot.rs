use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::{Address, DApp, DAppStore, StoreError, StoreResult, io_error};

/// Durable form of a [`DAppStore`].
///
/// The cursor is not persisted; it depends on the wall-clock time at which
/// the snapshot is restored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(with = "crate::decimal")]
    pub block: u64,
    #[serde(default)]
    pub machines: BTreeMap<Address, String>,
    #[serde(default)]
    pub dapps: Vec<DApp>,
}

impl StoreSnapshot {
    /// Write to `path` atomically (temp file + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

        let bytes = serde_json::to_vec_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
        tmp.write_all(&bytes).map_err(|e| io_error(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| io_error(tmp.path(), e))?;
        tmp.persist(path).map_err(|e| StoreError::Persist {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        debug!(path = %path.display(), block = self.block, dapps = self.dapps.len(), "store saved");
        Ok(())
    }
}

impl DAppStore {
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            block: self.block(),
            machines: self.machines().clone(),
            dapps: self.dapps().to_vec(),
        }
    }

    /// Rebuild a store from a snapshot, positioning the cursor at `now`.
    pub fn restore(snapshot: StoreSnapshot, now: u128) -> Self {
        DAppStore::from_parts(snapshot.block, snapshot.machines, snapshot.dapps, now)
    }

    /// Write the snapshot to `path` atomically (temp file + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        self.snapshot().save(path)
    }

    pub fn load(path: impl AsRef<Path>, now: u128) -> StoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        Ok(Self::restore(snapshot, now))
    }

    /// Load `path` if it exists, otherwise start from an empty store.
    pub fn open(path: impl AsRef<Path>, now: u128) -> StoreResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path, now)
        } else {
            Ok(Self::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_json_uses_decimal_strings() {
        let address: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let mut store = DAppStore::new();
        store.upsert_location(1, address, "QmMachine".into());
        store.upsert_workload(
            12,
            0,
            DApp {
                address,
                shutdown_at: 1_700_000_000_000,
                block_hash: "0xbb".into(),
                block_number: 12,
                transaction_hash: "0xcc".into(),
            },
        );

        let value = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(value["block"], "12");
        assert_eq!(
            value["machines"]["0x00000000000000000000000000000000000000aa"],
            "QmMachine"
        );
        assert_eq!(value["dapps"][0]["shutdownAt"], "1700000000000");
        assert_eq!(value["dapps"][0]["blockNumber"], "12");
        assert_eq!(value["dapps"][0]["transactionHash"], "0xcc");
    }

    #[test]
    fn accepts_minimal_entries() {
        let json = r#"{
            "block": 5,
            "machines": {},
            "dapps": [{"address": "0x0000000000000000000000000000000000000001", "shutdownAt": "10"}]
        }"#;
        let snapshot: StoreSnapshot = serde_json::from_str(json).unwrap();
        let store = DAppStore::restore(snapshot, 10);
        assert_eq!(store.block(), 5);
        assert_eq!(store.cursor(), Some(1));
        assert_eq!(store.dapps()[0].block_number, 0);
    }
}
