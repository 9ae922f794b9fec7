//! Persistence adapters (component #9): append-only journals for
//! snapshots/debts/feedback/suggestions, periodic snapshots for derived
//! caches (performance, budgets). Generalizes the teacher's
//! `MemoryManager` — a sled-backed store with a `DashMap` hot cache in
//! front — into a single shared handle every stateful component opens
//! against, keyed by path prefix (§6 persisted-state layout).

use crate::error::StoreError;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::Arc;

/// Shared storage handle. Cheap to clone (`Arc` inside); every component
/// holds one and namespaces its own keys under a path prefix matching §6
/// (e.g. `context/memories/<id>`, `ari/<user>_<iso>.json`).
#[derive(Clone)]
pub struct Store {
    db: Db,
    cache: Arc<DashMap<String, Vec<u8>>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            cache: Arc::new(DashMap::new()),
        })
    }

    /// In-memory store for tests; no file handle at all.
    #[cfg(test)]
    pub fn temporary() -> Self {
        let db = sled::Config::new().temporary(true).open().expect("open temp sled db");
        Self {
            db,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Writes raw bytes at `key`, to both the hot cache and durable storage.
    pub fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key.as_bytes(), value)?;
        self.cache.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Reads raw bytes at `key`. Checks the hot cache first, then sled.
    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(v) = self.cache.get(key) {
            return Ok(Some(v.clone()));
        }
        let v = self.db.get(key.as_bytes())?;
        let out = v.map(|iv| iv.to_vec());
        if let Some(ref bytes) = out {
            self.cache.insert(key.to_string(), bytes.clone());
        }
        Ok(out)
    }

    pub fn remove_raw(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key.as_bytes())?;
        self.cache.remove(key);
        Ok(())
    }

    /// Lists all keys with the given prefix (used for scans — e.g. every
    /// memory entry for a user, every snapshot file).
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, _) = item?;
            out.push(String::from_utf8_lossy(&k).to_string());
        }
        Ok(out)
    }

    /// Serializes `value` as JSON and persists it at `key`.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.put_raw(key, &bytes)
    }

    /// Reads and deserializes a JSON value at `key`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Appends one JSON record under `prefix/<id>` — the journal pattern
    /// used for snapshots, debts, feedback events, and suggestions (§6).
    pub fn append_journal<T: Serialize>(
        &self,
        prefix: &str,
        id: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        self.put_json(&format!("{prefix}/{id}"), value)
    }

    /// Reads every record under `prefix/` (journal replay).
    pub fn read_journal<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        let keys = self.scan_prefix(&format!("{prefix}/"))?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get_json(&key)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn roundtrip_json() {
        let store = Store::temporary();
        store.put_json("k", &Sample { n: 7 }).unwrap();
        let v: Sample = store.get_json("k").unwrap().unwrap();
        assert_eq!(v, Sample { n: 7 });
    }

    #[test]
    fn journal_replay() {
        let store = Store::temporary();
        store.append_journal("ari", "a1", &Sample { n: 1 }).unwrap();
        store.append_journal("ari", "a2", &Sample { n: 2 }).unwrap();
        let all: Vec<Sample> = store.read_journal("ari").unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn cache_hides_removed_until_evicted_is_not_assumed() {
        let store = Store::temporary();
        store.put_raw("x", b"1").unwrap();
        store.remove_raw("x").unwrap();
        assert!(store.get_raw("x").unwrap().is_none());
    }
}
