//! Versioned metadata store backing topology, parameters and plan records.
//!
//! Every key carries a monotonically increasing version. Writers that want
//! read-modify-write semantics use [`MetadataStore::put_expecting`], which
//! fails with [`LatticeError::Conflict`] when another writer got in between.
//! Two backends: an in-memory map for tests, and RocksDB for deployments.

use crate::error::{LatticeError, Result};
use crate::topology::{Parameters, Topology};
use rocksdb::{Options, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

pub const TOPOLOGY_KEY: &str = "topology";
pub const PARAMETERS_KEY: &str = "parameters";
pub const PLAN_COUNTER_KEY: &str = "plan_counter";
pub const PLAN_PREFIX: &str = "plan/";

/// A stored value together with its store-assigned version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub data: Vec<u8>,
}

/// Key-value metadata store with per-key versions.
pub trait MetadataStore: Send + Sync {
    /// Read a key with its current version.
    fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write a key unconditionally. Returns the new version.
    fn put(&self, key: &str, data: &[u8]) -> Result<u64>;

    /// Write a key only if its current version matches `expected`
    /// (`None` meaning the key must be absent). Returns the new version
    /// or [`LatticeError::Conflict`].
    fn put_expecting(&self, key: &str, data: &[u8], expected: Option<u64>) -> Result<u64>;

    /// Delete a key. Missing keys are not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// List all keys with the given prefix.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Serialization helpers shared by both backends.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(data)?)
}

/// Typed accessors layered on any [`MetadataStore`].
pub struct StoreHandle<'a> {
    store: &'a dyn MetadataStore,
}

impl<'a> StoreHandle<'a> {
    pub fn new(store: &'a dyn MetadataStore) -> Self {
        Self { store }
    }

    pub fn load_topology(&self) -> Result<Option<(Topology, u64)>> {
        match self.store.get(TOPOLOGY_KEY)? {
            Some(v) => Ok(Some((decode(&v.data)?, v.version))),
            None => Ok(None),
        }
    }

    pub fn save_topology(&self, topo: &Topology, expected: Option<u64>) -> Result<u64> {
        self.store
            .put_expecting(TOPOLOGY_KEY, &encode(topo)?, expected)
    }

    pub fn load_parameters(&self) -> Result<Option<(Parameters, u64)>> {
        match self.store.get(PARAMETERS_KEY)? {
            Some(v) => Ok(Some((decode(&v.data)?, v.version))),
            None => Ok(None),
        }
    }

    pub fn save_parameters(&self, params: &Parameters, expected: Option<u64>) -> Result<u64> {
        self.store
            .put_expecting(PARAMETERS_KEY, &encode(params)?, expected)
    }

    /// Allocate the next plan id. Retries on contention with other
    /// allocators against the same store.
    pub fn next_plan_id(&self) -> Result<u64> {
        loop {
            let current = self.store.get(PLAN_COUNTER_KEY)?;
            let (next, expected) = match &current {
                Some(v) => (decode::<u64>(&v.data)? + 1, Some(v.version)),
                None => (1u64, None),
            };
            match self
                .store
                .put_expecting(PLAN_COUNTER_KEY, &encode(&next)?, expected)
            {
                Ok(_) => return Ok(next),
                Err(LatticeError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap();
        let version = entries.get(key).map(|v| v.version).unwrap_or(0) + 1;
        entries.insert(
            key.to_string(),
            Versioned {
                version,
                data: data.to_vec(),
            },
        );
        Ok(version)
    }

    fn put_expecting(&self, key: &str, data: &[u8], expected: Option<u64>) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap();
        let current = entries.get(key).map(|v| v.version);
        if current != expected {
            return Err(LatticeError::Conflict(format!(
                "version mismatch on key {}",
                key
            )));
        }
        let version = current.unwrap_or(0) + 1;
        entries.insert(
            key.to_string(),
            Versioned {
                version,
                data: data.to_vec(),
            },
        );
        Ok(version)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap();
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// RocksDB-backed store. Versions are stored inline ahead of the payload.
pub struct RocksStore {
    db: DB,
    // Serializes compare-and-set cycles; RocksDB has no native CAS.
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn read(&self, key: &str) -> Result<Option<Versioned>> {
        match self.db.get(key.as_bytes())? {
            Some(raw) => {
                if raw.len() < 8 {
                    return Err(LatticeError::Storage(format!(
                        "corrupt record for key {}",
                        key
                    )));
                }
                let mut version_bytes = [0u8; 8];
                version_bytes.copy_from_slice(&raw[..8]);
                Ok(Some(Versioned {
                    version: u64::from_be_bytes(version_bytes),
                    data: raw[8..].to_vec(),
                }))
            }
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, version: u64, data: &[u8]) -> Result<()> {
        let mut raw = Vec::with_capacity(8 + data.len());
        raw.extend_from_slice(&version.to_be_bytes());
        raw.extend_from_slice(data);
        self.db.put(key.as_bytes(), raw)?;
        self.db.flush()?;
        Ok(())
    }
}

impl MetadataStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.read(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<u64> {
        let _guard = self.write_lock.lock().unwrap();
        let version = self.read(key)?.map(|v| v.version).unwrap_or(0) + 1;
        self.write(key, version, data)?;
        Ok(version)
    }

    fn put_expecting(&self, key: &str, data: &[u8], expected: Option<u64>) -> Result<u64> {
        let _guard = self.write_lock.lock().unwrap();
        let current = self.read(key)?.map(|v| v.version);
        if current != expected {
            return Err(LatticeError::Conflict(format!(
                "version mismatch on key {}",
                key
            )));
        }
        let version = current.unwrap_or(0) + 1;
        self.write(key, version, data)?;
        Ok(version)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            prefix.as_bytes(),
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}
