//! Key-value storage for visitor-local state (identity, exposures, conversions).
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

/// A string key-value store, the equivalent of browser local storage.
///
/// Implementations must be safe to call from multiple threads and should not panic.
pub trait Storage {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Read `key` and deserialize it from JSON. Missing or unreadable values are `None`.
pub(crate) fn get_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Option<T> {
    let raw = storage.get(key)?;
    serde_json::from_str(&raw)
        .inspect_err(|err| {
            log::warn!(target: "edge_experiments", key; "ignoring corrupt stored value: {:?}", err);
        })
        .ok()
}

pub(crate) fn set_json<T: Serialize>(storage: &dyn Storage, key: &str, value: &T) -> Result<()> {
    storage.set(key, &serde_json::to_string(value)?)
}

/// Process-local storage. Everything is lost when the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write().map_err(poisoned)?;
        values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.write().map_err(poisoned)?;
        values.remove(key);
        Ok(())
    }
}

/// Storage persisted as a single JSON object in a file. The file is rewritten on every change.
///
/// A missing or corrupt file is treated as empty.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> FileStorage {
        let path = path.as_ref().to_owned();
        let values = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                log::warn!(target: "edge_experiments",
                           path:debug = path;
                           "starting with empty storage, file is corrupt: {:?}", err);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };

        FileStorage {
            path,
            values: RwLock::new(values),
        }
    }

    /// Apply `f` to a copy of the values, write the copy, and only then make it visible. A failed
    /// write leaves memory matching the file.
    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let mut values = self.values.write().map_err(poisoned)?;
        let mut updated = values.clone();
        f(&mut updated);
        let bytes = serde_json::to_vec_pretty(&updated)?;
        std::fs::write(&self.path, bytes)?;
        *values = updated;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Storage("storage lock poisoned".to_owned())
}
