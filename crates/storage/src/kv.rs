//! Basic key-value storage types.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{convert::AsRef, path::Path};

/// The data storage trait which defines the methods a storage implementation
/// should fulfill.
pub trait KeyValueStorage {
    /// Load the storage from the provided path.
    fn open(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Get an arbitrary item from the storage.
    fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: DeserializeOwned;

    /// Insert an item into the storage.
    fn insert<K, V>(&self, key: K, value: V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize;

    /// Remove an item from the storage, returning whether it was present.
    fn remove<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>;

    /// Return every value whose key starts with `prefix`.
    fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<V>>
    where
        V: DeserializeOwned;

    /// Save the storage to disk so that it is safe to stop the application.
    fn persist(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
/// The default key value storage implementation, backed by an embedded
/// log-structured database.
pub struct DefaultKeyValueStorage {
    db: sled::Db,
}

impl KeyValueStorage for DefaultKeyValueStorage {
    fn open(path: &Path) -> Result<Self> {
        log::trace!("opening storage {}", path.display());
        Ok(Self {
            db: sled::open(path)
                .with_context(|| format!("failed to open storage path {}", path.display()))?,
        })
    }

    fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: DeserializeOwned,
    {
        match self.db.get(key).context("failed to retrieve value for key")? {
            None => Ok(None),
            Some(value) => Ok(Some(
                rmp_serde::from_slice(&value).context("deserialize value")?,
            )),
        }
    }

    fn insert<K, V>(&self, key: K, value: V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        self.db
            .insert(
                key,
                rmp_serde::to_vec(&value).context("failed to serialize value")?,
            )
            .context("failed to insert key and value")?;
        Ok(())
    }

    fn remove<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.db.remove(key).context("failed to remove value")?.is_some())
    }

    fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<V>>
    where
        V: DeserializeOwned,
    {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (_, value) = item.context("scan storage")?;
            out.push(rmp_serde::from_slice(&value).context("deserialize scanned value")?);
        }
        Ok(out)
    }

    fn persist(&self) -> Result<()> {
        self.db.flush().context("failed to persist db")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
/// An in-memory implementation used by tests so that integration tests do
/// not need a writable filesystem path.
pub struct MemoryKeyValueStorage {
    db: std::sync::Arc<std::sync::Mutex<std::collections::BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl KeyValueStorage for MemoryKeyValueStorage {
    fn open(_path: &Path) -> Result<Self> {
        Ok(Self::default())
    }

    fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: DeserializeOwned,
    {
        let db = self.db.lock().expect("memory storage lock");
        match db.get(key.as_ref()) {
            None => Ok(None),
            Some(value) => Ok(Some(rmp_serde::from_slice(value)?)),
        }
    }

    fn insert<K, V>(&self, key: K, value: V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let mut db = self.db.lock().expect("memory storage lock");
        db.insert(key.as_ref().to_vec(), rmp_serde::to_vec(&value)?);
        Ok(())
    }

    fn remove<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let mut db = self.db.lock().expect("memory storage lock");
        Ok(db.remove(key.as_ref()).is_some())
    }

    fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<V>>
    where
        V: DeserializeOwned,
    {
        let db = self.db.lock().expect("memory storage lock");
        db.iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| rmp_serde::from_slice(v).map_err(Into::into))
            .collect()
    }

    fn persist(&self) -> Result<()> {
        Ok(())
    }
}
