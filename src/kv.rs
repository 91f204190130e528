use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("invalid key '{0}'")]
    InvalidKey(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Flat key-value slots holding database images and workspace bookkeeping.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError>;
    fn remove(&self, key: &str) -> Result<(), KvError>;
}

pub type SharedKv = Arc<dyn KvStore>;

pub fn get_json<T: serde::de::DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>, KvError> {
    match kv.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub fn set_json<T: serde::Serialize>(kv: &dyn KvStore, key: &str, value: &T) -> Result<(), KvError> {
    let bytes = serde_json::to_vec(value)?;
    kv.set(key, &bytes)
}

#[derive(Clone, Default)]
pub struct MemoryKv {
    slots: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self { Self::default() }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.slots.get(key).map(|v| v.value().clone()))
    }
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.slots.insert(key.to_string(), value.to_vec());
        Ok(())
    }
    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.slots.remove(key);
        Ok(())
    }
}

/// One file per key under a data directory.
#[derive(Clone)]
pub struct FsKv {
    dir: Arc<PathBuf>,
}

impl FsKv {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Arc::new(dir.into()) }
    }

    pub fn dir(&self) -> &Path { &self.dir }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        let ok = !key.is_empty()
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !ok {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

impl KvStore for FsKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(self.dir.as_path())?;
        // atomic replace
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
    fn remove(&self, key: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
