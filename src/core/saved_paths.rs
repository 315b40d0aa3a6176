//! Persistent per-path configuration overrides
//!
//! Paths created or edited at runtime are kept in a JSON file so they
//! survive restarts. Writes go through a temporary file and a rename,
//! and every failure is surfaced to the caller.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::PathConf;

#[derive(Debug, Serialize, Deserialize)]
struct SavedPath {
    name: String,
    conf: PathConf,
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// The on-disk store
pub struct SavedPathsStore {
    file: PathBuf,
}

impl SavedPathsStore {
    pub fn new(file: PathBuf) -> Self {
        Self { file }
    }

    /// Read all saved paths; a missing file is an empty store
    pub fn load(&self) -> Result<BTreeMap<String, PathConf>, StoreError> {
        let data = match fs::read(&self.file) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<SavedPath> =
            serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(entries.into_iter().map(|e| (e.name, e.conf)).collect())
    }

    /// Insert or replace a path
    pub fn save(&self, name: &str, conf: &PathConf) -> Result<(), StoreError> {
        let mut entries = self.load()?;
        entries.insert(name.to_string(), conf.clone());
        self.write(entries)
    }

    /// Remove a path; returns whether it existed
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut entries = self.load()?;
        let existed = entries.remove(name).is_some();
        if existed {
            self.write(entries)?;
        }
        Ok(existed)
    }

    fn write(&self, entries: BTreeMap<String, PathConf>) -> Result<(), StoreError> {
        let entries: Vec<SavedPath> = entries
            .into_iter()
            .map(|(name, conf)| SavedPath { name, conf })
            .collect();
        let data =
            serde_json::to_vec_pretty(&entries).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.file.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.file)?;
        Ok(())
    }
}
