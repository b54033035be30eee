mod error;
mod file;
mod memory;

pub use self::error::StorageError;
pub use self::file::FileStorage;
pub use self::memory::MemStorage;

use serde::{Deserialize, Serialize};

use crate::raft::{HardState, LogEntry};

/// Everything a replica needs to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredState {
    pub hard_state: HardState,
    pub entries: Vec<LogEntry>,
}

/// Durable backing for the term/vote record and the log.
///
/// Every write is synchronous and write-through: when a call returns `Ok`
/// the data survives a crash. The replica treats any error as fatal.
pub trait Storage: Send {
    fn load(&mut self) -> Result<RecoveredState, StorageError>;

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError>;

    /// Appends entries that directly follow the last stored one.
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Drops every stored entry with index `>= index`.
    fn truncate_from(&mut self, index: u64) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "file")]
    File { data_dir: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

pub fn open_storage(config: &StorageConfig) -> Result<Box<dyn Storage>, StorageError> {
    match config {
        StorageConfig::Memory => Ok(Box::new(MemStorage::new())),
        StorageConfig::File { data_dir } => Ok(Box::new(FileStorage::open(data_dir)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn storage_config_default_is_memory() {
        assert!(matches!(StorageConfig::default(), StorageConfig::Memory));
    }

    #[test]
    fn storage_config_parses_tagged_json() {
        let cfg: StorageConfig =
            serde_json::from_str(r#"{"type": "file", "data_dir": "/tmp/r1"}"#).expect("parse");
        match cfg {
            StorageConfig::File { data_dir } => assert_eq!(data_dir, "/tmp/r1"),
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn open_storage_builds_each_backend() {
        let tmp = tempdir().expect("tempdir");
        let data_dir = tmp.path().join("node").to_string_lossy().to_string();

        for cfg in [StorageConfig::Memory, StorageConfig::File { data_dir }] {
            let mut storage = open_storage(&cfg).expect("open");
            let recovered = storage.load().expect("load");
            assert_eq!(recovered, RecoveredState::default());
        }
    }
}
