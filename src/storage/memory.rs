use std::sync::{Arc, Mutex, MutexGuard};

use super::{RecoveredState, Storage, StorageError};
use crate::raft::{HardState, LogEntry};

#[derive(Debug, Default)]
struct MemInner {
    hard_state: HardState,
    entries: Vec<LogEntry>,
    fail_writes: bool,
}

/// Shared in-memory storage.
///
/// Clones share the same data, so a test can keep one handle, shut the
/// replica down and start a new one on the same state to model a restart.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    inner: Arc<Mutex<MemInner>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemInner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemInner>, StorageError> {
        let inner = self.lock()?;
        if inner.fail_writes {
            return Err(StorageError::Unavailable("write failure injected".to_string()));
        }
        Ok(inner)
    }

    /// Makes every subsequent write fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) -> Result<(), StorageError> {
        self.lock()?.fail_writes = fail;
        Ok(())
    }

    pub fn hard_state(&self) -> Result<HardState, StorageError> {
        Ok(self.lock()?.hard_state.clone())
    }

    pub fn entries(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.lock()?.entries.clone())
    }
}

impl Storage for MemStorage {
    fn load(&mut self) -> Result<RecoveredState, StorageError> {
        let inner = self.lock()?;
        Ok(RecoveredState {
            hard_state: inner.hard_state.clone(),
            entries: inner.entries.clone(),
        })
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        self.writable()?.hard_state = state.clone();
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut inner = self.writable()?;
        let mut next = inner.entries.last().map(|e| e.index).unwrap_or(0) + 1;
        for entry in entries {
            if entry.index != next {
                return Err(StorageError::Corrupt(format!(
                    "append at index {} but next slot is {next}",
                    entry.index
                )));
            }
            next += 1;
        }
        inner.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), StorageError> {
        self.writable()?.entries.retain(|e| e.index < index);
        Ok(())
    }
}
