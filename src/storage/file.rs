use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::{RecoveredState, Storage, StorageError};
use crate::raft::{HardState, LogEntry};

const HARD_STATE_FILE: &str = "hard_state.bin";
const LOG_FILE: &str = "log.bin";

/// On-disk storage under a single directory.
///
/// `hard_state.bin` holds one bincode record and is replaced atomically.
/// `log.bin` is a sequence of bincode `LogEntry` frames; appends are fsynced
/// and truncation cuts the file at a recorded frame boundary.
pub struct FileStorage {
    dir: PathBuf,
    log_file: File,
    // Byte offset where each stored entry starts; offsets[i] is index i + 1.
    offsets: Vec<u64>,
    log_len: u64,
}

impl FileStorage {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let log_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;

        let mut storage = Self {
            dir,
            log_file,
            offsets: Vec::new(),
            log_len: 0,
        };
        storage.scan_log()?;
        info!(
            "Raft storage opened at {:?} with {} log entries",
            storage.dir,
            storage.offsets.len()
        );
        Ok(storage)
    }

    fn scan_log(&mut self) -> Result<Vec<LogEntry>, StorageError> {
        let mut buffer = Vec::new();
        File::open(self.dir.join(LOG_FILE))?.read_to_end(&mut buffer)?;

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut offset = 0usize;
        while offset < buffer.len() {
            match bincode::decode_from_slice::<LogEntry, _>(
                &buffer[offset..],
                bincode::config::standard(),
            ) {
                Ok((entry, used)) => {
                    let expected = entries.len() as u64 + 1;
                    if entry.index != expected {
                        return Err(StorageError::Corrupt(format!(
                            "entry at byte {offset} has index {} (expected {expected})",
                            entry.index
                        )));
                    }
                    offsets.push(offset as u64);
                    entries.push(entry);
                    offset += used;
                }
                Err(e) => {
                    // A crash mid-append leaves a partial frame. It was never
                    // acknowledged, so dropping it is safe.
                    warn!(
                        "Discarding {} trailing bytes of {:?}: {e}",
                        buffer.len() - offset,
                        self.dir.join(LOG_FILE)
                    );
                    self.log_file.set_len(offset as u64)?;
                    self.log_file.sync_all()?;
                    break;
                }
            }
        }

        self.offsets = offsets;
        self.log_len = offset as u64;
        Ok(entries)
    }

    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        let path = self.dir.join(HARD_STATE_FILE);
        if !path.exists() {
            return Ok(HardState::default());
        }

        let buffer = fs::read(&path)?;
        let (state, _): (HardState, usize) =
            bincode::decode_from_slice(&buffer, bincode::config::standard())
                .map_err(|e| StorageError::DecodeError(e.to_string()))?;
        Ok(state)
    }

    fn sync_dir(&self) -> Result<(), StorageError> {
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load(&mut self) -> Result<RecoveredState, StorageError> {
        let hard_state = self.load_hard_state()?;
        let entries = self.scan_log()?;
        Ok(RecoveredState {
            hard_state,
            entries,
        })
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        let encoded = bincode::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| StorageError::EncodeError(e.to_string()))?;

        let tmp = self.dir.join(format!("{HARD_STATE_FILE}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(HARD_STATE_FILE))?;
        self.sync_dir()
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut next = self.offsets.len() as u64 + 1;
        let mut buffer = Vec::new();
        let mut new_offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.index != next {
                return Err(StorageError::Corrupt(format!(
                    "append at index {} but next slot is {next}",
                    entry.index
                )));
            }
            new_offsets.push(self.log_len + buffer.len() as u64);
            let encoded = bincode::encode_to_vec(entry, bincode::config::standard())
                .map_err(|e| StorageError::EncodeError(e.to_string()))?;
            buffer.extend_from_slice(&encoded);
            next += 1;
        }

        self.log_file.write_all(&buffer)?;
        self.log_file.sync_data()?;

        self.offsets.extend(new_offsets);
        self.log_len += buffer.len() as u64;
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), StorageError> {
        let keep = index.saturating_sub(1) as usize;
        if keep >= self.offsets.len() {
            return Ok(());
        }

        let cut = self.offsets[keep];
        self.log_file.set_len(cut)?;
        self.log_file.sync_all()?;

        self.offsets.truncate(keep);
        self.log_len = cut;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            command: format!("cmd{index}").into_bytes(),
        }
    }

    #[test]
    fn fresh_directory_recovers_empty_state() {
        let tmp = tempdir().expect("tempdir");
        let mut storage = FileStorage::open(tmp.path().join("r0")).expect("open");

        let recovered = storage.load().expect("load");
        assert_eq!(recovered.hard_state, HardState::default());
        assert!(recovered.entries.is_empty());
    }

    #[test]
    fn hard_state_and_entries_survive_reopen() {
        let tmp = tempdir().expect("tempdir");

        {
            let mut storage = FileStorage::open(tmp.path()).expect("open");
            storage
                .save_hard_state(&HardState {
                    current_term: 7,
                    voted_for: Some(2),
                })
                .expect("save");
            storage.append(&[entry(1, 1), entry(2, 1)]).expect("append");
            storage.append(&[entry(3, 7)]).expect("append");
        }

        // New instance reading from the same directory sees everything.
        let mut storage = FileStorage::open(tmp.path()).expect("reopen");
        let recovered = storage.load().expect("load");
        assert_eq!(recovered.hard_state.current_term, 7);
        assert_eq!(recovered.hard_state.voted_for, Some(2));
        assert_eq!(recovered.entries, vec![entry(1, 1), entry(2, 1), entry(3, 7)]);
        assert!(!tmp.path().join("hard_state.bin.tmp").exists());
    }

    #[test]
    fn truncate_then_append_rewrites_suffix() {
        let tmp = tempdir().expect("tempdir");

        {
            let mut storage = FileStorage::open(tmp.path()).expect("open");
            storage
                .append(&[entry(1, 1), entry(2, 1), entry(3, 1)])
                .expect("append");
            storage.truncate_from(2).expect("truncate");
            storage.append(&[entry(2, 5)]).expect("append");

            // Truncating beyond the end leaves the log alone.
            storage.truncate_from(9).expect("truncate");
        }

        let mut storage = FileStorage::open(tmp.path()).expect("reopen");
        let recovered = storage.load().expect("load");
        assert_eq!(recovered.entries, vec![entry(1, 1), entry(2, 5)]);
    }

    #[test]
    fn append_rejects_index_gap() {
        let tmp = tempdir().expect("tempdir");
        let mut storage = FileStorage::open(tmp.path()).expect("open");

        storage.append(&[entry(1, 1)]).expect("append");
        let err = storage.append(&[entry(3, 1)]).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[test]
    fn torn_tail_is_discarded_on_open() {
        let tmp = tempdir().expect("tempdir");

        {
            let mut storage = FileStorage::open(tmp.path()).expect("open");
            storage.append(&[entry(1, 1), entry(2, 2)]).expect("append");
        }

        // Simulate a crash in the middle of writing a third frame.
        let full = bincode::encode_to_vec(entry(3, 2), bincode::config::standard())
            .expect("encode");
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(tmp.path().join(LOG_FILE))
                .expect("open log");
            file.write_all(&full[..full.len() - 2]).expect("write");
        }

        let mut storage = FileStorage::open(tmp.path()).expect("reopen");
        let recovered = storage.load().expect("load");
        assert_eq!(recovered.entries.len(), 2);

        // The next append lands cleanly after the surviving frames.
        storage.append(&[entry(3, 3)]).expect("append");
        let recovered = FileStorage::open(tmp.path())
            .expect("reopen")
            .load()
            .expect("load");
        assert_eq!(recovered.entries.last(), Some(&entry(3, 3)));
    }
}
