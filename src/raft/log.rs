use serde::{Deserialize, Serialize};

use super::RaftError;

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// In-memory view of the replicated log.
///
/// Slot 0 holds a sentinel entry with term 0 so that `prev_log_index == 0`
/// always matches. Real entries start at index 1 and stay contiguous.
/// Durability is handled by the owner, which writes to `Storage` before
/// mutating this structure.
#[derive(Debug, Clone)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry {
                index: 0,
                term: 0,
                command: Vec::new(),
            }],
        }
    }

    /// Rebuilds a log from recovered entries, which must be contiguous from 1.
    pub fn from_entries(recovered: Vec<LogEntry>) -> Result<Self, RaftError> {
        let mut log = Self::new();
        for entry in recovered {
            log.append(entry)?;
        }
        Ok(log)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64 - 1
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entries.get(index as usize).map(|e| e.term)
    }

    /// True when this log holds an entry at `index` created in `term`.
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// Entries with index in `[start, start + max)`, clipped to the log end.
    pub fn get_entries(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        let end = (start as usize).saturating_add(max).min(self.entries.len());
        self.entries[start as usize..end].to_vec()
    }

    /// Entries with index in `(after, upto]`.
    pub fn get_range(&self, after: u64, upto: u64) -> Vec<LogEntry> {
        let upto = upto.min(self.last_index());
        if after >= upto {
            return Vec::new();
        }
        self.entries[after as usize + 1..=upto as usize].to_vec()
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<u64, RaftError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(RaftError::InvalidLogIndex(entry.index));
        }
        self.entries.push(entry);
        Ok(expected)
    }

    /// Drops every entry with index `>= index`.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), RaftError> {
        if index < 1 {
            return Err(RaftError::InvalidLogIndex(index));
        }

        if index > self.last_index() {
            return Ok(());
        }

        self.entries.truncate(index as usize);
        Ok(())
    }

    /// First index of the run of `term` entries that contains `index`.
    pub fn first_index_of_term(&self, term: u64, index: u64) -> u64 {
        let mut first = index.min(self.last_index());
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Highest index holding an entry of `term`, if any.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .take_while(|e| e.term >= term)
            .find(|e| e.term == term && e.index > 0)
            .map(|e| e.index)
    }

    /// Election restriction: a candidate's log must end at a
    /// `(term, index)` pair at least as large as ours.
    pub fn is_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        (last_log_term, last_log_index) >= (self.last_term(), self.last_index())
    }
}
