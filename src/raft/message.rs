use serde::{Deserialize, Serialize};

use super::{LogEntry, ReplicaId};

// Leader election messages

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: ReplicaId,
    pub last_log_index: u64,
    pub last_log_term: u64,
    /// Probe only: the voter answers as if `term` were real but keeps its
    /// own state untouched.
    #[serde(default)]
    pub pre_vote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

// Log replication messages

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: ReplicaId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesArgs {
    /// Index of the last entry this request would leave in place.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// Term of the follower's entry at `prev_log_index`, when it has one.
    #[serde(default)]
    pub conflict_term: Option<u64>,
    /// Where the leader should resume probing after a mismatch.
    #[serde(default)]
    pub conflict_index: Option<u64>,
}

impl AppendEntriesReply {
    pub(crate) fn accepted(term: u64) -> Self {
        Self {
            term,
            success: true,
            conflict_term: None,
            conflict_index: None,
        }
    }

    pub(crate) fn rejected(term: u64) -> Self {
        Self {
            term,
            success: false,
            conflict_term: None,
            conflict_index: None,
        }
    }
}

/// A committed entry handed to the hosting service, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// Where a freshly submitted command landed. The command is committed only
/// if the service later observes this same term at this index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}
