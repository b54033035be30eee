use thiserror::Error;

use super::ReplicaId;
use crate::network::NetworkError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not a leader (term {term}, leader hint {leader:?})")]
    NotLeader {
        term: u64,
        leader: Option<ReplicaId>,
    },

    #[error("Node is not running")]
    NotRunning,

    #[error("Invalid log index: {0}")]
    InvalidLogIndex(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl RaftError {
    /// Errors that leave the replica unable to continue safely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Storage(_))
    }
}
