use thiserror::Error;

use crate::raft::ReplicaId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Replica {0} is unreachable")]
    Unreachable(ReplicaId),

    #[error("Message dropped")]
    Dropped,

    #[error("Timeout error")]
    Timeout,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}
