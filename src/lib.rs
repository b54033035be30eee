// Consensus core
pub mod raft;

// Durability and transport
pub mod network;
pub mod storage;

// Public exports
pub use network::{LocalNetwork, NetworkError, Transport};
pub use raft::{ApplyMsg, Proposal, Raft, RaftConfig, RaftError, ReplicaId};
pub use storage::{open_storage, Storage, StorageConfig};
