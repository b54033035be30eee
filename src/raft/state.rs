use serde::{Deserialize, Serialize};

use super::ReplicaId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// The durable part of a replica's state. It must reach storage before any
/// reply that depends on it leaves the replica.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<ReplicaId>,
}

/// Point-in-time view of a replica, returned by `Raft::status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub id: ReplicaId,
    pub current_term: u64,
    pub voted_for: Option<ReplicaId>,
    pub role: NodeRole,
    pub leader_id: Option<ReplicaId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}
