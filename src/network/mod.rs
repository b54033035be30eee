mod error;
mod local;

pub use self::error::NetworkError;
pub use self::local::{LocalNetwork, LocalTransport};

use async_trait::async_trait;

use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, ReplicaId, RequestVoteArgs, RequestVoteReply,
};

/// Outbound RPC path to the other replicas.
///
/// A call either yields the peer's reply or an error; the replica treats
/// every error as a lost message and retries on its own schedule. Calls for
/// different peers run concurrently, so implementations must not serialize
/// them behind one another.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        to: ReplicaId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, NetworkError>;

    async fn append_entries(
        &self,
        to: ReplicaId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, NetworkError>;
}
