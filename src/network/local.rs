use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

use super::{NetworkError, Transport};
use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, Raft, ReplicaId, RequestVoteArgs, RequestVoteReply,
};

// Unreliable mode: share of messages lost and the longest extra delay.
const DROP_PERCENT: u32 = 10;
const MAX_JITTER_MS: u64 = 27;

#[derive(Debug, Default)]
struct Faults {
    disconnected: HashSet<ReplicaId>,
    // Replica -> partition group. Empty means fully connected.
    groups: HashMap<ReplicaId, usize>,
    unreliable: bool,
    latency: Duration,
}

impl Faults {
    fn reachable(&self, from: ReplicaId, to: ReplicaId) -> bool {
        if self.disconnected.contains(&from) || self.disconnected.contains(&to) {
            return false;
        }
        if self.groups.is_empty() {
            return true;
        }
        match (self.groups.get(&from), self.groups.get(&to)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// In-process network joining replicas of one cluster.
///
/// Calls are delivered straight to the target's `Raft` handle. Disconnects,
/// partitions, latency and random loss are injected here so a cluster can be
/// exercised without sockets.
#[derive(Default)]
pub struct LocalNetwork {
    endpoints: RwLock<HashMap<ReplicaId, Raft>>,
    faults: Mutex<Faults>,
    rpc_count: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport used by replica `from` to reach its peers.
    pub fn transport(self: &Arc<Self>, from: ReplicaId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from,
            net: Arc::clone(self),
        })
    }

    /// Routes calls for `id` to `raft`, replacing any previous instance.
    pub async fn register(&self, id: ReplicaId, raft: Raft) {
        self.endpoints.write().await.insert(id, raft);
    }

    pub async fn unregister(&self, id: ReplicaId) -> Option<Raft> {
        self.endpoints.write().await.remove(&id)
    }

    /// Cuts `id` off from everyone, both directions.
    pub async fn disconnect(&self, id: ReplicaId) {
        debug!("Network: disconnecting replica {id}");
        self.faults.lock().await.disconnected.insert(id);
    }

    pub async fn connect(&self, id: ReplicaId) {
        debug!("Network: connecting replica {id}");
        self.faults.lock().await.disconnected.remove(&id);
    }

    /// Splits the cluster into groups that only talk among themselves.
    /// Replicas not listed are isolated.
    pub async fn partition(&self, groups: &[&[ReplicaId]]) {
        info!("Network: partitioning into {groups:?}");
        let mut faults = self.faults.lock().await;
        faults.groups = groups
            .iter()
            .enumerate()
            .flat_map(|(group, members)| members.iter().map(move |id| (*id, group)))
            .collect();
    }

    pub async fn heal(&self) {
        info!("Network: healing all partitions");
        let mut faults = self.faults.lock().await;
        faults.groups.clear();
        faults.disconnected.clear();
    }

    /// In unreliable mode some messages are dropped and the rest delayed.
    pub async fn set_reliable(&self, reliable: bool) {
        self.faults.lock().await.unreliable = !reliable;
    }

    /// Fixed one-way delay added to every message.
    pub async fn set_latency(&self, latency: Duration) {
        self.faults.lock().await.latency = latency;
    }

    /// Total RPCs attempted, delivered or not.
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::Relaxed)
    }

    /// Drops every registered endpoint.
    pub async fn clear(&self) {
        self.endpoints.write().await.clear();
    }

    async fn is_reachable(&self, from: ReplicaId, to: ReplicaId) -> bool {
        self.faults.lock().await.reachable(from, to)
    }

    // One network hop: delay, loss and reachability, in that order.
    async fn hop(&self, from: ReplicaId, to: ReplicaId) -> Result<(), NetworkError> {
        let (unreliable, latency) = {
            let faults = self.faults.lock().await;
            (faults.unreliable, faults.latency)
        };

        let (drop, jitter) = if unreliable {
            let mut rng = rand::rng();
            (
                rng.random_range(0..100) < DROP_PERCENT,
                Duration::from_millis(rng.random_range(0..MAX_JITTER_MS)),
            )
        } else {
            (false, Duration::ZERO)
        };

        let delay = latency + jitter;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if drop {
            return Err(NetworkError::Dropped);
        }
        if !self.is_reachable(from, to).await {
            return Err(NetworkError::Unreachable(to));
        }
        Ok(())
    }

    async fn route(&self, from: ReplicaId, to: ReplicaId) -> Result<Raft, NetworkError> {
        self.rpc_count.fetch_add(1, Ordering::Relaxed);
        self.hop(from, to).await?;
        self.endpoints
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or(NetworkError::Unreachable(to))
    }
}

/// One replica's view of a `LocalNetwork`.
pub struct LocalTransport {
    from: ReplicaId,
    net: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        to: ReplicaId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, NetworkError> {
        let target = self.net.route(self.from, to).await?;
        let reply = target
            .request_vote(args)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;
        // The reply travels back over the same network.
        self.net.hop(to, self.from).await?;
        Ok(reply)
    }

    async fn append_entries(
        &self,
        to: ReplicaId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, NetworkError> {
        let target = self.net.route(self.from, to).await?;
        let reply = target
            .append_entries(args)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;
        self.net.hop(to, self.from).await?;
        Ok(reply)
    }
}
