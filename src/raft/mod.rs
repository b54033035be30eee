mod config;
mod election;
mod error;
mod log;
mod message;
mod node;
mod replication;
mod state;

pub use self::config::RaftConfig;
pub use self::error::RaftError;
pub use self::log::{Log, LogEntry};
pub use self::message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, Proposal, RequestVoteArgs, RequestVoteReply,
};
pub use self::node::{Outbox, RaftNode};
pub use self::state::{HardState, NodeRole, NodeState};

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
// Use external log crate, not our own log module
use ::log::{debug, error, info};

use crate::network::{NetworkError, Transport};
use crate::storage::Storage;

/// Position of a replica in the cluster, `0..replicas`.
pub type ReplicaId = usize;

struct Inner {
    id: ReplicaId,
    config: RaftConfig,
    node: Mutex<RaftNode>,
    transport: Arc<dyn Transport>,
    commit_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to a running replica. Clones share the same replica.
///
/// Inbound RPCs arrive through `request_vote` and `append_entries`; outbound
/// ones go through the `Transport` given to `start`. Committed commands come
/// out of the channel returned by `start`, in index order.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

impl Raft {
    /// Recovers the replica from `storage` and spawns its background tasks.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: RaftConfig,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Raft, mpsc::UnboundedReceiver<ApplyMsg>), RaftError> {
        let node = RaftNode::new(config.clone(), storage)?;
        let (shutdown_tx, _) = watch::channel(false);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();

        let raft = Raft {
            inner: Arc::new(Inner {
                id: config.id,
                config,
                node: Mutex::new(node),
                transport,
                commit_notify: Notify::new(),
                shutdown_tx,
            }),
        };

        tokio::spawn(raft.clone().run_driver());
        tokio::spawn(raft.clone().run_applier(apply_tx));
        info!(
            "Replica {} started in a cluster of {}",
            raft.inner.id, raft.inner.config.replicas
        );
        Ok((raft, apply_rx))
    }

    pub fn id(&self) -> ReplicaId {
        self.inner.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.inner.config
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError> {
        self.with_node(|node| node.handle_request_vote(&args, Instant::now()))
            .await
    }

    pub async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        self.with_node(|node| node.handle_append_entries(&args, Instant::now()))
            .await
    }

    /// Appends `command` if this replica leads and starts replicating it.
    ///
    /// Returns as soon as the entry is durable locally; there is no guarantee
    /// it will ever commit. Followers answer with `NotLeader` and a hint.
    pub async fn submit(&self, command: Vec<u8>) -> Result<Proposal, RaftError> {
        let (proposal, appends) = self
            .with_node(|node| {
                let proposal = node.propose(command)?;
                Ok((proposal, node.replication_batch()))
            })
            .await?;
        self.dispatch(Outbox {
            votes: Vec::new(),
            appends,
        });
        Ok(proposal)
    }

    /// Current term and whether this replica believes it leads.
    pub async fn get_role(&self) -> (u64, bool) {
        let node = self.inner.node.lock().await;
        (node.current_term(), node.is_leader())
    }

    pub async fn status(&self) -> NodeState {
        self.inner.node.lock().await.status()
    }

    /// Whether a read served locally right now would be linearizable.
    pub async fn has_read_lease(&self) -> bool {
        self.inner.node.lock().await.has_read_lease(Instant::now())
    }

    pub fn is_running(&self) -> bool {
        !*self.inner.shutdown_tx.borrow()
    }

    /// Stops the replica. Once this returns, no handler touches storage again,
    /// so the same storage can back a fresh replica.
    pub async fn shutdown(&self) {
        self.signal_shutdown();
        // Wait out any handler already holding the lock.
        drop(self.inner.node.lock().await);
    }

    fn signal_shutdown(&self) {
        if !self.inner.shutdown_tx.send_replace(true) {
            info!("Replica {} shutting down", self.inner.id);
        }
    }

    /// Runs `f` under the replica lock, waking the applier if the commit index
    /// moved. A storage failure stops the replica.
    async fn with_node<T, F>(&self, f: F) -> Result<T, RaftError>
    where
        F: FnOnce(&mut RaftNode) -> Result<T, RaftError>,
    {
        let mut node = self.inner.node.lock().await;
        if !self.is_running() {
            return Err(RaftError::NotRunning);
        }

        let commit_before = node.commit_index();
        let result = f(&mut node);
        if node.commit_index() > commit_before {
            self.inner.commit_notify.notify_one();
        }

        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Replica {} hit a fatal error: {}", self.inner.id, e);
                self.signal_shutdown();
            }
        }
        result
    }

    async fn step<F>(&self, f: F)
    where
        F: FnOnce(&mut RaftNode) -> Result<Outbox, RaftError>,
    {
        match self.with_node(f).await {
            Ok(outbox) => self.dispatch(outbox),
            Err(RaftError::NotRunning) => {}
            Err(e) => debug!("Replica {} failed to process event: {}", self.inner.id, e),
        }
    }

    /// Sends every message in `outbox` on its own task.
    fn dispatch(&self, outbox: Outbox) {
        for (to, args) in outbox.votes {
            tokio::spawn(self.clone().send_request_vote(to, args));
        }
        for (to, args) in outbox.appends {
            tokio::spawn(self.clone().send_append_entries(to, args));
        }
    }

    async fn send_request_vote(self, to: ReplicaId, args: RequestVoteArgs) {
        let call = self.inner.transport.request_vote(to, args.clone());
        let reply = match timeout(self.inner.config.rpc_deadline(), call).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return self.log_lost(to, "RequestVote", e),
            Err(_) => return self.log_lost(to, "RequestVote", NetworkError::Timeout),
        };
        self.step(|node| node.handle_vote_reply(to, &args, reply))
            .await;
    }

    async fn send_append_entries(self, to: ReplicaId, args: AppendEntriesArgs) {
        let sent_at = Instant::now();
        let call = self.inner.transport.append_entries(to, args.clone());
        let reply = match timeout(self.inner.config.rpc_deadline(), call).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return self.log_lost(to, "AppendEntries", e),
            Err(_) => return self.log_lost(to, "AppendEntries", NetworkError::Timeout),
        };
        self.step(|node| node.handle_append_reply(to, &args, reply, sent_at))
            .await;
    }

    fn log_lost(&self, to: ReplicaId, rpc: &str, e: NetworkError) {
        debug!("Replica {} {} to {} lost: {}", self.inner.id, rpc, to, e);
    }

    // Election timer and heartbeats.
    async fn run_driver(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let mut heartbeat = interval(self.inner.config.heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.is_running() {
            let deadline = self.inner.node.lock().await.election_deadline();

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = heartbeat.tick() => {
                    self.step(|node| {
                        Ok(Outbox {
                            votes: Vec::new(),
                            appends: node.replication_batch(),
                        })
                    })
                    .await;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.step(|node| node.on_election_timeout(Instant::now())).await;
                }
            }
        }
        debug!("Replica {} driver stopped", self.inner.id);
    }

    // Hands committed entries to the service, in order, exactly once per run.
    async fn run_applier(self, apply_tx: mpsc::UnboundedSender<ApplyMsg>) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        while self.is_running() {
            let pending = self.inner.node.lock().await.unapplied_entries();
            let Some(last) = pending.last().map(|entry| entry.index) else {
                tokio::select! {
                    _ = self.inner.commit_notify.notified() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            for entry in pending {
                let msg = ApplyMsg {
                    index: entry.index,
                    term: entry.term,
                    command: entry.command,
                };
                if apply_tx.send(msg).is_err() {
                    debug!("Replica {} apply channel closed", self.inner.id);
                    return;
                }
            }
            self.inner.node.lock().await.mark_applied(last);
        }
        debug!("Replica {} applier stopped", self.inner.id);
    }
}
