use std::cmp::Ordering;
use std::time::Duration;

use tokio::time::Instant;
// Use external log crate, not our own log module
use ::log::{debug, error, info};

use super::{
    AppendEntriesArgs, HardState, Log, LogEntry, NodeRole, NodeState, Proposal, RaftConfig,
    RaftError, ReplicaId, RequestVoteArgs,
};
use crate::storage::Storage;

/// Messages a handler wants sent once the replica lock is released.
#[derive(Debug, Default)]
pub struct Outbox {
    pub votes: Vec<(ReplicaId, RequestVoteArgs)>,
    pub appends: Vec<(ReplicaId, AppendEntriesArgs)>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty() && self.appends.is_empty()
    }
}

/// Outcome of comparing a message's term against ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TermCheck {
    /// The message belongs to an older term and must be rejected.
    Stale,
    /// The message is in our (possibly just adopted) current term.
    Current,
}

/// Per-peer replication progress. Only exists while this replica leads.
#[derive(Debug, Clone)]
pub(crate) struct LeaderState {
    pub next_index: Vec<u64>,
    pub match_index: Vec<u64>,
    // Send time of the newest acknowledged AppendEntries per peer.
    pub last_ack: Vec<Option<Instant>>,
}

impl LeaderState {
    pub(crate) fn new(replicas: usize, last_log_index: u64) -> Self {
        Self {
            next_index: vec![last_log_index + 1; replicas],
            match_index: vec![0; replicas],
            last_ack: vec![None; replicas],
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum RoleState {
    Follower,
    Candidate { votes: Vec<bool> },
    Leader(LeaderState),
}

/// An in-flight pre-vote round, run while still a follower.
#[derive(Debug, Clone)]
pub(crate) struct PreVoteRound {
    pub term: u64,
    pub granted: Vec<bool>,
}

/// The replica state machine. All fields are guarded by the lock in `Raft`;
/// no method here performs network I/O.
pub struct RaftNode {
    // Node identity
    pub(crate) id: ReplicaId,
    pub(crate) config: RaftConfig,

    // Raft state
    pub(crate) hard_state: HardState,
    pub(crate) log: Log,
    storage: Box<dyn Storage>,
    pub(crate) role: RoleState,
    pub(crate) leader_id: Option<ReplicaId>,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,

    // Election state
    pub(crate) election_deadline: Instant,
    pub(crate) last_leader_contact: Option<Instant>,
    pub(crate) pre_vote: Option<PreVoteRound>,
}

impl RaftNode {
    pub fn new(config: RaftConfig, mut storage: Box<dyn Storage>) -> Result<Self, RaftError> {
        config.validate()?;

        let recovered = storage.load()?;
        let log = Log::from_entries(recovered.entries)?;
        info!(
            "Replica {} recovered term {} (voted for {:?}) with {} log entries",
            config.id,
            recovered.hard_state.current_term,
            recovered.hard_state.voted_for,
            log.last_index()
        );

        let election_deadline = Instant::now() + config.election_timeout();
        Ok(Self {
            id: config.id,
            config,
            hard_state: recovered.hard_state,
            log,
            storage,
            role: RoleState::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            election_deadline,
            last_leader_contact: None,
            pre_vote: None,
        })
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn current_term(&self) -> u64 {
        self.hard_state.current_term
    }

    pub fn voted_for(&self) -> Option<ReplicaId> {
        self.hard_state.voted_for
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn role(&self) -> NodeRole {
        match self.role {
            RoleState::Follower => NodeRole::Follower,
            RoleState::Candidate { .. } => NodeRole::Candidate,
            RoleState::Leader(_) => NodeRole::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, RoleState::Leader(_))
    }

    pub fn leader_id(&self) -> Option<ReplicaId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn status(&self) -> NodeState {
        NodeState {
            id: self.id,
            current_term: self.hard_state.current_term,
            voted_for: self.hard_state.voted_for,
            role: self.role(),
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    /// When the election timer fires. Leaders have no timer.
    pub fn election_deadline(&self) -> Option<Instant> {
        if self.is_leader() {
            None
        } else {
            Some(self.election_deadline)
        }
    }

    pub(crate) fn reset_election_timer(&mut self, now: Instant) {
        self.election_deadline = now + self.config.election_timeout();
    }

    /// Writes the term/vote record, then adopts it in memory.
    pub(crate) fn persist_hard_state(&mut self, state: HardState) -> Result<(), RaftError> {
        if state != self.hard_state {
            self.storage.save_hard_state(&state)?;
            self.hard_state = state;
        }
        Ok(())
    }

    /// The guard every inbound message and reply passes through first.
    ///
    /// A newer term forces a step-down to follower with a cleared vote before
    /// the message is looked at any further.
    pub(crate) fn observe_term(&mut self, term: u64) -> Result<TermCheck, RaftError> {
        match term.cmp(&self.hard_state.current_term) {
            Ordering::Less => Ok(TermCheck::Stale),
            Ordering::Equal => Ok(TermCheck::Current),
            Ordering::Greater => {
                self.step_down(term)?;
                Ok(TermCheck::Current)
            }
        }
    }

    pub(crate) fn step_down(&mut self, term: u64) -> Result<(), RaftError> {
        if term > self.hard_state.current_term {
            self.persist_hard_state(HardState {
                current_term: term,
                voted_for: None,
            })?;
            self.leader_id = None;
        }
        self.pre_vote = None;

        if !matches!(self.role, RoleState::Follower) {
            info!(
                "Replica {} stepping down from {:?} in term {}",
                self.id,
                self.role(),
                self.hard_state.current_term
            );
            // A deposed leader's timer went stale while it led.
            if self.is_leader() {
                self.reset_election_timer(Instant::now());
            }
            self.role = RoleState::Follower;
        }
        Ok(())
    }

    pub(crate) fn append_durably(&mut self, entries: Vec<LogEntry>) -> Result<(), RaftError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.storage.append(&entries)?;
        for entry in entries {
            self.log.append(entry)?;
        }
        Ok(())
    }

    pub(crate) fn truncate_durably(&mut self, from: u64) -> Result<(), RaftError> {
        if from <= self.commit_index {
            error!(
                "Replica {} refusing to truncate committed entry {} (commit index {})",
                self.id, from, self.commit_index
            );
            return Err(RaftError::InvalidLogIndex(from));
        }
        debug!("Replica {} truncating log from index {}", self.id, from);
        self.storage.truncate_from(from)?;
        self.log.truncate_from(from)
    }

    /// Appends a command as leader. Returns where it landed without waiting
    /// for it to commit.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<Proposal, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                term: self.hard_state.current_term,
                leader: self.leader_id,
            });
        }

        let proposal = Proposal {
            index: self.log.last_index() + 1,
            term: self.hard_state.current_term,
        };
        self.append_durably(vec![LogEntry {
            index: proposal.index,
            term: proposal.term,
            command,
        }])?;
        debug!(
            "Replica {} appended entry {} in term {}",
            self.id, proposal.index, proposal.term
        );

        // A single-replica cluster commits on its own append.
        self.advance_commit_index();
        Ok(proposal)
    }

    /// Committed entries not yet handed to the service, in index order.
    pub fn unapplied_entries(&self) -> Vec<LogEntry> {
        self.log.get_range(self.last_applied, self.commit_index)
    }

    pub fn mark_applied(&mut self, index: u64) {
        let index = index.min(self.commit_index);
        if index > self.last_applied {
            self.last_applied = index;
        }
    }

    /// True while a majority acknowledged this leader within the election
    /// floor. Those replicas refuse newer terms until the floor passes, so
    /// no other leader can have been elected meanwhile.
    pub fn has_read_lease(&self, now: Instant) -> bool {
        let leader = match &self.role {
            RoleState::Leader(leader) => leader,
            _ => return false,
        };
        let floor: Duration = self.config.election_floor();
        let fresh = self
            .config
            .peers()
            .filter(|peer| {
                leader.last_ack[*peer].is_some_and(|sent| now.saturating_duration_since(sent) < floor)
            })
            .count();
        fresh + 1 >= self.config.quorum()
    }
}
