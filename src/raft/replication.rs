use tokio::time::Instant;
// Use external log crate, not our own log module
use ::log::{debug, error, info};

use super::node::{Outbox, RaftNode, RoleState, TermCheck};
use super::{AppendEntriesArgs, AppendEntriesReply, RaftError, ReplicaId};

impl RaftNode {
    /// AppendEntries for `peer` starting at its `next_index`. Empty entries
    /// make it a plain heartbeat.
    pub(crate) fn build_append(&self, peer: ReplicaId) -> Option<AppendEntriesArgs> {
        let leader = match &self.role {
            RoleState::Leader(leader) => leader,
            _ => return None,
        };

        let next_idx = (*leader.next_index.get(peer)?).clamp(1, self.log.last_index() + 1);
        let prev_log_index = next_idx - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);

        Some(AppendEntriesArgs {
            term: self.hard_state.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self
                .log
                .get_entries(next_idx, self.config.max_entries_per_append),
            leader_commit: self.commit_index,
        })
    }

    /// One AppendEntries per peer. Empty unless this replica leads.
    pub fn replication_batch(&self) -> Vec<(ReplicaId, AppendEntriesArgs)> {
        self.config
            .peers()
            .filter_map(|peer| self.build_append(peer).map(|args| (peer, args)))
            .collect()
    }

    pub fn handle_append_entries(
        &mut self,
        args: &AppendEntriesArgs,
        now: Instant,
    ) -> Result<AppendEntriesReply, RaftError> {
        // Reply false if term < currentTerm
        if self.observe_term(args.term)? == TermCheck::Stale {
            return Ok(AppendEntriesReply::rejected(self.hard_state.current_term));
        }
        let term = self.hard_state.current_term;

        match self.role {
            RoleState::Leader(_) => {
                error!(
                    "Replica {} saw a second leader {} in its own term {}",
                    self.id, args.leader_id, term
                );
                return Ok(AppendEntriesReply::rejected(term));
            }
            RoleState::Candidate { .. } => {
                info!(
                    "Replica {} found leader {} for term {}",
                    self.id, args.leader_id, term
                );
                self.role = RoleState::Follower;
            }
            RoleState::Follower => {}
        }

        // Reset election timeout since we heard from the leader
        self.leader_id = Some(args.leader_id);
        self.last_leader_contact = Some(now);
        self.pre_vote = None;
        self.reset_election_timer(now);

        // Check if log contains an entry at prevLogIndex with prevLogTerm
        if args.prev_log_index > self.log.last_index() {
            return Ok(AppendEntriesReply {
                conflict_index: Some(self.log.last_index() + 1),
                ..AppendEntriesReply::rejected(term)
            });
        }
        if !self.log.matches(args.prev_log_index, args.prev_log_term) {
            let conflict_term = self.log.term_at(args.prev_log_index).unwrap_or(0);
            return Ok(AppendEntriesReply {
                conflict_term: Some(conflict_term),
                conflict_index: Some(
                    self.log
                        .first_index_of_term(conflict_term, args.prev_log_index),
                ),
                ..AppendEntriesReply::rejected(term)
            });
        }

        for (offset, entry) in args.entries.iter().enumerate() {
            if entry.index != args.prev_log_index + 1 + offset as u64 {
                debug!(
                    "Replica {} got non-contiguous entry {} from {}",
                    self.id, entry.index, args.leader_id
                );
                return Ok(AppendEntriesReply::rejected(term));
            }
        }

        // Skip what we already hold; truncate at the first conflict and
        // append the rest. A duplicate request changes nothing.
        let fresh = args
            .entries
            .iter()
            .position(|entry| !self.log.matches(entry.index, entry.term));
        if let Some(first_new) = fresh {
            let start = args.entries[first_new].index;
            if start <= self.log.last_index() {
                self.truncate_durably(start)?;
            }
            self.append_durably(args.entries[first_new..].to_vec())?;
        }

        // Update commit index
        let last_new_index = args.last_index();
        if args.leader_commit > self.commit_index {
            let target = args.leader_commit.min(last_new_index);
            if target > self.commit_index {
                debug!(
                    "Replica {} advancing commit index {} -> {}",
                    self.id, self.commit_index, target
                );
                self.commit_index = target;
            }
        }

        Ok(AppendEntriesReply::accepted(term))
    }

    /// Folds a follower's reply into leader progress. `args` is the request
    /// it answers and `sent_at` when that request left.
    pub fn handle_append_reply(
        &mut self,
        from: ReplicaId,
        args: &AppendEntriesArgs,
        reply: AppendEntriesReply,
        sent_at: Instant,
    ) -> Result<Outbox, RaftError> {
        if self.observe_term(reply.term)? == TermCheck::Stale {
            return Ok(Outbox::default());
        }

        // Only process if we're still the leader of the term we sent in
        if self.hard_state.current_term != args.term {
            return Ok(Outbox::default());
        }
        let last_index = self.log.last_index();
        let leader = match &mut self.role {
            RoleState::Leader(leader) if from < leader.next_index.len() => leader,
            _ => return Ok(Outbox::default()),
        };

        let mut outbox = Outbox::default();
        if reply.success {
            let acked = args.last_index();
            if acked > leader.match_index[from] {
                leader.match_index[from] = acked;
            }
            leader.next_index[from] = leader.match_index[from] + 1;
            if leader.last_ack[from].map_or(true, |seen| sent_at > seen) {
                leader.last_ack[from] = Some(sent_at);
            }

            // Keep a lagging follower streaming instead of waiting a tick.
            let lagging = leader.next_index[from] <= last_index && !args.entries.is_empty();
            self.advance_commit_index();
            if lagging {
                outbox.appends.extend(self.build_append(from).map(|a| (from, a)));
            }
        } else {
            // Jump past the follower's conflicting term when we can, else
            // fall back to where the follower says its log ends.
            let hint = match reply.conflict_term {
                Some(conflict_term) => self
                    .log
                    .last_index_of_term(conflict_term)
                    .map(|i| i + 1)
                    .or(reply.conflict_index),
                None => reply.conflict_index,
            };
            let target = hint
                .unwrap_or(args.prev_log_index)
                .min(args.prev_log_index)
                .max(leader.match_index[from] + 1);

            if target < leader.next_index[from] {
                debug!(
                    "Replica {} backing next index for {} from {} to {}",
                    self.id, from, leader.next_index[from], target
                );
                leader.next_index[from] = target;
                outbox.appends.extend(self.build_append(from).map(|a| (from, a)));
            }
        }

        Ok(outbox)
    }

    /// Commits the highest index held by a majority, but only when that entry
    /// is from the current term. Older entries commit along with it.
    pub(crate) fn advance_commit_index(&mut self) -> bool {
        let leader = match &self.role {
            RoleState::Leader(leader) => leader,
            _ => return false,
        };

        let current_term = self.hard_state.current_term;
        let quorum = self.config.quorum();
        let mut candidate = self.log.last_index();
        while candidate > self.commit_index {
            match self.log.term_at(candidate) {
                Some(term) if term == current_term => {}
                // Terms only decrease walking backwards.
                _ => break,
            }
            let replicated = 1 + self
                .config
                .peers()
                .filter(|peer| leader.match_index[*peer] >= candidate)
                .count();
            if replicated >= quorum {
                debug!(
                    "Replica {} committing through index {} in term {}",
                    self.id, candidate, current_term
                );
                self.commit_index = candidate;
                return true;
            }
            candidate -= 1;
        }
        false
    }
}
