use tokio::time::Instant;
// Use external log crate, not our own log module
use ::log::{debug, info};

use super::node::{LeaderState, Outbox, PreVoteRound, RaftNode, RoleState, TermCheck};
use super::{HardState, RaftError, ReplicaId, RequestVoteArgs, RequestVoteReply};

impl RaftNode {
    /// Called by the driver whenever the election timer may have fired.
    pub fn on_election_timeout(&mut self, now: Instant) -> Result<Outbox, RaftError> {
        if self.is_leader() || now < self.election_deadline {
            return Ok(Outbox::default());
        }
        self.reset_election_timer(now);

        if self.config.pre_vote {
            self.start_pre_vote()
        } else {
            self.start_election(now)
        }
    }

    fn vote_request(&self, term: u64, pre_vote: bool) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            pre_vote,
        }
    }

    fn broadcast_votes(&self, request: RequestVoteArgs) -> Outbox {
        Outbox {
            votes: self
                .config
                .peers()
                .map(|peer| (peer, request.clone()))
                .collect(),
            appends: Vec::new(),
        }
    }

    fn start_pre_vote(&mut self) -> Result<Outbox, RaftError> {
        let term = self.hard_state.current_term + 1;
        let mut granted = vec![false; self.config.replicas];
        granted[self.id] = true;
        self.pre_vote = Some(PreVoteRound { term, granted });

        debug!("Replica {} starting pre-vote for term {}", self.id, term);
        if self.config.quorum() == 1 {
            return self.start_election(Instant::now());
        }
        Ok(self.broadcast_votes(self.vote_request(term, true)))
    }

    /// Becomes candidate for the next term and asks every peer for a vote.
    pub fn start_election(&mut self, now: Instant) -> Result<Outbox, RaftError> {
        let term = self.hard_state.current_term + 1;
        self.persist_hard_state(HardState {
            current_term: term,
            voted_for: Some(self.id),
        })?;

        let mut votes = vec![false; self.config.replicas];
        votes[self.id] = true;
        self.role = RoleState::Candidate { votes };
        self.leader_id = None;
        self.pre_vote = None;
        self.reset_election_timer(now);

        info!(
            "Replica {} starting election for term {} (last log {}@{})",
            self.id,
            term,
            self.log.last_index(),
            self.log.last_term()
        );

        // Check if we have already won the election (e.g. single node cluster)
        if self.config.quorum() == 1 {
            return Ok(self.become_leader());
        }
        Ok(self.broadcast_votes(self.vote_request(term, false)))
    }

    pub fn handle_request_vote(
        &mut self,
        args: &RequestVoteArgs,
        now: Instant,
    ) -> Result<RequestVoteReply, RaftError> {
        if args.pre_vote {
            return Ok(self.handle_pre_vote(args, now));
        }

        // A follower still hearing from its leader neither adopts the new
        // term nor votes, so a leader's read lease cannot overlap a successor.
        if args.term > self.hard_state.current_term && self.hears_from_leader(now) {
            debug!(
                "Replica {} ignoring vote for {} in term {}: leader {:?} is alive",
                self.id, args.candidate_id, args.term, self.leader_id
            );
            return Ok(RequestVoteReply {
                term: self.hard_state.current_term,
                vote_granted: false,
            });
        }

        if self.observe_term(args.term)? == TermCheck::Stale {
            debug!(
                "Replica {} rejecting vote for {} in stale term {}",
                self.id, args.candidate_id, args.term
            );
            return Ok(RequestVoteReply {
                term: self.hard_state.current_term,
                vote_granted: false,
            });
        }

        let can_vote = match self.hard_state.voted_for {
            None => true,
            Some(candidate) => candidate == args.candidate_id,
        };
        let vote_granted =
            can_vote && self.log.is_up_to_date(args.last_log_term, args.last_log_index);

        if vote_granted {
            // The vote must be durable before the reply leaves.
            self.persist_hard_state(HardState {
                current_term: self.hard_state.current_term,
                voted_for: Some(args.candidate_id),
            })?;
            self.reset_election_timer(now);
            debug!(
                "Replica {} granted vote to {} in term {}",
                self.id, args.candidate_id, args.term
            );
        }

        Ok(RequestVoteReply {
            term: self.hard_state.current_term,
            vote_granted,
        })
    }

    fn hears_from_leader(&self, now: Instant) -> bool {
        !self.is_leader()
            && self
                .last_leader_contact
                .is_some_and(|seen| now.saturating_duration_since(seen) < self.config.election_floor())
    }

    // Pre-vote check: do NOT change term, vote or timer.
    fn handle_pre_vote(&self, args: &RequestVoteArgs, now: Instant) -> RequestVoteReply {
        let leader_alive = self.is_leader() || self.hears_from_leader(now);

        let vote_granted = args.term > self.hard_state.current_term
            && !leader_alive
            && self.log.is_up_to_date(args.last_log_term, args.last_log_index);

        RequestVoteReply {
            term: self.hard_state.current_term,
            vote_granted,
        }
    }

    /// Processes a vote (or pre-vote) reply. `args` is the request it answers.
    pub fn handle_vote_reply(
        &mut self,
        from: ReplicaId,
        args: &RequestVoteArgs,
        reply: RequestVoteReply,
    ) -> Result<Outbox, RaftError> {
        if args.pre_vote {
            return self.handle_pre_vote_reply(from, args, reply);
        }

        if self.observe_term(reply.term)? == TermCheck::Stale {
            return Ok(Outbox::default());
        }

        // Only process if we're still a candidate in the term we asked for
        if self.hard_state.current_term != args.term || !reply.vote_granted {
            return Ok(Outbox::default());
        }
        let quorum = self.config.quorum();
        let won = match &mut self.role {
            RoleState::Candidate { votes } if from < votes.len() => {
                votes[from] = true;
                votes.iter().filter(|v| **v).count() >= quorum
            }
            _ => false,
        };

        if won {
            Ok(self.become_leader())
        } else {
            Ok(Outbox::default())
        }
    }

    fn handle_pre_vote_reply(
        &mut self,
        from: ReplicaId,
        args: &RequestVoteArgs,
        reply: RequestVoteReply,
    ) -> Result<Outbox, RaftError> {
        // A pre-vote reply only carries a real term when the peer is ahead.
        if reply.term > self.hard_state.current_term {
            self.step_down(reply.term)?;
            return Ok(Outbox::default());
        }

        let quorum = self.config.quorum();
        let ready = match &mut self.pre_vote {
            Some(round)
                if round.term == args.term
                    && round.term == self.hard_state.current_term + 1
                    && reply.vote_granted
                    && from < round.granted.len() =>
            {
                round.granted[from] = true;
                round.granted.iter().filter(|v| **v).count() >= quorum
            }
            _ => false,
        };

        if ready && !self.is_leader() {
            debug!("Replica {} won pre-vote for term {}", self.id, args.term);
            self.start_election(Instant::now())
        } else {
            Ok(Outbox::default())
        }
    }

    /// Takes leadership for the current term and returns the heartbeat that
    /// announces it.
    pub(crate) fn become_leader(&mut self) -> Outbox {
        info!(
            "Replica {} becoming leader for term {}",
            self.id, self.hard_state.current_term
        );

        self.role = RoleState::Leader(LeaderState::new(
            self.config.replicas,
            self.log.last_index(),
        ));
        self.leader_id = Some(self.id);
        self.pre_vote = None;

        // An entry left over from earlier terms may now be committable
        // in a single-replica cluster.
        self.advance_commit_index();

        Outbox {
            votes: Vec::new(),
            appends: self.replication_batch(),
        }
    }
}
