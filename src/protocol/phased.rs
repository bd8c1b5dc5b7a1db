/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The PRE-PREPARED -> PREPARED -> COMMITTED -> REPLY state machine shared by the
//! [PBFT-style](super::pbft) and [Raft-style](super::raft) protocols.
//!
//! ## Transactions
//!
//! The primary that accepts a data block stamps itself and a fresh sequence id on it, which makes the
//! block part of a [`Transaction`]. Everything below is keyed by transaction, so two submissions of the
//! same block never share votes.
//!
//! ## Readiness and counting
//!
//! A peer is *ready* for a transaction once it holds its own first vote: PRE-PREPARED for the primary,
//! PREPARED for any other replica. Votes of other peers may arrive before that, in which case they are
//! cached and counted when the peer becomes ready. Counting always uses the replica set and payload
//! hash of the local peer's own vote, never those of the vote just received. The local peer counts as
//! one vote, and in the PREPARED phase the primary's PRE-PREPARED stands for its prepare vote.
//!
//! ## Exactly once
//!
//! Broadcasting COMMITTED, finalizing the block and confirming the outcome each happen at most once per
//! transaction on a peer, guarded by a [`Guard`] key claimed in the correlation cache.
//!
//! ## Confirmation
//!
//! A client only confirms transactions it submitted. The block its primary stamped is bound in the
//! cache, and replies are counted against that block's replica set and payload hash. Replies that
//! arrive before the binding are cached and counted when it happens.

use std::{sync::Arc, time::SystemTime};

use crate::{
    cache::{CacheKey, CacheRecord, CorrelationCache, Guard},
    engine::{quorum, ConsensusEngine, MIN_CONSENSUS_PEERS},
    errors::{Authority, ConsensusError},
    events::{
        CollectQuorumEvent, ConfirmedEvent, Event, FinalizeEvent, PreprepareEvent, ReceiveConsensusEvent,
        ReceiveVoteEvent, ReplyEvent, VoteEvent,
    },
    networking::{
        messages::{ChainMessage, MessageType, Payload, ProtocolKind, Step},
        network::Transport,
        sending::{ConsensusAction, Route},
    },
    pluggables::{DataStore, PeerService},
    types::{
        consensus_log::{ConsensusLog, Phase, Transaction},
        data_block::DataBlock,
        data_types::PeerId,
        peer::Peer,
    },
};

use super::ConsensusProtocol;

/// How COMMITTED votes are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitRule {
    /// Every replica counts COMMITTED votes and finalizes on a quorum, then replies to the client.
    Quorum,
    /// Replicas finalize on the leader's COMMITTED and reply to the leader.
    FromLeader,
}

/// How REPLY votes are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyRule {
    /// Only the client receives replies, and confirms after `f + 1` matching ones.
    ClientConfirmation,
    /// The leader counts replies, finalizes on a quorum and replies to the client, which confirms on
    /// the leader's reply.
    LeaderQuorum,
}

/// Who talks to whom in a [`PhasedProtocol`].
pub trait Topology: Send + Sync + 'static {
    fn kind(&self) -> ProtocolKind;

    /// The peers a replica sends its PREPARED vote to.
    fn prepared_recipients(&self, replicas: &[PeerId], primary: &PeerId, me: &PeerId) -> Vec<PeerId>;

    /// Whether `me` collects PREPARED votes of the transaction proposed by `primary`.
    fn collects_prepared(&self, primary: &PeerId, me: &PeerId) -> bool;

    fn commit_rule(&self) -> CommitRule;

    fn reply_rule(&self) -> ReplyRule;
}

pub struct PhasedProtocol<S: DataStore, P: PeerService, N: Transport, T: Topology> {
    topology: T,
    engine: Arc<ConsensusEngine<S, P>>,
    action: Arc<ConsensusAction<N>>,
    cache: CorrelationCache,
    replica_count: usize,
}

impl<S: DataStore, P: PeerService, N: Transport, T: Topology> PhasedProtocol<S, P, N, T> {
    pub fn new(
        topology: T,
        engine: Arc<ConsensusEngine<S, P>>,
        action: Arc<ConsensusAction<N>>,
        cache: CorrelationCache,
        replica_count: usize,
    ) -> Self {
        Self {
            topology,
            engine,
            action,
            cache,
            replica_count: replica_count.max(MIN_CONSENSUS_PEERS),
        }
    }

    fn message_type(&self, step: Step) -> MessageType {
        MessageType::new(self.topology.kind(), step)
    }

    fn publish(&self, event: Event) {
        self.engine.event_publisher().publish(event)
    }

    /// Check that `log` is a vote at `phase`.
    fn expect_phase(&self, message: &ChainMessage, log: &ConsensusLog, phase: Phase) -> Result<(), ConsensusError> {
        if log.status != phase {
            return Err(ConsensusError::DecodeError(format!(
                "{} carries a {} vote",
                message.message_type, log.status
            )));
        }
        Ok(())
    }

    /// Verify and record a vote received from another peer. Returns `false` for a duplicate.
    fn accept_vote(&self, message: &ChainMessage, log: &ConsensusLog) -> Result<bool, ConsensusError> {
        self.engine.verify_vote(log)?;
        if !self.engine.record_vote(&self.cache, self.topology.kind(), log)? {
            log::debug!("duplicate {} vote from {} on {}", log.status, log.peer_id, log.transaction());
            return Ok(false);
        }
        self.engine.persist_log(log)?;
        self.publish(Event::ReceiveVote(ReceiveVoteEvent {
            timestamp: SystemTime::now(),
            protocol: self.topology.kind(),
            origin: message.src_peer_id.clone(),
            vote: log.clone(),
        }));
        Ok(true)
    }

    /// Record and persist a vote cast by the local peer.
    fn cast_vote(&self, log: &ConsensusLog) -> Result<(), ConsensusError> {
        self.engine.record_vote(&self.cache, self.topology.kind(), log)?;
        self.engine.persist_log(log)?;
        self.publish(Event::Vote(VoteEvent {
            timestamp: SystemTime::now(),
            protocol: self.topology.kind(),
            vote: log.clone(),
        }));
        Ok(())
    }

    /// The local peer's first vote for `transaction`, if it is ready.
    fn own_readiness(&self, transaction: &Transaction, me: &PeerId) -> Option<ConsensusLog> {
        let phase = if &transaction.primary_peer_id == me {
            Phase::PrePrepared
        } else {
            Phase::Prepared
        };
        self.engine.cached_vote(&self.cache, transaction, me, phase)
    }

    fn cached_block(&self, transaction: &Transaction) -> Option<DataBlock> {
        self.cache
            .get(&self.engine.get_data_block_cache_key(&transaction.block_id, transaction.slice_number))
            .and_then(CacheRecord::into_data_block)
            .filter(|block| block.transaction().as_ref() == Some(transaction))
    }

    fn prepared_votes(&self, transaction: &Transaction, own: &ConsensusLog, me: &PeerId) -> usize {
        let primary = &transaction.primary_peer_id;
        let mut votes = self.engine.count_votes(
            &self.cache,
            transaction,
            &own.peer_ids,
            me,
            Phase::Prepared,
            &own.payload_hash,
        );
        if primary != me
            && self
                .engine
                .has_matching_vote(&self.cache, transaction, primary, Phase::PrePrepared, &own.payload_hash)
        {
            votes += 1;
        }
        votes
    }

    /// Broadcast COMMITTED once the local peer is ready and has seen a PREPARED quorum.
    fn try_commit(&self, transaction: &Transaction, me: &Peer) -> Result<(), ConsensusError> {
        if !self.topology.collects_prepared(&transaction.primary_peer_id, &me.peer_id) {
            return Ok(());
        }
        let Some(own) = self.own_readiness(transaction, &me.peer_id) else {
            return Ok(());
        };

        let replicas = own.peer_ids.len();
        let votes = self.prepared_votes(transaction, &own, &me.peer_id);
        if !quorum::is_quorum(votes, replicas) {
            return Ok(());
        }
        if !self.cache.claim(CacheKey::guard(transaction.clone(), Guard::CommitBroadcast)) {
            return Ok(());
        }

        self.publish(Event::CollectQuorum(CollectQuorumEvent {
            timestamp: SystemTime::now(),
            protocol: self.topology.kind(),
            transaction: transaction.clone(),
            phase: Phase::Prepared,
            votes,
            replicas,
        }));

        let commit = self.engine.derive_consensus_log(&own, me, Phase::Committed);
        self.cast_vote(&commit)?;
        self.action.fan_out(
            &me.peer_id,
            &own.peer_ids,
            self.message_type(Step::Commited),
            commit,
            Route::Direct,
        );

        if self.topology.commit_rule() == CommitRule::Quorum {
            self.try_finalize(transaction, me)?;
        }
        Ok(())
    }

    /// Finalize once the local peer has committed and has seen a COMMITTED quorum.
    fn try_finalize(&self, transaction: &Transaction, me: &Peer) -> Result<(), ConsensusError> {
        let Some(own) = self
            .engine
            .cached_vote(&self.cache, transaction, &me.peer_id, Phase::Committed)
        else {
            return Ok(());
        };

        let replicas = own.peer_ids.len();
        let votes = self.engine.count_votes(
            &self.cache,
            transaction,
            &own.peer_ids,
            &me.peer_id,
            Phase::Committed,
            &own.payload_hash,
        );
        if !quorum::is_quorum(votes, replicas) {
            return Ok(());
        }
        if !self.cache.claim(CacheKey::guard(transaction.clone(), Guard::Finalized)) {
            return Ok(());
        }

        self.publish(Event::CollectQuorum(CollectQuorumEvent {
            timestamp: SystemTime::now(),
            protocol: self.topology.kind(),
            transaction: transaction.clone(),
            phase: Phase::Committed,
            votes,
            replicas,
        }));
        self.finalize(transaction, &own)?;
        self.reply(&own, me, &own.client_peer_id, Route::Routed)
    }

    /// Finalize on the leader's COMMITTED once the local peer is ready, and reply to the leader.
    fn try_follow_leader(&self, transaction: &Transaction, me: &Peer) -> Result<(), ConsensusError> {
        let Some(own) = self
            .engine
            .cached_vote(&self.cache, transaction, &me.peer_id, Phase::Prepared)
        else {
            return Ok(());
        };
        if !self.engine.has_matching_vote(
            &self.cache,
            transaction,
            &transaction.primary_peer_id,
            Phase::Committed,
            &own.payload_hash,
        ) {
            return Ok(());
        }
        if !self.cache.claim(CacheKey::guard(transaction.clone(), Guard::Finalized)) {
            return Ok(());
        }

        self.finalize(transaction, &own)?;
        self.reply(&own, me, &transaction.primary_peer_id, Route::Direct)
    }

    /// Apply the outcome of `transaction` to the durable store.
    fn finalize(&self, transaction: &Transaction, own: &ConsensusLog) -> Result<(), ConsensusError> {
        let block = match self.cached_block(transaction) {
            Some(block) => block,
            None => self
                .engine
                .store()
                .find(&transaction.block_id, transaction.slice_number)?
                .filter(|block| block.payload_hash == own.payload_hash)
                .ok_or_else(|| ConsensusError::UnknownTransaction(transaction.clone()))?,
        };

        self.engine.finalize_block(&block)?;
        self.publish(Event::Finalize(FinalizeEvent {
            timestamp: SystemTime::now(),
            protocol: self.topology.kind(),
            transaction: transaction.clone(),
            tombstone: block.is_tombstone(),
        }));
        Ok(())
    }

    /// Cast the local peer's REPLY vote and send it to `recipient`, unless that is the local peer.
    fn reply(&self, own: &ConsensusLog, me: &Peer, recipient: &PeerId, route: Route) -> Result<(), ConsensusError> {
        if recipient == &me.peer_id {
            return Ok(());
        }
        let reply = self.engine.derive_consensus_log(own, me, Phase::Reply);
        self.cast_vote(&reply)?;
        let transaction = reply.transaction();
        self.action.dispatch(
            self.action
                .envelope(&me.peer_id, recipient, self.message_type(Step::Reply), reply),
            route,
        );
        self.publish(Event::Reply(ReplyEvent {
            timestamp: SystemTime::now(),
            protocol: self.topology.kind(),
            transaction,
            recipient: recipient.clone(),
        }));
        Ok(())
    }

    /// Confirm the local peer's submission in `transaction` once the replies agree with the block its
    /// primary stamped.
    fn try_confirm(&self, transaction: &Transaction) {
        let Some(submission) = self.engine.submission(&self.cache, transaction) else {
            return;
        };
        let agrees = |peer_id: &PeerId| {
            self.engine
                .has_matching_vote(&self.cache, transaction, peer_id, Phase::Reply, &submission.payload_hash)
        };
        match self.topology.reply_rule() {
            ReplyRule::ClientConfirmation => {
                let replies = submission.peer_ids.iter().filter(|peer_id| agrees(peer_id)).count();
                if replies >= quorum::client_confirmation_threshold(submission.peer_ids.len()) {
                    self.confirm(transaction, replies);
                }
            }
            ReplyRule::LeaderQuorum => {
                if agrees(&transaction.primary_peer_id) {
                    self.confirm(transaction, 1);
                }
            }
        }
    }

    fn confirm(&self, transaction: &Transaction, replies: usize) {
        if self.cache.claim(CacheKey::guard(transaction.clone(), Guard::Confirmed)) {
            self.publish(Event::Confirmed(ConfirmedEvent {
                timestamp: SystemTime::now(),
                protocol: self.topology.kind(),
                transaction: transaction.clone(),
                replies,
            }));
        }
    }

    /* ↓↓↓ Per-rule handlers ↓↓↓ */

    fn receive_commit_quorum(&self, message: &ChainMessage, log: ConsensusLog, me: Peer) -> Result<(), ConsensusError> {
        if !log.peer_ids.contains(&log.peer_id) {
            return Err(ConsensusError::AuthorityViolation(Authority::NotReplica));
        }
        if !self.accept_vote(message, &log)? {
            return Ok(());
        }
        self.try_finalize(&log.transaction(), &me)
    }

    fn receive_commit_from_leader(
        &self,
        message: &ChainMessage,
        log: ConsensusLog,
        me: Peer,
    ) -> Result<(), ConsensusError> {
        if !log.is_primary_vote() || message.src_peer_id != log.primary_peer_id {
            return Err(ConsensusError::AuthorityViolation(Authority::SendCommitedMustPrimaryPeer));
        }
        if !self.accept_vote(message, &log)? {
            return Ok(());
        }
        self.try_follow_leader(&log.transaction(), &me)
    }

    fn receive_client_reply(&self, message: &ChainMessage, log: ConsensusLog) -> Result<(), ConsensusError> {
        let transaction = log.transaction();
        let is_replica = match self.engine.submission(&self.cache, &transaction) {
            Some(submission) => submission.peer_ids.contains(&log.peer_id),
            None => log.peer_ids.contains(&log.peer_id),
        };
        if !is_replica {
            return Err(ConsensusError::AuthorityViolation(Authority::NotReplica));
        }
        if self.accept_vote(message, &log)? {
            self.try_confirm(&transaction);
        }
        Ok(())
    }

    fn receive_leader_reply(&self, message: &ChainMessage, log: ConsensusLog, me: Peer) -> Result<(), ConsensusError> {
        let transaction = log.transaction();
        let Some(own) = self
            .engine
            .cached_vote(&self.cache, &transaction, &me.peer_id, Phase::Committed)
        else {
            return Err(ConsensusError::UnknownTransaction(transaction));
        };
        if !own.peer_ids.contains(&log.peer_id) {
            return Err(ConsensusError::AuthorityViolation(Authority::NotReplica));
        }
        if !self.accept_vote(message, &log)? {
            return Ok(());
        }

        let replicas = own.peer_ids.len();
        let votes = self.engine.count_votes(
            &self.cache,
            &transaction,
            &own.peer_ids,
            &me.peer_id,
            Phase::Reply,
            &own.payload_hash,
        );
        if !quorum::is_quorum(votes, replicas) {
            return Ok(());
        }
        if !self.cache.claim(CacheKey::guard(transaction.clone(), Guard::Finalized)) {
            return Ok(());
        }

        self.publish(Event::CollectQuorum(CollectQuorumEvent {
            timestamp: SystemTime::now(),
            protocol: self.topology.kind(),
            transaction: transaction.clone(),
            phase: Phase::Reply,
            votes,
            replicas,
        }));
        self.finalize(&transaction, &own)?;
        self.reply(&own, &me, &own.client_peer_id, Route::Routed)
    }

    fn receive_leader_outcome(&self, message: &ChainMessage, log: ConsensusLog) -> Result<(), ConsensusError> {
        if !log.is_primary_vote() {
            return Err(ConsensusError::AuthorityViolation(Authority::NotPrimaryPeer));
        }
        if self.accept_vote(message, &log)? {
            self.try_confirm(&log.transaction());
        }
        Ok(())
    }
}

impl<S: DataStore, P: PeerService, N: Transport, T: Topology> ConsensusProtocol for PhasedProtocol<S, P, N, T> {
    fn kind(&self) -> ProtocolKind {
        self.topology.kind()
    }

    fn cache(&self) -> &CorrelationCache {
        &self.cache
    }

    /// Accept a data block from a client as its primary and propose it to a replica set.
    fn receive_consensus(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        let me = self.engine.myself()?;
        let mut block = self.engine.get_data_block(message)?;
        self.engine.verify_data_block(&block)?;
        if let Some(primary) = &block.primary_peer_id {
            if primary != &me.peer_id {
                return Err(ConsensusError::AuthorityViolation(Authority::MustPrimaryPeer));
            }
        }
        self.engine.store().validate(&block)?;

        self.publish(Event::ReceiveConsensus(ReceiveConsensusEvent {
            timestamp: SystemTime::now(),
            protocol: self.topology.kind(),
            origin: message.src_peer_id.clone(),
            block_id: block.block_id.clone(),
            slice_number: block.slice_number,
        }));

        block.primary_peer_id = Some(me.peer_id.clone());
        block.primary_sequence_id = self.engine.next_sequence_id();
        let replicas = self.engine.choose_consensus_peer(&block, self.replica_count)?;
        if replicas.is_empty() {
            return Err(ConsensusError::InsufficientReplicas {
                block_id: block.block_id,
                slice_number: block.slice_number,
                required: MIN_CONSENSUS_PEERS,
                available: self.engine.candidates().len(),
            });
        }
        block.peer_ids = replicas;

        let own = self.engine.create_consensus_log(&block, &me, Phase::PrePrepared)?;
        self.cast_vote(&own)?;
        self.cache.set(
            self.engine.get_data_block_cache_key(&block.block_id, block.slice_number),
            CacheRecord::DataBlock(block.clone()),
        );

        let recipients = self.action.fan_out(
            &me.peer_id,
            &block.peer_ids,
            self.message_type(Step::Preprepared),
            block.clone(),
            Route::Direct,
        );
        self.publish(Event::Preprepare(PreprepareEvent {
            timestamp: SystemTime::now(),
            protocol: self.topology.kind(),
            transaction: own.transaction(),
            recipients,
        }));
        Ok(Some(Payload::DataBlock(block)))
    }

    fn submitted(&self, primary: &PeerId, stamped: &DataBlock) -> Result<(), ConsensusError> {
        let transaction = self.engine.check_submission(primary, stamped)?;
        self.engine.check_replica_set(stamped)?;
        self.engine.bind_submission(&self.cache, &transaction, stamped);
        self.try_confirm(&transaction);
        Ok(())
    }

    /// Accept the primary's proposal as a replica and vote PREPARED on it.
    fn receive_preprepared(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        let me = self.engine.myself()?;
        let block = self.engine.get_data_block(message)?;
        let Some(primary) = block.primary_peer_id.clone() else {
            return Err(ConsensusError::AuthorityViolation(Authority::SendPrepreparedMustPrimaryPeer));
        };
        if message.src_peer_id != primary {
            return Err(ConsensusError::AuthorityViolation(Authority::SendPrepreparedMustPrimaryPeer));
        }
        if primary == me.peer_id {
            return Err(ConsensusError::AuthorityViolation(Authority::PrepreparedInPrimaryPeer));
        }
        if !block.peer_ids.contains(&me.peer_id) {
            return Err(ConsensusError::AuthorityViolation(Authority::NotReplica));
        }
        self.engine.check_replica_set(&block)?;
        self.engine.verify_data_block(&block)?;

        let proposal = self.engine.primary_proposal_log(&block)?;
        if !self.engine.record_vote(&self.cache, self.topology.kind(), &proposal)? {
            log::debug!("duplicate proposal of {}", proposal.transaction());
            return Ok(None);
        }
        self.engine.persist_log(&proposal)?;
        self.engine.store_draft(&block)?;
        self.cache.set(
            self.engine.get_data_block_cache_key(&block.block_id, block.slice_number),
            CacheRecord::DataBlock(block.clone()),
        );

        let own = self.engine.create_consensus_log(&block, &me, Phase::Prepared)?;
        self.cast_vote(&own)?;
        let recipients = self
            .topology
            .prepared_recipients(&block.peer_ids, &primary, &me.peer_id);
        self.action.fan_out(
            &me.peer_id,
            &recipients,
            self.message_type(Step::Prepared),
            own.clone(),
            Route::Direct,
        );

        let transaction = own.transaction();
        match self.topology.commit_rule() {
            CommitRule::Quorum => self.try_commit(&transaction, &me)?,
            CommitRule::FromLeader => self.try_follow_leader(&transaction, &me)?,
        }
        Ok(None)
    }

    /// Count a PREPARED vote.
    fn receive_prepared(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        let me = self.engine.myself()?;
        let log = self.engine.get_consensus_log(message)?;
        self.expect_phase(message, &log, Phase::Prepared)?;
        if log.peer_id == me.peer_id {
            return Err(ConsensusError::AuthorityViolation(Authority::SendMyselfMessage));
        }
        if log.is_primary_vote() {
            return Err(ConsensusError::AuthorityViolation(Authority::SendPrimaryPreparedMessage));
        }
        if !self.topology.collects_prepared(&log.primary_peer_id, &me.peer_id) {
            return Err(ConsensusError::AuthorityViolation(Authority::NotPrimaryPeer));
        }
        if !log.peer_ids.contains(&log.peer_id) {
            return Err(ConsensusError::AuthorityViolation(Authority::NotReplica));
        }
        if !self.accept_vote(message, &log)? {
            return Ok(None);
        }

        self.try_commit(&log.transaction(), &me)?;
        Ok(None)
    }

    fn receive_commited(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        let me = self.engine.myself()?;
        let log = self.engine.get_consensus_log(message)?;
        self.expect_phase(message, &log, Phase::Committed)?;
        if log.peer_id == me.peer_id {
            return Err(ConsensusError::AuthorityViolation(Authority::SendMyselfMessage));
        }

        match self.topology.commit_rule() {
            CommitRule::Quorum => self.receive_commit_quorum(message, log, me)?,
            CommitRule::FromLeader => self.receive_commit_from_leader(message, log, me)?,
        }
        Ok(None)
    }

    fn receive_reply(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        let me = self.engine.myself()?;
        let log = self.engine.get_consensus_log(message)?;
        self.expect_phase(message, &log, Phase::Reply)?;
        if log.peer_id == me.peer_id {
            return Err(ConsensusError::AuthorityViolation(Authority::SendMyselfMessage));
        }

        match self.topology.reply_rule() {
            ReplyRule::ClientConfirmation => {
                if log.client_peer_id != me.peer_id {
                    return Err(ConsensusError::AuthorityViolation(Authority::NotClientPeer));
                }
                self.receive_client_reply(message, log)?
            }
            ReplyRule::LeaderQuorum if log.primary_peer_id == me.peer_id => {
                self.receive_leader_reply(message, log, me)?
            }
            ReplyRule::LeaderQuorum => {
                if log.client_peer_id != me.peer_id {
                    return Err(ConsensusError::AuthorityViolation(Authority::NotClientPeer));
                }
                self.receive_leader_outcome(message, log)?
            }
        }
        Ok(None)
    }
}
