/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Standard protocol: a quorum write without byzantine voting.
//!
//! The primary sends the data block as COMMITTED to the `min_peer_num` peers nearest to it. Each of
//! them stores the block and sends a REPLY back. Once the primary holds `min_peer_num + 1`
//! confirmations, its own included, it stores the block, forgets the transaction and notifies the
//! block's origin.
//!
//! Attachments, and writes for which no peer is configured or found, are stored on the primary alone.
//!
//! The primary forgets a transaction once it has tried to finalize it, whether or not the store
//! accepted the block. A replica stores and confirms each write at most once.

use std::{sync::Arc, time::SystemTime};

use crate::{
    cache::{CacheKey, CacheRecord, CorrelationCache, Guard},
    engine::{quorum, ConsensusEngine},
    errors::{Authority, ConsensusError},
    events::{
        CollectQuorumEvent, ConfirmedEvent, Event, FinalizeEvent, PreprepareEvent, ReceiveConsensusEvent,
        ReceiveVoteEvent, ReplyEvent,
    },
    networking::{
        messages::{ChainMessage, MessageType, Payload, PayloadType, ProtocolKind, Step},
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

pub struct StandardProtocol<S: DataStore, P: PeerService, N: Transport> {
    engine: Arc<ConsensusEngine<S, P>>,
    action: Arc<ConsensusAction<N>>,
    cache: CorrelationCache,
    min_peer_num: usize,
}

impl<S: DataStore, P: PeerService, N: Transport> StandardProtocol<S, P, N> {
    pub fn new(
        engine: Arc<ConsensusEngine<S, P>>,
        action: Arc<ConsensusAction<N>>,
        cache: CorrelationCache,
        min_peer_num: usize,
    ) -> Self {
        Self {
            engine,
            action,
            cache,
            min_peer_num,
        }
    }

    fn publish(&self, event: Event) {
        self.engine.event_publisher().publish(event)
    }

    fn finalize(&self, block: &DataBlock, transaction: Transaction) -> Result<(), ConsensusError> {
        self.engine.finalize_block(block)?;
        self.publish(Event::Finalize(FinalizeEvent {
            timestamp: SystemTime::now(),
            protocol: ProtocolKind::Standard,
            transaction,
            tombstone: block.is_tombstone(),
        }));
        Ok(())
    }

    /// Persist the local peer's REPLY for `block` and queue it for `recipient`.
    fn reply(&self, block: &DataBlock, me: &Peer, recipient: &PeerId, route: Route) -> Result<(), ConsensusError> {
        let reply = self.engine.create_consensus_log(block, me, Phase::Reply)?;
        self.engine.persist_log(&reply)?;
        let transaction = reply.transaction();
        self.action.dispatch(
            self.action.envelope(
                &me.peer_id,
                recipient,
                MessageType::new(ProtocolKind::Standard, Step::Reply),
                reply,
            ),
            route,
        );
        self.publish(Event::Reply(ReplyEvent {
            timestamp: SystemTime::now(),
            protocol: ProtocolKind::Standard,
            transaction,
            recipient: recipient.clone(),
        }));
        Ok(())
    }

    fn accept_reply(&self, message: &ChainMessage, log: &ConsensusLog) -> Result<bool, ConsensusError> {
        self.engine.verify_vote(log)?;
        if !self.engine.record_vote(&self.cache, ProtocolKind::Standard, log)? {
            return Ok(false);
        }
        self.engine.persist_log(log)?;
        self.publish(Event::ReceiveVote(ReceiveVoteEvent {
            timestamp: SystemTime::now(),
            protocol: ProtocolKind::Standard,
            origin: message.src_peer_id.clone(),
            vote: log.clone(),
        }));
        Ok(true)
    }

    /// Count a replica's confirmation and finish the write on reaching the quorum.
    fn receive_replica_reply(&self, message: &ChainMessage, log: ConsensusLog, me: Peer) -> Result<(), ConsensusError> {
        let transaction = log.transaction();
        let key = self
            .engine
            .get_data_block_cache_key(&transaction.block_id, transaction.slice_number);
        let is_pending = |record: &CacheRecord| match record {
            CacheRecord::DataBlock(block) => block.transaction().as_ref() == Some(&transaction),
            _ => false,
        };

        let Some(pending) = self
            .cache
            .get(&key)
            .filter(|record| is_pending(record))
            .and_then(CacheRecord::into_data_block)
        else {
            log::debug!("late reply from {} on {}", log.peer_id, transaction);
            return Ok(());
        };
        if !pending.peer_ids.contains(&log.peer_id) {
            return Err(ConsensusError::AuthorityViolation(Authority::NotReplica));
        }
        if !self.accept_reply(message, &log)? {
            return Ok(());
        }

        let replicas = pending.peer_ids.len();
        let votes = self.engine.count_votes(
            &self.cache,
            &transaction,
            &pending.peer_ids,
            &me.peer_id,
            Phase::Reply,
            &pending.payload_hash,
        );
        if votes < quorum::write_quorum(self.min_peer_num, replicas) {
            return Ok(());
        }
        // Taking the pending block is the one-shot transition.
        let Some(block) = self.cache.delete_if(&key, is_pending).and_then(CacheRecord::into_data_block) else {
            return Ok(());
        };

        self.publish(Event::CollectQuorum(CollectQuorumEvent {
            timestamp: SystemTime::now(),
            protocol: ProtocolKind::Standard,
            transaction: transaction.clone(),
            phase: Phase::Reply,
            votes,
            replicas,
        }));
        let finalized = self.finalize(&block, transaction.clone());
        self.cache.delete_transaction(&transaction);
        finalized?;

        if block.peer_id != me.peer_id {
            self.reply(&block, &me, &block.peer_id, Route::Routed)?;
        }
        Ok(())
    }

    /// Accept the primary's notification that a write finished.
    fn receive_outcome(&self, message: &ChainMessage, log: ConsensusLog) -> Result<(), ConsensusError> {
        if !log.is_primary_vote() {
            return Err(ConsensusError::AuthorityViolation(Authority::NotPrimaryPeer));
        }
        if self.accept_reply(message, &log)? {
            self.try_confirm(&log.transaction());
        }
        Ok(())
    }

    /// Confirm the local peer's submission in `transaction` once its primary reported the write of the
    /// block it stamped.
    fn try_confirm(&self, transaction: &Transaction) {
        let Some(submission) = self.engine.submission(&self.cache, transaction) else {
            return;
        };
        let reported = self.engine.has_matching_vote(
            &self.cache,
            transaction,
            &transaction.primary_peer_id,
            Phase::Reply,
            &submission.payload_hash,
        );
        if reported && self.cache.claim(CacheKey::guard(transaction.clone(), Guard::Confirmed)) {
            self.publish(Event::Confirmed(ConfirmedEvent {
                timestamp: SystemTime::now(),
                protocol: ProtocolKind::Standard,
                transaction: transaction.clone(),
                replies: 1,
            }));
        }
    }
}

impl<S: DataStore, P: PeerService, N: Transport> ConsensusProtocol for StandardProtocol<S, P, N> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Standard
    }

    fn cache(&self) -> &CorrelationCache {
        &self.cache
    }

    fn expected_payload(&self, step: Step) -> PayloadType {
        match step {
            Step::Consensus | Step::Preprepared | Step::Commited => PayloadType::DataBlock,
            Step::Prepared | Step::Reply => PayloadType::ConsensusLog,
        }
    }

    fn submitted(&self, primary: &PeerId, stamped: &DataBlock) -> Result<(), ConsensusError> {
        let transaction = self.engine.check_submission(primary, stamped)?;
        self.engine.bind_submission(&self.cache, &transaction, stamped);
        self.try_confirm(&transaction);
        Ok(())
    }

    /// Accept a data block from a client as its primary and write it to the nearest peers.
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
            protocol: ProtocolKind::Standard,
            origin: message.src_peer_id.clone(),
            block_id: block.block_id.clone(),
            slice_number: block.slice_number,
        }));

        block.primary_peer_id = Some(me.peer_id.clone());
        block.primary_sequence_id = self.engine.next_sequence_id();
        let transaction = Transaction {
            primary_peer_id: me.peer_id.clone(),
            block_id: block.block_id.clone(),
            slice_number: block.slice_number,
            primary_sequence_id: block.primary_sequence_id,
        };

        let replicas = if block.is_attachment() || self.min_peer_num == 0 {
            Vec::new()
        } else {
            self.engine.choose_nearest_peers(&block, self.min_peer_num)?
        };
        if replicas.is_empty() {
            block.peer_ids = vec![me.peer_id.clone()];
            self.finalize(&block, transaction)?;
            return Ok(Some(Payload::DataBlock(block)));
        }

        block.peer_ids = replicas;
        self.cache.set(
            self.engine.get_data_block_cache_key(&block.block_id, block.slice_number),
            CacheRecord::DataBlock(block.clone()),
        );
        let recipients = self.action.fan_out(
            &me.peer_id,
            &block.peer_ids,
            MessageType::new(ProtocolKind::Standard, Step::Commited),
            block.clone(),
            Route::Direct,
        );
        self.publish(Event::Preprepare(PreprepareEvent {
            timestamp: SystemTime::now(),
            protocol: ProtocolKind::Standard,
            transaction,
            recipients,
        }));
        Ok(Some(Payload::DataBlock(block)))
    }

    /// Store a block written by a primary and confirm it.
    fn receive_commited(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        let me = self.engine.myself()?;
        let block = self.engine.get_data_block(message)?;
        let Some(primary) = block.primary_peer_id.clone() else {
            return Err(ConsensusError::AuthorityViolation(Authority::SendCommitedMustPrimaryPeer));
        };
        if message.src_peer_id != primary {
            return Err(ConsensusError::AuthorityViolation(Authority::SendCommitedMustPrimaryPeer));
        }
        if primary == me.peer_id {
            return Err(ConsensusError::AuthorityViolation(Authority::SendMyselfMessage));
        }
        self.engine.verify_data_block(&block)?;
        let transaction = block
            .transaction()
            .ok_or(ConsensusError::AuthorityViolation(Authority::SendCommitedMustPrimaryPeer))?;

        let guard = CacheKey::guard(transaction.clone(), Guard::Finalized);
        if !self.cache.claim(guard.clone()) {
            log::debug!("duplicate write of {}", transaction);
            return Ok(None);
        }
        if let Err(error) = self.engine.finalize_block(&block) {
            self.cache.delete(&guard);
            return Err(error);
        }
        self.reply(&block, &me, &primary, Route::Direct)?;
        Ok(None)
    }

    fn receive_reply(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        let me = self.engine.myself()?;
        let log = self.engine.get_consensus_log(message)?;
        if log.status != Phase::Reply {
            return Err(ConsensusError::DecodeError(format!(
                "{} carries a {} vote",
                message.message_type, log.status
            )));
        }
        if log.peer_id == me.peer_id {
            return Err(ConsensusError::AuthorityViolation(Authority::SendMyselfMessage));
        }

        if log.primary_peer_id == me.peer_id {
            self.receive_replica_reply(message, log, me)?;
        } else {
            if log.client_peer_id != me.peer_id {
                return Err(ConsensusError::AuthorityViolation(Authority::NotClientPeer));
            }
            self.receive_outcome(message, log)?;
        }
        Ok(None)
    }
}
