/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus engine: the toolkit every [protocol](crate::protocol) is written against.
//!
//! The engine owns no per-transaction state. Votes, in-flight blocks and one-shot guards live in the
//! [`CorrelationCache`] of the protocol that calls in, which is passed to the methods that need it.
//! What the engine does own is the node's identity (its [`Keypair`] and the [`PeerService`]), the
//! durable [`DataStore`], the primary sequence counter, and the [`EventPublisher`].

pub mod quorum;

pub mod selection;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::SystemTime;

use crate::{
    cache::{CacheKey, CacheRecord, CorrelationCache, SetDefault},
    config::PeerSelection,
    errors::{Authority, ConsensusError},
    events::{EquivocationDetectedEvent, Event, EventPublisher},
    networking::messages::{ChainMessage, Payload, ProtocolKind},
    pluggables::{DataStore, PeerService},
    types::{
        consensus_log::{ConsensusLog, Phase, Transaction},
        crypto_primitives::Keypair,
        data_block::{BlockStatus, DataBlock},
        data_types::{BlockId, CryptoHash, PeerId, SequenceId, SignatureBytes, SliceNumber, Timestamp},
        peer::Peer,
    },
};

use self::selection::{rank, select_replicas, selection_seed};

/// Replica sets smaller than this cannot tolerate a single faulty peer.
pub const MIN_CONSENSUS_PEERS: usize = 3;

pub struct ConsensusEngine<S: DataStore, P: PeerService> {
    keypair: Keypair,
    store: Arc<S>,
    peers: Arc<P>,
    peer_selection: PeerSelection,
    event_publisher: Arc<EventPublisher>,
    last_sequence_id: AtomicU64,
}

impl<S: DataStore, P: PeerService> ConsensusEngine<S, P> {
    pub fn new(
        keypair: Keypair,
        store: Arc<S>,
        peers: Arc<P>,
        peer_selection: PeerSelection,
        event_publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            keypair,
            store,
            peers,
            peer_selection,
            event_publisher,
            last_sequence_id: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn peers(&self) -> &P {
        &self.peers
    }

    pub fn event_publisher(&self) -> &EventPublisher {
        &self.event_publisher
    }

    /// The local peer record.
    pub fn myself(&self) -> Result<Peer, ConsensusError> {
        self.peers.myself().ok_or(ConsensusError::IdentityUnavailable)
    }

    /// The next sequence id this peer stamps on a transaction it originates as primary. Starts at 1.
    pub fn next_sequence_id(&self) -> SequenceId {
        SequenceId::new(self.last_sequence_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /* ↓↓↓ Payload extraction ↓↓↓ */

    pub fn get_data_block(&self, message: &ChainMessage) -> Result<DataBlock, ConsensusError> {
        match &message.payload {
            Some(Payload::DataBlock(block)) => Ok(block.clone()),
            Some(Payload::ConsensusLog(_)) => Err(ConsensusError::DecodeError(format!(
                "{} carries a consensus log, expected a data block",
                message.message_type
            ))),
            None => Err(ConsensusError::DecodeError(format!(
                "{} carries no payload",
                message.message_type
            ))),
        }
    }

    pub fn get_consensus_log(&self, message: &ChainMessage) -> Result<ConsensusLog, ConsensusError> {
        match &message.payload {
            Some(Payload::ConsensusLog(log)) => Ok(log.clone()),
            Some(Payload::DataBlock(_)) => Err(ConsensusError::DecodeError(format!(
                "{} carries a data block, expected a consensus log",
                message.message_type
            ))),
            None => Err(ConsensusError::DecodeError(format!(
                "{} carries no payload",
                message.message_type
            ))),
        }
    }

    /* ↓↓↓ Vote construction ↓↓↓ */

    /// Create and sign the vote of `me` at `status` for the transaction `block` takes part in.
    ///
    /// The block must already carry a primary.
    pub fn create_consensus_log(
        &self,
        block: &DataBlock,
        me: &Peer,
        status: Phase,
    ) -> Result<ConsensusLog, ConsensusError> {
        let transaction = block.transaction().ok_or_else(|| {
            ConsensusError::DecodeError(format!(
                "block {}/{} has no primary",
                block.block_id, block.slice_number
            ))
        })?;
        let client_address = self
            .peers
            .find(&block.peer_id)
            .map(|client| client.address)
            .unwrap_or_default();

        let log = ConsensusLog {
            primary_peer_id: transaction.primary_peer_id,
            block_id: transaction.block_id,
            slice_number: transaction.slice_number,
            primary_sequence_id: transaction.primary_sequence_id,
            peer_id: me.peer_id.clone(),
            status,
            payload_hash: block.payload_hash,
            peer_ids: block.peer_ids.clone(),
            client_peer_id: block.peer_id.clone(),
            client_address,
            public_key: self.keypair.public().to_bytes(),
            create_timestamp: Timestamp::now(),
            signature: SignatureBytes::empty(),
        };
        Ok(self.sign(log))
    }

    /// Create and sign the vote of `me` at `status` for the same transaction, payload hash and replica
    /// set as `template`.
    pub fn derive_consensus_log(&self, template: &ConsensusLog, me: &Peer, status: Phase) -> ConsensusLog {
        let log = ConsensusLog {
            peer_id: me.peer_id.clone(),
            status,
            public_key: self.keypair.public().to_bytes(),
            create_timestamp: Timestamp::now(),
            signature: SignatureBytes::empty(),
            ..template.clone()
        };
        self.sign(log)
    }

    /// The unsigned stand-in vote of the primary at PRE-PREPARED, as a replica records it on receiving
    /// the primary's proposal. The proposal's authenticity is established by the sender check and the
    /// origin signature on the block, not by this record.
    pub fn primary_proposal_log(&self, block: &DataBlock) -> Result<ConsensusLog, ConsensusError> {
        let transaction = block
            .transaction()
            .ok_or(ConsensusError::AuthorityViolation(Authority::SendPrepreparedMustPrimaryPeer))?;
        let public_key = self
            .public_key_of(&transaction.primary_peer_id)
            .ok_or_else(|| ConsensusError::UnknownPeer(transaction.primary_peer_id.clone()))?;
        Ok(ConsensusLog {
            peer_id: transaction.primary_peer_id.clone(),
            primary_peer_id: transaction.primary_peer_id,
            block_id: transaction.block_id,
            slice_number: transaction.slice_number,
            primary_sequence_id: transaction.primary_sequence_id,
            status: Phase::PrePrepared,
            payload_hash: block.payload_hash,
            peer_ids: block.peer_ids.clone(),
            client_peer_id: block.peer_id.clone(),
            client_address: String::new(),
            public_key,
            create_timestamp: block.create_timestamp,
            signature: SignatureBytes::empty(),
        })
    }

    fn sign(&self, mut log: ConsensusLog) -> ConsensusLog {
        log.signature = self.keypair.sign(&log.signing_bytes());
        log
    }

    /* ↓↓↓ Cache keys ↓↓↓ */

    pub fn get_log_cache_key(&self, log: &ConsensusLog) -> CacheKey {
        CacheKey::log(log.transaction(), log.peer_id.clone(), log.status)
    }

    pub fn get_data_block_cache_key(&self, block_id: &BlockId, slice_number: SliceNumber) -> CacheKey {
        CacheKey::data_block(block_id.clone(), slice_number)
    }

    /* ↓↓↓ Verification ↓↓↓ */

    /// The public key of `peer_id`, as known to the peer service.
    pub fn public_key_of(&self, peer_id: &PeerId) -> Option<[u8; 32]> {
        if let Some(me) = self.peers.myself() {
            if &me.peer_id == peer_id {
                return Some(self.keypair.public().to_bytes());
            }
        }
        self.peers.find(peer_id).map(|peer| peer.public_key)
    }

    /// Check that `block`'s payload hash matches its payload and that its origin signed it.
    pub fn verify_data_block(&self, block: &DataBlock) -> Result<(), ConsensusError> {
        if !block.is_payload_consistent() {
            return Err(ConsensusError::PayloadHashMismatch(block.block_id.clone()));
        }
        let public_key = self
            .public_key_of(&block.peer_id)
            .ok_or_else(|| ConsensusError::UnknownPeer(block.peer_id.clone()))?;
        if !block.is_correctly_signed(&public_key) {
            self.peers.penalize(&block.peer_id, "invalid data block signature");
            return Err(ConsensusError::InvalidSignature(block.peer_id.clone()));
        }
        Ok(())
    }

    /// Check that `block`'s replica set is one its primary could have chosen: the primary is a member, no
    /// peer appears twice, and there are at least [`MIN_CONSENSUS_PEERS`] members.
    pub fn check_replica_set(&self, block: &DataBlock) -> Result<(), ConsensusError> {
        let mut distinct = block.peer_ids.clone();
        distinct.sort();
        distinct.dedup();
        let has_primary = block
            .primary_peer_id
            .as_ref()
            .map_or(false, |primary| block.peer_ids.contains(primary));
        if distinct.len() != block.peer_ids.len() || !has_primary {
            return Err(ConsensusError::AuthorityViolation(Authority::InvalidReplicaSet));
        }
        if distinct.len() < MIN_CONSENSUS_PEERS {
            return Err(ConsensusError::InsufficientReplicas {
                block_id: block.block_id.clone(),
                slice_number: block.slice_number,
                required: MIN_CONSENSUS_PEERS,
                available: distinct.len(),
            });
        }
        Ok(())
    }

    /// Check a block returned by `primary` for a submission of the local peer, and return its
    /// transaction.
    pub fn check_submission(&self, primary: &PeerId, stamped: &DataBlock) -> Result<Transaction, ConsensusError> {
        let me = self.myself()?;
        if stamped.peer_id != me.peer_id {
            return Err(ConsensusError::AuthorityViolation(Authority::NotClientPeer));
        }
        match stamped.transaction() {
            Some(transaction) if &transaction.primary_peer_id == primary => Ok(transaction),
            _ => Err(ConsensusError::AuthorityViolation(Authority::MustPrimaryPeer)),
        }
    }

    /// The block the local peer submitted in `transaction`, as stamped by its primary.
    pub fn submission(&self, cache: &CorrelationCache, transaction: &Transaction) -> Option<DataBlock> {
        cache
            .get(&CacheKey::submission(transaction.clone()))
            .and_then(CacheRecord::into_data_block)
    }

    /// Remember `stamped` as the local peer's submission in its transaction. The first binding wins.
    pub fn bind_submission(&self, cache: &CorrelationCache, transaction: &Transaction, stamped: &DataBlock) {
        let key = CacheKey::submission(transaction.clone());
        if !cache.set_default(key, CacheRecord::DataBlock(stamped.clone())).is_inserted() {
            log::debug!("submission {} is already bound", transaction);
        }
    }

    /// Check `log`'s signature against the key the peer service knows for its voter. The public key
    /// embedded in the log is not trusted.
    pub fn verify_vote(&self, log: &ConsensusLog) -> Result<(), ConsensusError> {
        let public_key = self
            .public_key_of(&log.peer_id)
            .ok_or_else(|| ConsensusError::UnknownPeer(log.peer_id.clone()))?;
        if !log.is_correctly_signed(&public_key) {
            self.peers.penalize(&log.peer_id, "invalid vote signature");
            return Err(ConsensusError::InvalidSignature(log.peer_id.clone()));
        }
        Ok(())
    }

    /* ↓↓↓ Vote bookkeeping ↓↓↓ */

    /// Record `log` in `cache` if no vote of its voter for its transaction and phase is cached yet.
    ///
    /// Returns `Ok(true)` on first sighting and `Ok(false)` for a duplicate with the same payload hash.
    /// A cached vote with a different payload hash is an equivocation: the cached vote is kept, the
    /// voter is penalized, and `EquivocationDetected` is returned.
    pub fn record_vote(
        &self,
        cache: &CorrelationCache,
        protocol: ProtocolKind,
        log: &ConsensusLog,
    ) -> Result<bool, ConsensusError> {
        match cache.set_default(self.get_log_cache_key(log), CacheRecord::Log(log.clone())) {
            SetDefault::Inserted => Ok(true),
            SetDefault::Existing(record) => match record.as_log() {
                Some(cached) if cached.payload_hash != log.payload_hash => {
                    self.peers.penalize(&log.peer_id, "equivocation");
                    self.event_publisher.publish(Event::EquivocationDetected(EquivocationDetectedEvent {
                        timestamp: SystemTime::now(),
                        protocol,
                        peer: log.peer_id.clone(),
                        transaction: log.transaction(),
                        phase: log.status,
                    }));
                    Err(ConsensusError::EquivocationDetected {
                        peer: log.peer_id.clone(),
                        transaction: log.transaction(),
                        phase: log.status,
                        cached: cached.payload_hash,
                        received: log.payload_hash,
                    })
                }
                _ => Ok(false),
            },
        }
    }

    /// The vote of `peer_id` for `transaction` at `phase`, if cached.
    pub fn cached_vote(
        &self,
        cache: &CorrelationCache,
        transaction: &Transaction,
        peer_id: &PeerId,
        phase: Phase,
    ) -> Option<ConsensusLog> {
        cache
            .get(&CacheKey::log(transaction.clone(), peer_id.clone(), phase))
            .and_then(|record| record.as_log().cloned())
    }

    /// Whether `peer_id` has a cached vote for `transaction` at `phase` that agrees with `payload_hash`.
    pub fn has_matching_vote(
        &self,
        cache: &CorrelationCache,
        transaction: &Transaction,
        peer_id: &PeerId,
        phase: Phase,
        payload_hash: &CryptoHash,
    ) -> bool {
        self.cached_vote(cache, transaction, peer_id, phase)
            .map_or(false, |vote| &vote.payload_hash == payload_hash)
    }

    /// Count the votes at `phase` that agree with `payload_hash` among `replicas`. The local peer
    /// counts as one vote and is not looked up.
    pub fn count_votes(
        &self,
        cache: &CorrelationCache,
        transaction: &Transaction,
        replicas: &[PeerId],
        me: &PeerId,
        phase: Phase,
        payload_hash: &CryptoHash,
    ) -> usize {
        1 + replicas
            .iter()
            .filter(|peer_id| *peer_id != me)
            .filter(|peer_id| self.has_matching_vote(cache, transaction, peer_id, phase, payload_hash))
            .count()
    }

    /* ↓↓↓ Durable store ↓↓↓ */

    pub fn persist_log(&self, log: &ConsensusLog) -> Result<(), ConsensusError> {
        Ok(self.store.insert_log(log)?)
    }

    /// Store `block` as a draft, pending the outcome of consensus. Tombstones are not stored.
    pub fn store_draft(&self, block: &DataBlock) -> Result<(), ConsensusError> {
        if block.is_tombstone() {
            return Ok(());
        }
        let mut draft = block.clone();
        draft.status = BlockStatus::Draft;
        Ok(self.store.store_value(&draft)?)
    }

    /// Apply the outcome of consensus to the durable store: delete a tombstone, or make the block
    /// `Effective`, storing it first if this peer never stored the draft.
    pub fn finalize_block(&self, block: &DataBlock) -> Result<(), ConsensusError> {
        if block.is_tombstone() {
            self.store.delete(&block.block_id, block.slice_number)?;
            return Ok(());
        }
        match self.store.find(&block.block_id, block.slice_number)? {
            Some(_) => self
                .store
                .update_status(&block.block_id, block.slice_number, BlockStatus::Effective)?,
            None => {
                let mut effective = block.clone();
                effective.status = BlockStatus::Effective;
                self.store.store_value(&effective)?
            }
        }
        Ok(())
    }

    /* ↓↓↓ Replica selection ↓↓↓ */

    /// Every peer eligible for a replica set, the local peer included, without duplicates.
    pub fn candidates(&self) -> Vec<PeerId> {
        let mut candidates: Vec<PeerId> = self
            .peers
            .candidates()
            .into_iter()
            .map(|peer| peer.peer_id)
            .collect();
        if let Some(me) = self.peers.myself() {
            candidates.push(me.peer_id);
        }
        candidates.sort();
        candidates.dedup();
        candidates
    }

    /// Choose the replica set of `block`: at most `size` peers, the primary first. Returns an empty
    /// list if fewer than [`MIN_CONSENSUS_PEERS`] peers are eligible.
    pub fn choose_consensus_peer(&self, block: &DataBlock, size: usize) -> Result<Vec<PeerId>, ConsensusError> {
        let primary = match &block.primary_peer_id {
            Some(primary) => primary.clone(),
            None => self.myself()?.peer_id,
        };
        let candidates = self.candidates();
        if candidates.len() < MIN_CONSENSUS_PEERS {
            log::debug!(
                "only {} candidates for {}/{}",
                candidates.len(),
                block.block_id,
                block.slice_number
            );
            return Ok(Vec::new());
        }

        let seed = selection_seed(&block.block_id, block.create_timestamp);
        let replicas = select_replicas(self.peer_selection, &seed, &primary, &candidates, size);
        if replicas.len() < MIN_CONSENSUS_PEERS {
            return Ok(Vec::new());
        }
        Ok(replicas)
    }

    /// The `count` candidates nearest to `block`, excluding the local peer. May return fewer.
    pub fn choose_nearest_peers(&self, block: &DataBlock, count: usize) -> Result<Vec<PeerId>, ConsensusError> {
        let me = self.myself()?;
        let candidates: Vec<PeerId> = self
            .candidates()
            .into_iter()
            .filter(|peer_id| peer_id != &me.peer_id)
            .collect();
        let seed = selection_seed(&block.block_id, block.create_timestamp);
        Ok(rank(PeerSelection::Nearest, &seed, &candidates)
            .into_iter()
            .take(count)
            .collect())
    }
}
