/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definition of the [`DataBlock`] type, the unit that consensus is reached over.
//!
//! ## Identity
//!
//! For consensus purposes a data block is identified by its `(block_id, slice_number)` pair. A block
//! becomes part of a concrete [transaction](super::consensus_log::Transaction) once a primary peer
//! stamps its own id and a sequence id on it.
//!
//! ## Tombstones
//!
//! A block with an empty `transport_payload` is a tombstone. Consensus over a tombstone runs the same
//! quorum machinery, but finalizing it deletes the stored block instead of upserting it.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    consensus_log::Transaction,
    crypto_primitives::{hash, verify, Keypair},
    data_types::{BlockId, CryptoHash, PeerId, SequenceId, SignatureBytes, SliceNumber, Timestamp},
};

/// Lifecycle of a stored [`DataBlock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum BlockStatus {
    /// Stored, but consensus has not finished yet.
    Draft,
    /// Consensus finished; the block is authoritative.
    Effective,
    /// Superseded or expired.
    Ineffective,
}

/// Kind of payload carried by a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum BlockType {
    Regular,
    /// Attachments are only ever stored on the peer that receives them and are never replicated.
    Attachment,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct DataBlock {
    pub block_id: BlockId,
    pub slice_number: SliceNumber,
    pub slice_size: u64,
    /// Peer that proposes this block to the replica set. `None` until a primary stamps itself.
    pub primary_peer_id: Option<PeerId>,
    pub primary_sequence_id: SequenceId,
    /// Origin (owner) of the block, and the peer that finally receives the reply.
    pub peer_id: PeerId,
    pub block_type: BlockType,
    pub payload_hash: CryptoHash,
    pub transport_payload: Vec<u8>,
    /// Signature of the origin peer over [`signing_bytes`](Self::signing_bytes).
    pub signature: SignatureBytes,
    /// Replica set chosen for this block.
    pub peer_ids: Vec<PeerId>,
    pub status: BlockStatus,
    pub create_timestamp: Timestamp,
    pub expire_date: Option<Timestamp>,
}

impl DataBlock {
    /// Create a `Draft` block originating from `peer_id`, hashing `payload` and signing the result with
    /// `keypair`.
    pub fn new_signed(
        keypair: &Keypair,
        peer_id: PeerId,
        block_id: BlockId,
        slice_number: SliceNumber,
        slice_size: u64,
        block_type: BlockType,
        payload: Vec<u8>,
        create_timestamp: Timestamp,
    ) -> DataBlock {
        let mut block = DataBlock {
            block_id,
            slice_number,
            slice_size,
            primary_peer_id: None,
            primary_sequence_id: SequenceId::unassigned(),
            peer_id,
            block_type,
            payload_hash: hash(&payload),
            transport_payload: payload,
            signature: SignatureBytes::empty(),
            peer_ids: Vec::new(),
            status: BlockStatus::Draft,
            create_timestamp,
            expire_date: None,
        };
        block.signature = keypair.sign(&block.signing_bytes());
        block
    }

    /// The values the origin signature is over. Excludes the fields that change during consensus:
    /// primary, sequence id, replica set and status.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        (
            &self.block_id,
            self.slice_number,
            self.slice_size,
            &self.peer_id,
            self.block_type,
            self.payload_hash,
            self.create_timestamp,
        )
            .serialize(&mut bytes)
            .expect("serializing into a Vec<u8> never fails");
        bytes
    }

    /// Checks the origin signature against the origin peer's public key.
    pub fn is_correctly_signed(&self, public_key: &[u8; 32]) -> bool {
        verify(public_key, &self.signing_bytes(), &self.signature)
    }

    /// Whether `payload_hash` is the hash of `transport_payload`.
    pub fn is_payload_consistent(&self) -> bool {
        hash(&self.transport_payload) == self.payload_hash
    }

    pub fn is_tombstone(&self) -> bool {
        self.transport_payload.is_empty()
    }

    pub fn is_attachment(&self) -> bool {
        self.block_type == BlockType::Attachment
    }

    /// The transaction this block takes part in. Returns `None` until a primary is stamped.
    pub fn transaction(&self) -> Option<Transaction> {
        self.primary_peer_id.as_ref().map(|primary_peer_id| Transaction {
            primary_peer_id: primary_peer_id.clone(),
            block_id: self.block_id.clone(),
            slice_number: self.slice_number,
            primary_sequence_id: self.primary_sequence_id,
        })
    }
}
