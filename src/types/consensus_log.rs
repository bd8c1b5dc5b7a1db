/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of [`ConsensusLog`], the per-peer vote record, and of the [`Transaction`] and
//! [`Phase`] that identify what a vote is for.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::verify,
    data_types::{BlockId, CryptoHash, PeerId, SequenceId, SignatureBytes, SliceNumber, Timestamp},
};

/// Progress marker of a peer within one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub enum Phase {
    PrePrepared,
    Prepared,
    Committed,
    Reply,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::PrePrepared => "PRE-PREPARED",
            Phase::Prepared => "PREPARED",
            Phase::Committed => "COMMITTED",
            Phase::Reply => "REPLY",
        };
        f.write_str(name)
    }
}

/// One consensus round over a specific `(block_id, slice_number)` originated by a primary.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub primary_peer_id: PeerId,
    pub block_id: BlockId,
    pub slice_number: SliceNumber,
    pub primary_sequence_id: SequenceId,
}

impl Display for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}@{}",
            self.block_id, self.slice_number, self.primary_sequence_id, self.primary_peer_id
        )
    }
}

/// A vote cast by `peer_id` for a [`Transaction`] at a given [`Phase`].
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ConsensusLog {
    pub primary_peer_id: PeerId,
    pub block_id: BlockId,
    pub slice_number: SliceNumber,
    pub primary_sequence_id: SequenceId,
    /// The voter.
    pub peer_id: PeerId,
    pub status: Phase,
    /// Must match the payload hash of the block the transaction is about.
    pub payload_hash: CryptoHash,
    /// Replica set agreed for the transaction.
    pub peer_ids: Vec<PeerId>,
    /// Origin of the data block; the final reply goes here.
    pub client_peer_id: PeerId,
    pub client_address: String,
    /// Ed25519 public key of the voter.
    pub public_key: [u8; 32],
    pub create_timestamp: Timestamp,
    pub signature: SignatureBytes,
}

impl ConsensusLog {
    pub fn transaction(&self) -> Transaction {
        Transaction {
            primary_peer_id: self.primary_peer_id.clone(),
            block_id: self.block_id.clone(),
            slice_number: self.slice_number,
            primary_sequence_id: self.primary_sequence_id,
        }
    }

    /// The values the voter's signature is over.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        (
            self.transaction(),
            &self.peer_id,
            self.status,
            self.payload_hash,
            &self.peer_ids,
            &self.client_peer_id,
        )
            .serialize(&mut bytes)
            .expect("serializing into a Vec<u8> never fails");
        bytes
    }

    pub fn is_correctly_signed(&self, public_key: &[u8; 32]) -> bool {
        verify(public_key, &self.signing_bytes(), &self.signature)
    }

    pub fn is_primary_vote(&self) -> bool {
        self.peer_id == self.primary_peer_id
    }
}
