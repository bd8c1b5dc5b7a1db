/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable collaborators that the library user provides: the durable [`DataStore`] and the peer
//! identity provider [`PeerService`]. The third collaborator, the message transport, is defined in
//! [`networking::network`](crate::networking::network).
//!
//! All three are consumed by reference from many worker threads at once, so implementations must be
//! `Send + Sync` and do their own internal synchronization.

use thiserror::Error;

use crate::types::{
    consensus_log::ConsensusLog,
    data_block::{BlockStatus, DataBlock},
    data_types::{BlockId, PeerId, SliceNumber},
    peer::Peer,
};

/// Persistent storage of data blocks and consensus logs.
pub trait DataStore: Send + Sync + 'static {
    /// Application-level checks on a block before the primary accepts it (ownership, expiry, quota).
    fn validate(&self, block: &DataBlock) -> Result<(), StoreError>;

    /// Insert `block`, or replace the stored block with the same `(block_id, slice_number)`.
    fn store_value(&self, block: &DataBlock) -> Result<(), StoreError>;

    /// Set the status of a stored block. Returns `StoreError::NotFound` if no such block exists.
    fn update_status(
        &self,
        block_id: &BlockId,
        slice_number: SliceNumber,
        status: BlockStatus,
    ) -> Result<(), StoreError>;

    /// Remove a stored block. Removing a block that does not exist is not an error.
    fn delete(&self, block_id: &BlockId, slice_number: SliceNumber) -> Result<(), StoreError>;

    fn find(&self, block_id: &BlockId, slice_number: SliceNumber) -> Result<Option<DataBlock>, StoreError>;

    fn insert_log(&self, log: &ConsensusLog) -> Result<(), StoreError>;
}

/// Resolves the local peer and metadata of remote peers.
pub trait PeerService: Send + Sync + 'static {
    /// The local peer record. `None` while the identity has not been resolved yet.
    fn myself(&self) -> Option<Peer>;

    /// Metadata of a known peer.
    fn find(&self, peer_id: &PeerId) -> Option<Peer>;

    /// Every peer eligible to join a replica set. May include the local peer.
    fn candidates(&self) -> Vec<Peer>;

    /// Lower the reputation of a misbehaving peer.
    fn penalize(&self, _peer_id: &PeerId, _reason: &str) {}
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block rejected by validation: {0}")]
    Rejected(String),

    #[error("block {block_id}/{slice_number} not found")]
    NotFound {
        block_id: BlockId,
        slice_number: SliceNumber,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}
