/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The error taxonomy shared by the consensus engine and every protocol.
//!
//! Every handler returns `Result<_, ConsensusError>`. An error is always fatal to the single message
//! being handled, never to the node: the dispatcher converts it into an error response for the
//! immediate sender (or logs it) and moves on.

use thiserror::Error;

use crate::{
    networking::{network::TransportError, worker_pool::PoolError},
    pluggables::StoreError,
    types::{
        consensus_log::{Phase, Transaction},
        data_types::{BlockId, CryptoHash, PeerId, SliceNumber},
    },
};

/// The authority rule a message broke.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authority {
    /// A different primary is already declared on the block submitted to this peer.
    MustPrimaryPeer,
    /// A PRE_PREPARED message did not come from the block's declared primary.
    SendPrepreparedMustPrimaryPeer,
    /// The primary received a PRE_PREPARED message for its own proposal.
    PrepreparedInPrimaryPeer,
    /// A PREPARED vote claims to come from the primary, which does not vote in this phase.
    SendPrimaryPreparedMessage,
    /// A vote claims to come from the receiving peer itself.
    SendMyselfMessage,
    /// A COMMITTED message in a leader-driven protocol did not come from the leader.
    SendCommitedMustPrimaryPeer,
    /// A message that only the primary may receive was sent to a replica.
    NotPrimaryPeer,
    /// The sender, or the receiving peer, is not in the transaction's replica set.
    NotReplica,
    /// A client-side REPLY reached a peer that is not the origin of the block, or a primary stamped a
    /// block for a different client.
    NotClientPeer,
    /// A replica set leaves out its primary or names a peer twice.
    InvalidReplicaSet,
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("the local peer identity is not resolved yet")]
    IdentityUnavailable,

    #[error("authority violation: {0:?}")]
    AuthorityViolation(Authority),

    #[error("peer {peer} equivocated on {transaction} at {phase}: cached {cached:?}, received {received:?}")]
    EquivocationDetected {
        peer: PeerId,
        transaction: Transaction,
        phase: Phase,
        cached: CryptoHash,
        received: CryptoHash,
    },

    #[error("block {block_id}/{slice_number} needs at least {required} replicas, {available} available")]
    InsufficientReplicas {
        block_id: BlockId,
        slice_number: SliceNumber,
        required: usize,
        available: usize,
    },

    #[error("failed to decode payload: {0}")]
    DecodeError(String),

    #[error("durable store failure: {0}")]
    PersistenceFailure(#[from] StoreError),

    #[error("signature of {0} does not verify")]
    InvalidSignature(PeerId),

    #[error("peer {0} is unknown to the peer service")]
    UnknownPeer(PeerId),

    #[error("payload hash of block {0} does not match its payload")]
    PayloadHashMismatch(BlockId),

    #[error("transaction {0} is not in flight on this peer")]
    UnknownTransaction(Transaction),

    #[error("no handler registered for message type {0}")]
    UnregisteredMessageType(String),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Dispatch(#[from] PoolError),

    #[error("peer {peer} rejected the request: {reason}")]
    Rejected { peer: PeerId, reason: String },
}

impl From<std::io::Error> for ConsensusError {
    fn from(value: std::io::Error) -> Self {
        ConsensusError::DecodeError(value.to_string())
    }
}
