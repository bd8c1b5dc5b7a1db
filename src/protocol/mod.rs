/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus protocols a node runs side by side.
//!
//! A transaction moves through up to five steps: a client submits a data block to a primary
//! (`CONSENSUS`), the primary proposes it to a replica set (`PREPREPARED`), replicas vote
//! (`PREPARED`, `COMMITED`) and the outcome is reported back (`REPLY`). Each protocol implements the
//! steps it uses as a [`ConsensusProtocol`]:
//! - [`pbft`]: every replica votes to every other replica and counts votes itself.
//! - [`raft`]: replicas vote to the leader only, and the leader drives the commit.
//! - [`standard`]: a quorum write to the nearest peers, without byzantine voting.
//!
//! The PBFT-style and Raft-style protocols are the same [`PhasedProtocol`](phased::PhasedProtocol)
//! state machine configured with a different [`Topology`](phased::Topology).

pub mod phased;

pub mod pbft;

pub mod raft;

pub mod standard;

use std::sync::Arc;

use crate::{
    cache::CorrelationCache,
    errors::ConsensusError,
    networking::{
        messages::{ChainMessage, MessageType, Payload, PayloadType, ProtocolKind, Step},
        receiving::{self, HandlerRegistry, MessageHandler},
    },
    types::{data_block::DataBlock, data_types::PeerId},
};

/// The handlers of one consensus protocol, one per [`Step`].
///
/// Every handler is called concurrently from the receive pool, with messages in any order and any of
/// them possibly duplicated. Each returns the payload to send back to the requester, if any.
pub trait ConsensusProtocol: Send + Sync + 'static {
    fn kind(&self) -> ProtocolKind;

    /// The protocol's correlation cache.
    fn cache(&self) -> &CorrelationCache;

    /// The payload type an envelope of `step` carries in this protocol.
    fn expected_payload(&self, step: Step) -> PayloadType {
        match step {
            Step::Consensus | Step::Preprepared => PayloadType::DataBlock,
            Step::Prepared | Step::Commited | Step::Reply => PayloadType::ConsensusLog,
        }
    }

    /// Bind the block `primary` stamped for a submission of the local peer. Only outcomes that agree
    /// with a bound block confirm a transaction.
    fn submitted(&self, primary: &PeerId, stamped: &DataBlock) -> Result<(), ConsensusError>;

    fn receive_consensus(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError>;

    fn receive_preprepared(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        Err(unsupported(message))
    }

    fn receive_prepared(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        Err(unsupported(message))
    }

    fn receive_commited(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError>;

    fn receive_reply(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError>;
}

fn unsupported(message: &ChainMessage) -> ConsensusError {
    ConsensusError::UnregisteredMessageType(message.message_type.name())
}

/// Adapts one step of a [`ConsensusProtocol`] to the [`MessageHandler`] interface of the dispatcher.
pub struct ProtocolHandler<C: ConsensusProtocol> {
    protocol: Arc<C>,
    step: Step,
}

impl<C: ConsensusProtocol> ProtocolHandler<C> {
    pub fn new(protocol: Arc<C>, step: Step) -> ProtocolHandler<C> {
        ProtocolHandler { protocol, step }
    }

    fn check_envelope(&self, message: &ChainMessage) -> Result<(), ConsensusError> {
        let expected = self.protocol.expected_payload(self.step);
        match &message.payload {
            Some(payload) if payload.payload_type() == expected => Ok(()),
            Some(payload) => Err(ConsensusError::DecodeError(format!(
                "{} must carry {:?}, got {:?}",
                message.message_type,
                expected,
                payload.payload_type()
            ))),
            None => Err(ConsensusError::DecodeError(format!(
                "{} carries no payload",
                message.message_type
            ))),
        }
    }
}

impl<C: ConsensusProtocol> MessageHandler for ProtocolHandler<C> {
    fn send(&self, message: &ChainMessage) -> Result<(), ConsensusError> {
        self.check_envelope(message)
    }

    fn receive(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError> {
        self.check_envelope(message)?;
        match self.step {
            Step::Consensus => self.protocol.receive_consensus(message),
            Step::Preprepared => self.protocol.receive_preprepared(message),
            Step::Prepared => self.protocol.receive_prepared(message),
            Step::Commited => self.protocol.receive_commited(message),
            Step::Reply => self.protocol.receive_reply(message),
        }
    }

    fn response(&self, message: &ChainMessage) {
        receiving::log_response(message);
        if let (Step::Consensus, None, Some(Payload::DataBlock(stamped))) =
            (self.step, &message.error, &message.payload)
        {
            if let Err(error) = self.protocol.submitted(&message.src_peer_id, stamped) {
                log::warn!("ignored {} from {}: {}", message.message_type, message.src_peer_id, error);
            }
        }
    }
}

/// Register a handler for every step of `protocol`.
pub fn register<C: ConsensusProtocol>(registry: &HandlerRegistry, protocol: Arc<C>) {
    let kind = protocol.kind();
    for step in Step::ALL {
        registry.register(
            MessageType::new(kind, step),
            Arc::new(ProtocolHandler::new(Arc::clone(&protocol), step)),
        );
    }
}
