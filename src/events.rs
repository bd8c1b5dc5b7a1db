/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events a node emits for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed (or, for
//! [`DeliveryAttemptedEvent`], attempted). Events are published on a channel and consumed by the
//! [event bus](crate::event_bus) thread, which fires the user-registered handlers and, if enabled, the
//! default [loggers](crate::logging).

use std::{
    sync::{mpsc::Sender, Mutex},
    time::SystemTime,
};

use crate::{
    networking::messages::{MessageType, ProtocolKind},
    sync::lock,
    types::{
        consensus_log::{ConsensusLog, Phase, Transaction},
        data_types::{BlockId, PeerId, SliceNumber},
    },
};

pub enum Event {
    // Events that involve receiving a message.
    ReceiveConsensus(ReceiveConsensusEvent),
    ReceiveVote(ReceiveVoteEvent),
    RejectMessage(RejectMessageEvent),
    EquivocationDetected(EquivocationDetectedEvent),
    // Events that involve sending a message.
    Preprepare(PreprepareEvent),
    Vote(VoteEvent),
    Reply(ReplyEvent),
    DeliveryAttempted(DeliveryAttemptedEvent),
    // Events that change the state of a transaction.
    CollectQuorum(CollectQuorumEvent),
    Finalize(FinalizeEvent),
    Confirmed(ConfirmedEvent),
}

/// The sending end of the event channel, shared by every worker thread of a node.
///
/// Publishing is a no-op when the node was started without event handlers and without logging.
pub struct EventPublisher(Option<Mutex<Sender<Event>>>);

impl EventPublisher {
    pub(crate) fn new(sender: Option<Sender<Event>>) -> EventPublisher {
        EventPublisher(sender.map(Mutex::new))
    }

    /// A publisher that drops every event.
    pub fn disabled() -> EventPublisher {
        EventPublisher(None)
    }

    pub fn publish(&self, event: Event) {
        if let Some(sender) = &self.0 {
            // The event bus may already be shut down; events emitted during shutdown are dropped.
            let _ = lock(sender).send(event);
        }
    }
}

/// A primary accepted a data block from a client.
pub struct ReceiveConsensusEvent {
    pub timestamp: SystemTime,
    pub protocol: ProtocolKind,
    pub origin: PeerId,
    pub block_id: BlockId,
    pub slice_number: SliceNumber,
}

/// A vote from another peer was accepted (first sighting, signature verified).
pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub protocol: ProtocolKind,
    pub origin: PeerId,
    pub vote: ConsensusLog,
}

/// A handler rejected an inbound message.
pub struct RejectMessageEvent {
    pub timestamp: SystemTime,
    pub message_type: MessageType,
    pub origin: PeerId,
    pub reason: String,
}

/// A peer sent two different payload hashes for the same transaction and phase.
pub struct EquivocationDetectedEvent {
    pub timestamp: SystemTime,
    pub protocol: ProtocolKind,
    pub peer: PeerId,
    pub transaction: Transaction,
    pub phase: Phase,
}

/// The primary fanned a data block out to the replica set.
pub struct PreprepareEvent {
    pub timestamp: SystemTime,
    pub protocol: ProtocolKind,
    pub transaction: Transaction,
    pub recipients: Vec<PeerId>,
}

/// The local peer cast a vote.
pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub protocol: ProtocolKind,
    pub vote: ConsensusLog,
}

/// The local peer sent a REPLY.
pub struct ReplyEvent {
    pub timestamp: SystemTime,
    pub protocol: ProtocolKind,
    pub transaction: Transaction,
    pub recipient: PeerId,
}

/// One outbound envelope was handed to the transport (or could not be).
pub struct DeliveryAttemptedEvent {
    pub timestamp: SystemTime,
    pub message_type: MessageType,
    pub target: PeerId,
    pub result: Result<(), String>,
}

/// The local peer observed a quorum of votes for `phase`.
pub struct CollectQuorumEvent {
    pub timestamp: SystemTime,
    pub protocol: ProtocolKind,
    pub transaction: Transaction,
    pub phase: Phase,
    pub votes: usize,
    pub replicas: usize,
}

/// The block of `transaction` became effective (or was deleted, for a tombstone) in the local store.
pub struct FinalizeEvent {
    pub timestamp: SystemTime,
    pub protocol: ProtocolKind,
    pub transaction: Transaction,
    pub tombstone: bool,
}

/// The client accepted the outcome of `transaction`.
pub struct ConfirmedEvent {
    pub timestamp: SystemTime,
    pub protocol: ProtocolKind,
    pub transaction: Transaction,
    pub replies: usize,
}
