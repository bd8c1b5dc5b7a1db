/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [configuration](crate::config::Configuration).
//!
//! The crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [CollectQuorum](crate::events::CollectQuorumEvent) is printed:
//!
//! ```text
//! CollectQuorum, 1701329264, Pbft, block-1/0#3@peer-a, PREPARED, 3, 4
//! ```
//!
//! In the snippet:
//! - The third value is the protocol.
//! - The fourth value is the transaction, as `block_id/slice_number#sequence_id@primary`.
//! - The remaining values are the phase, the number of votes observed and the replica set size.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const RECEIVE_CONSENSUS: &str = "ReceiveConsensus";
pub const RECEIVE_VOTE: &str = "ReceiveVote";
pub const REJECT_MESSAGE: &str = "RejectMessage";
pub const EQUIVOCATION_DETECTED: &str = "EquivocationDetected";

pub const PREPREPARE: &str = "Preprepare";
pub const VOTE: &str = "Vote";
pub const REPLY: &str = "Reply";
pub const DELIVERY_ATTEMPTED: &str = "DeliveryAttempted";

pub const COLLECT_QUORUM: &str = "CollectQuorum";
pub const FINALIZE: &str = "Finalize";
pub const CONFIRMED: &str = "Confirmed";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ReceiveConsensusEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ReceiveConsensusEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}, {}",
                RECEIVE_CONSENSUS,
                secs_since_unix_epoch(event.timestamp),
                event.protocol,
                event.origin,
                event.block_id,
                event.slice_number
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ReceiveVoteEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}, {}, {}",
                RECEIVE_VOTE,
                secs_since_unix_epoch(event.timestamp),
                event.protocol,
                event.origin,
                event.vote.transaction(),
                event.vote.status,
                first_seven_base64_chars(&event.vote.payload_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for RejectMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &RejectMessageEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                REJECT_MESSAGE,
                secs_since_unix_epoch(event.timestamp),
                event.message_type,
                event.origin,
                event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for EquivocationDetectedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &EquivocationDetectedEvent| {
            log::warn!(
                "{}, {}, {:?}, {}, {}, {}",
                EQUIVOCATION_DETECTED,
                secs_since_unix_epoch(event.timestamp),
                event.protocol,
                event.peer,
                event.transaction,
                event.phase
            )
        };
        Box::new(logger)
    }
}

impl Logger for PreprepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &PreprepareEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}",
                PREPREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.protocol,
                event.transaction,
                event.recipients.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &VoteEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}, {}",
                VOTE,
                secs_since_unix_epoch(event.timestamp),
                event.protocol,
                event.vote.transaction(),
                event.vote.status,
                first_seven_base64_chars(&event.vote.payload_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReplyEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ReplyEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}",
                REPLY,
                secs_since_unix_epoch(event.timestamp),
                event.protocol,
                event.transaction,
                event.recipient
            )
        };
        Box::new(logger)
    }
}

impl Logger for DeliveryAttemptedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &DeliveryAttemptedEvent| match &event.result {
            Ok(()) => log::debug!(
                "{}, {}, {}, {}, ok",
                DELIVERY_ATTEMPTED,
                secs_since_unix_epoch(event.timestamp),
                event.message_type,
                event.target
            ),
            Err(error) => log::warn!(
                "{}, {}, {}, {}, {}",
                DELIVERY_ATTEMPTED,
                secs_since_unix_epoch(event.timestamp),
                event.message_type,
                event.target,
                error
            ),
        };
        Box::new(logger)
    }
}

impl Logger for CollectQuorumEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &CollectQuorumEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}, {}, {}",
                COLLECT_QUORUM,
                secs_since_unix_epoch(event.timestamp),
                event.protocol,
                event.transaction,
                event.phase,
                event.votes,
                event.replicas
            )
        };
        Box::new(logger)
    }
}

impl Logger for FinalizeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &FinalizeEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}",
                FINALIZE,
                secs_since_unix_epoch(event.timestamp),
                event.protocol,
                event.transaction,
                event.tombstone
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConfirmedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ConfirmedEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}",
                CONFIRMED,
                secs_since_unix_epoch(event.timestamp),
                event.protocol,
                event.transaction,
                event.replies
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
