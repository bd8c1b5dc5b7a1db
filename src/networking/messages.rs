/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`ChainMessage`] envelope that peers exchange, and the [`MessageType`] tags that the
//! [dispatcher](super::receiving::Dispatcher) routes on.
//!
//! The payload of an envelope is a tagged union over the two things consensus messages carry, a
//! [`DataBlock`] or a [`ConsensusLog`]. It is decoded once at the transport boundary, so protocol code
//! only ever sees strongly typed values.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{consensus_log::ConsensusLog, data_block::DataBlock, data_types::PeerId};

/// Which consensus protocol a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum ProtocolKind {
    Standard,
    Pbft,
    Raft,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 3] = [ProtocolKind::Standard, ProtocolKind::Pbft, ProtocolKind::Raft];

    fn prefix(self) -> &'static str {
        match self {
            ProtocolKind::Standard => "",
            ProtocolKind::Pbft => "PBFT_",
            ProtocolKind::Raft => "RAFT_",
        }
    }
}

/// The step of the request -> prepare -> commit -> reply pipeline a message drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum Step {
    /// A client submits a data block to a primary.
    Consensus,
    Preprepared,
    Prepared,
    Commited,
    Reply,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::Consensus,
        Step::Preprepared,
        Step::Prepared,
        Step::Commited,
        Step::Reply,
    ];

    fn suffix(self) -> &'static str {
        match self {
            Step::Consensus => "",
            Step::Preprepared => "_PREPREPARED",
            Step::Prepared => "_PREPARED",
            Step::Commited => "_COMMITED",
            Step::Reply => "_REPLY",
        }
    }
}

/// Tag of a consensus message, e.g. `PBFT_CONSENSUS_PREPARED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct MessageType {
    pub protocol: ProtocolKind,
    pub step: Step,
}

impl MessageType {
    pub const fn new(protocol: ProtocolKind, step: Step) -> Self {
        Self { protocol, step }
    }

    /// Every message type of every protocol.
    pub fn all() -> impl Iterator<Item = MessageType> {
        ProtocolKind::ALL
            .into_iter()
            .flat_map(|protocol| Step::ALL.into_iter().map(move |step| MessageType::new(protocol, step)))
    }

    pub fn name(&self) -> String {
        format!("{}CONSENSUS{}", self.protocol.prefix(), self.step.suffix())
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum MessageDirect {
    Request,
    Response,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum PayloadType {
    DataBlock,
    ConsensusLog,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Payload {
    DataBlock(DataBlock),
    ConsensusLog(ConsensusLog),
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::DataBlock(_) => PayloadType::DataBlock,
            Payload::ConsensusLog(_) => PayloadType::ConsensusLog,
        }
    }
}

impl From<DataBlock> for Payload {
    fn from(block: DataBlock) -> Self {
        Payload::DataBlock(block)
    }
}

impl From<ConsensusLog> for Payload {
    fn from(log: ConsensusLog) -> Self {
        Payload::ConsensusLog(log)
    }
}

/// The envelope delivered by the [`Transport`](super::network::Transport).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChainMessage {
    /// The peer that created this envelope.
    pub src_peer_id: PeerId,
    /// The peer the transport should hand the envelope to first. Equal to `target_peer_id` for direct
    /// sends.
    pub connect_peer_id: PeerId,
    pub target_peer_id: PeerId,
    pub message_type: MessageType,
    pub message_direct: MessageDirect,
    pub payload_type: PayloadType,
    pub payload: Option<Payload>,
    pub need_compress: bool,
    /// Set on error responses only.
    pub error: Option<String>,
}

impl ChainMessage {
    /// Build a request envelope carrying `payload` from `src` to `target`.
    pub fn request(
        src_peer_id: PeerId,
        connect_peer_id: PeerId,
        target_peer_id: PeerId,
        message_type: MessageType,
        payload: Payload,
    ) -> ChainMessage {
        ChainMessage {
            src_peer_id,
            connect_peer_id,
            target_peer_id,
            message_type,
            message_direct: MessageDirect::Request,
            payload_type: payload.payload_type(),
            payload: Some(payload),
            need_compress: true,
            error: None,
        }
    }

    /// Build the response to this request, sent by `responder` back to the request's source.
    pub fn response(&self, responder: PeerId, payload: Option<Payload>) -> ChainMessage {
        ChainMessage {
            src_peer_id: responder.clone(),
            connect_peer_id: self.src_peer_id.clone(),
            target_peer_id: self.src_peer_id.clone(),
            message_type: self.message_type,
            message_direct: MessageDirect::Response,
            payload_type: payload
                .as_ref()
                .map(Payload::payload_type)
                .unwrap_or(self.payload_type),
            payload,
            need_compress: self.need_compress,
            error: None,
        }
    }

    /// Build an error response to this request.
    pub fn error_response(&self, responder: PeerId, error: String) -> ChainMessage {
        let mut response = self.response(responder, None);
        response.error = Some(error);
        response
    }

    pub fn is_request(&self) -> bool {
        self.message_direct == MessageDirect::Request
    }

    /// Serialize into bytes for the wire.
    pub fn encode(&self) -> Vec<u8> {
        self.try_to_vec().expect("serializing into a Vec<u8> never fails")
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<ChainMessage, std::io::Error> {
        ChainMessage::try_from_slice(bytes)
    }
}
