/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The PBFT-style protocol.
//!
//! Every replica sends its PREPARED and COMMITTED votes to every other replica and counts the votes it
//! receives on its own. A replica finalizes the block once it has seen more than `2f` matching
//! COMMITTED votes, then sends a REPLY to the client, which accepts the outcome after `f + 1` matching
//! replies.

use crate::{
    networking::messages::ProtocolKind,
    types::data_types::PeerId,
};

use super::phased::{CommitRule, PhasedProtocol, ReplyRule, Topology};

pub type PbftProtocol<S, P, N> = PhasedProtocol<S, P, N, FullMesh>;

/// All-to-all voting.
#[derive(Clone, Copy, Debug, Default)]
pub struct FullMesh;

impl Topology for FullMesh {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Pbft
    }

    fn prepared_recipients(&self, replicas: &[PeerId], _primary: &PeerId, me: &PeerId) -> Vec<PeerId> {
        replicas.iter().filter(|peer_id| *peer_id != me).cloned().collect()
    }

    fn collects_prepared(&self, _primary: &PeerId, _me: &PeerId) -> bool {
        true
    }

    fn commit_rule(&self) -> CommitRule {
        CommitRule::Quorum
    }

    fn reply_rule(&self) -> ReplyRule {
        ReplyRule::ClientConfirmation
    }
}
