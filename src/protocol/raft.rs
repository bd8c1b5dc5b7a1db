/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Raft-style protocol.
//!
//! Messages form a star around the leader, the primary that accepted the block. Replicas send
//! PREPARED only to the leader. On a PREPARED quorum the leader sends COMMITTED to the replicas, which
//! finalize and send REPLY back to the leader. On a REPLY quorum the leader finalizes and replies to
//! the client.
//!
//! The leader counts against the replica set it chose itself, never against the one a vote claims.

use crate::{
    networking::messages::ProtocolKind,
    types::data_types::PeerId,
};

use super::phased::{CommitRule, PhasedProtocol, ReplyRule, Topology};

pub type RaftProtocol<S, P, N> = PhasedProtocol<S, P, N, LeaderStar>;

/// Every vote goes through the leader.
#[derive(Clone, Copy, Debug, Default)]
pub struct LeaderStar;

impl Topology for LeaderStar {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Raft
    }

    fn prepared_recipients(&self, _replicas: &[PeerId], primary: &PeerId, _me: &PeerId) -> Vec<PeerId> {
        vec![primary.clone()]
    }

    fn collects_prepared(&self, primary: &PeerId, me: &PeerId) -> bool {
        primary == me
    }

    fn commit_rule(&self) -> CommitRule {
        CommitRule::FromLeader
    }

    fn reply_rule(&self) -> ReplyRule {
        ReplyRule::LeaderQuorum
    }
}
