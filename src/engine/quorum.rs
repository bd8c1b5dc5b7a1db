/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Quorum arithmetic over a replica set of size `n`.
//!
//! A replica set of size `n` tolerates `f = n / 3` faulty peers (integer division). A phase completes
//! once strictly more than `2f` matching votes, the local peer's own vote included, have been seen.

/// Number of faulty peers a replica set of `replicas` peers tolerates.
pub fn fault_tolerance(replicas: usize) -> usize {
    replicas / 3
}

/// Whether `votes` matching votes complete a phase in a replica set of `replicas` peers.
pub fn is_quorum(votes: usize, replicas: usize) -> bool {
    votes > 2 * fault_tolerance(replicas)
}

/// Number of matching replies after which a client accepts the outcome of a PBFT-style transaction:
/// one more than the peers that may lie.
pub fn client_confirmation_threshold(replicas: usize) -> usize {
    fault_tolerance(replicas) + 1
}

/// Number of confirmations, the primary's own included, that finalize a Standard write to
/// `replicas` peers when `min_peer_num` replicas were asked for.
pub fn write_quorum(min_peer_num: usize, replicas: usize) -> usize {
    min_peer_num.min(replicas) + 1
}
