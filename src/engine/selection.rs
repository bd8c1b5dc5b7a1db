/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deterministic replica selection.
//!
//! Every peer that ranks the same candidate list for the same block gets the same order, because the
//! ranking depends only on the candidates' ids and on a seed derived from the block id and the block's
//! creation timestamp.

use borsh::BorshSerialize;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    config::PeerSelection,
    types::{
        crypto_primitives::hash,
        data_types::{BlockId, CryptoHash, PeerId, Timestamp},
    },
};

/// The seed every ranking of `block_id`'s candidates starts from.
pub fn selection_seed(block_id: &BlockId, create_timestamp: Timestamp) -> CryptoHash {
    let mut bytes = Vec::new();
    (block_id, create_timestamp)
        .serialize(&mut bytes)
        .expect("serializing into a Vec<u8> never fails");
    hash(&bytes)
}

/// XOR distance between the hash of `peer_id` and `seed`, compared as a big-endian number.
pub fn distance(peer_id: &PeerId, seed: &CryptoHash) -> [u8; 32] {
    let peer_hash = hash(peer_id.as_str().as_bytes()).bytes();
    let seed = seed.bytes();
    let mut distance = [0u8; 32];
    for (i, byte) in distance.iter_mut().enumerate() {
        *byte = peer_hash[i] ^ seed[i];
    }
    distance
}

/// Order `candidates` by `policy`. Duplicates are removed first.
pub fn rank(policy: PeerSelection, seed: &CryptoHash, candidates: &[PeerId]) -> Vec<PeerId> {
    let mut ranked: Vec<PeerId> = candidates.to_vec();
    ranked.sort();
    ranked.dedup();

    match policy {
        PeerSelection::Nearest => {
            ranked.sort_by_cached_key(|peer_id| (distance(peer_id, seed), peer_id.clone()));
        }
        PeerSelection::Random => {
            let mut rng = StdRng::from_seed(seed.bytes());
            ranked.shuffle(&mut rng);
        }
    }
    ranked
}

/// Pick a replica set of at most `size` peers that always contains `primary`, listed first.
pub fn select_replicas(
    policy: PeerSelection,
    seed: &CryptoHash,
    primary: &PeerId,
    candidates: &[PeerId],
    size: usize,
) -> Vec<PeerId> {
    let mut replicas = vec![primary.clone()];
    replicas.extend(
        rank(policy, seed, candidates)
            .into_iter()
            .filter(|peer_id| peer_id != primary)
            .take(size.saturating_sub(1)),
    );
    replicas
}
