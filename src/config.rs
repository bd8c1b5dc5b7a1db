/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! User-defined parameters of a [`Node`](crate::node::Node).
//!
//! The configuration is defined using the builder pattern, for example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(signing_key)
//!     .replica_count(4)
//!     .min_peer_num(2)
//!     .log_events(true)
//!     .build()
//! ```

use std::time::Duration;

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

/// Smallest replica set that yields a meaningful fault tolerance `f = n / 3`.
pub const MIN_REPLICA_COUNT: usize = 3;

/// How the engine picks the replica set of a block.
///
/// Both policies are deterministic functions of the block id, the block's creation timestamp and the
/// candidate list, so every peer that recomputes the set gets the same answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSelection {
    /// The peers whose id hashes are closest, by XOR distance, to the hash of the block.
    Nearest,
    /// A shuffle of the candidates seeded with the hash of the block.
    Random,
}

/// Stores the user-defined parameters required to start a node, that is:
/// 1. The node's [keypair](ed25519_dalek::SigningKey), used to sign votes.
/// 2. The replica set size used by the PBFT-style and Raft-style protocols.
/// 3. The number of replicas, besides the primary, that the Standard protocol writes to.
/// 4. The replica selection policy.
/// 5. How long correlation cache entries live (zero: until deleted).
/// 6. The sizes of the receive and dispatch worker pools and of the dispatch queue.
/// 7. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Replica count
///
/// The PBFT-style and Raft-style protocols refuse to run with fewer than [`MIN_REPLICA_COUNT`]
/// replicas. Values below it are raised to it.
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`

    Optional:
    - `.replica_count(...)` (default 4)
    - `.min_peer_num(...)` (default 2)
    - `.peer_selection(...)` (default `Nearest`)
    - `.cache_ttl(...)` (default zero)
    - `.receive_workers(...)` (default 4)
    - `.dispatch_workers(...)` (default 2)
    - `.dispatch_queue_capacity(...)` (default 1024)
    - `.log_events(...)` (default false)
"
))]
pub struct Configuration {
    #[builder(setter(doc = "Set the node's keypair, used to sign votes. Required."))]
    pub me: SigningKey,
    #[builder(default = 4, setter(doc = "Set the replica set size of the PBFT-style and Raft-style protocols."))]
    pub replica_count: usize,
    #[builder(default = 2, setter(doc = "Set how many replicas besides the primary the Standard protocol writes to."))]
    pub min_peer_num: usize,
    #[builder(default = PeerSelection::Nearest, setter(doc = "Set the replica selection policy."))]
    pub peer_selection: PeerSelection,
    #[builder(default = Duration::ZERO, setter(doc = "Set the correlation cache TTL. Zero keeps entries until deleted."))]
    pub cache_ttl: Duration,
    #[builder(default = 4, setter(doc = "Set the number of threads handling inbound messages."))]
    pub receive_workers: usize,
    #[builder(default = 2, setter(doc = "Set the number of threads delivering outbound messages."))]
    pub dispatch_workers: usize,
    #[builder(default = 1024, setter(doc = "Set the maximum number of queued jobs per worker pool."))]
    pub dispatch_queue_capacity: usize,
    #[builder(default = false, setter(doc = "Enable logging?"))]
    pub log_events: bool,
}

impl Configuration {
    /// The effective replica set size of the PBFT-style and Raft-style protocols.
    pub fn effective_replica_count(&self) -> usize {
        self.replica_count.max(MIN_REPLICA_COUNT)
    }
}
