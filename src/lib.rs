//! A Rust implementation of peer-to-peer consensus for a replicated, content-addressed data-block store.
//! It offers:
//! 1. Three [protocols](protocol) that run side by side: a PBFT-style protocol tolerating up to 1/3rd of
//!    byzantine replicas, a Raft-style leader-driven protocol, and a Standard quorum write,
//! 2. Deterministic, signature-checked [replica selection](engine::selection) that every peer recomputes
//!    to the same answer,
//! 3. Pluggable peer-to-peer [transport](networking::network), durable [storage](pluggables::DataStore)
//!    and [peer identity](pluggables::PeerService),
//! 4. and a [node](node) that handles every inbound message concurrently on a bounded worker pool.

pub mod cache;

pub mod config;

pub mod engine;

pub mod errors;

pub(crate) mod event_bus;

pub mod events;

pub mod logging;

pub mod networking;

pub mod node;

pub mod pluggables;

pub mod protocol;

pub(crate) mod sync;

pub mod types;
