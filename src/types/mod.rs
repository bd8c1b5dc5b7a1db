/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared by the consensus engine, the protocols and the pluggable collaborators.
//!
//! Types that belong to a single component (for example the cache key, or the wire envelope) are
//! defined in the respective modules.

pub mod consensus_log;

pub mod crypto_primitives;

pub mod data_block;

pub mod data_types;

pub mod peer;
