/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured keys of the [correlation cache](super::CorrelationCache).
//!
//! Keys are compared structurally inside the cache. Their string form, used in logs and by callers
//! that need a flat key, is the Base64URL encoding of the key's borsh serialization. Borsh prefixes
//! every string with its length, so two different keys never serialize to the same bytes no matter
//! which characters peer ids or block ids contain.

use std::fmt::{self, Display, Formatter};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    consensus_log::{Phase, Transaction},
    data_types::{BlockId, PeerId, SliceNumber},
};

/// One-shot transitions of a transaction. Claiming a guard key succeeds for exactly one caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum Guard {
    /// The local peer has broadcast its COMMITTED vote.
    CommitBroadcast,
    /// The local peer has finalized the block in the durable store.
    Finalized,
    /// The client has accepted the outcome of the transaction.
    Confirmed,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum CacheKey {
    /// The vote of `peer_id` for `transaction` at `phase`.
    Log {
        transaction: Transaction,
        peer_id: PeerId,
        phase: Phase,
    },
    /// An in-flight data block.
    DataBlock {
        block_id: BlockId,
        slice_number: SliceNumber,
    },
    Guard {
        transaction: Transaction,
        guard: Guard,
    },
    /// The block as stamped by the primary a client submitted it to.
    Submission { transaction: Transaction },
}

impl CacheKey {
    pub fn log(transaction: Transaction, peer_id: PeerId, phase: Phase) -> CacheKey {
        CacheKey::Log {
            transaction,
            peer_id,
            phase,
        }
    }

    pub fn data_block(block_id: BlockId, slice_number: SliceNumber) -> CacheKey {
        CacheKey::DataBlock {
            block_id,
            slice_number,
        }
    }

    pub fn guard(transaction: Transaction, guard: Guard) -> CacheKey {
        CacheKey::Guard { transaction, guard }
    }

    pub fn submission(transaction: Transaction) -> CacheKey {
        CacheKey::Submission { transaction }
    }

    /// The transaction this key belongs to, if it belongs to one.
    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            CacheKey::Log { transaction, .. }
            | CacheKey::Guard { transaction, .. }
            | CacheKey::Submission { transaction } => Some(transaction),
            CacheKey::DataBlock { .. } => None,
        }
    }

    /// The deterministic string form of this key.
    pub fn to_key_string(&self) -> String {
        let bytes = self.try_to_vec().expect("serializing into a Vec<u8> never fails");
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key_string())
    }
}
