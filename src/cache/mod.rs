/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The correlation cache: an in-process map from [`CacheKey`]s to the votes, in-flight blocks and
//! one-shot guards of running transactions.
//!
//! Every protocol instance owns its own `CorrelationCache`, so the keys of different protocols never
//! meet. A single cache is shared by all the worker threads that handle that protocol's messages, and
//! every operation below takes the cache's lock exactly once, which makes each of them linearizable.
//! In particular [`set_default`](CorrelationCache::set_default) is the insert-if-absent primitive that
//! the protocols use to make a transition happen at most once.
//!
//! ## Expiry
//!
//! With a zero TTL, entries live until they are deleted or the cache is dropped. With a non-zero TTL,
//! an entry older than the TTL behaves as if it were absent and is removed lazily.

pub mod key;

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

pub use key::{CacheKey, Guard};

use crate::{
    sync::lock,
    types::{consensus_log::{ConsensusLog, Transaction}, data_block::DataBlock},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheRecord {
    Log(ConsensusLog),
    DataBlock(DataBlock),
    /// Value of a claimed [`Guard`] key.
    Marker,
}

impl CacheRecord {
    pub fn as_log(&self) -> Option<&ConsensusLog> {
        match self {
            CacheRecord::Log(log) => Some(log),
            _ => None,
        }
    }

    pub fn into_data_block(self) -> Option<DataBlock> {
        match self {
            CacheRecord::DataBlock(block) => Some(block),
            _ => None,
        }
    }
}

/// Outcome of [`CorrelationCache::set_default`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetDefault {
    /// The key was absent and now maps to the given record.
    Inserted,
    /// The key was present; the cache is unchanged and this is the record it holds.
    Existing(CacheRecord),
}

impl SetDefault {
    pub fn is_inserted(&self) -> bool {
        matches!(self, SetDefault::Inserted)
    }
}

struct Entry {
    record: CacheRecord,
    inserted_at: Instant,
}

pub struct CorrelationCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    ttl: Duration,
}

impl CorrelationCache {
    /// Create an empty cache. A zero `ttl` keeps entries until they are deleted.
    pub fn new(ttl: Duration) -> CorrelationCache {
        CorrelationCache {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheRecord> {
        let mut entries = lock(&self.entries);
        let expired = self.is_expired(entries.get(key)?);
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.record.clone())
    }

    /// Insert `record` under `key` only if `key` is absent (or expired).
    pub fn set_default(&self, key: CacheKey, record: CacheRecord) -> SetDefault {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get(&key) {
            if !self.is_expired(entry) {
                return SetDefault::Existing(entry.record.clone());
            }
        }
        entries.insert(
            key,
            Entry {
                record,
                inserted_at: Instant::now(),
            },
        );
        SetDefault::Inserted
    }

    /// Insert `record` under `key`, replacing whatever it mapped to.
    pub fn set(&self, key: CacheKey, record: CacheRecord) {
        lock(&self.entries).insert(
            key,
            Entry {
                record,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Claim a one-shot guard. Returns true for exactly one caller per key.
    pub fn claim(&self, key: CacheKey) -> bool {
        self.set_default(key, CacheRecord::Marker).is_inserted()
    }

    /// Remove `key`, returning what it mapped to. Two concurrent deletes of the same key never both
    /// return `Some`.
    pub fn delete(&self, key: &CacheKey) -> Option<CacheRecord> {
        let mut entries = lock(&self.entries);
        let entry = entries.remove(key)?;
        if self.is_expired(&entry) {
            None
        } else {
            Some(entry.record)
        }
    }

    /// Remove `key` only if the record it maps to satisfies `predicate`. Like [`delete`](Self::delete),
    /// at most one of several concurrent callers gets `Some`.
    pub fn delete_if(&self, key: &CacheKey, predicate: impl FnOnce(&CacheRecord) -> bool) -> Option<CacheRecord> {
        let mut entries = lock(&self.entries);
        let expired = self.is_expired(entries.get(key)?);
        if expired {
            entries.remove(key);
            return None;
        }
        let matches = entries.get(key).map_or(false, |entry| predicate(&entry.record));
        if matches {
            entries.remove(key).map(|entry| entry.record)
        } else {
            None
        }
    }

    /// Remove every vote and guard of `transaction`. Returns how many entries were removed.
    pub fn delete_transaction(&self, transaction: &Transaction) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|key, _| key.transaction() != Some(transaction));
        before - entries.len()
    }

    /// Remove every expired entry. Returns how many entries were removed.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let mut entries = lock(&self.entries);
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        !self.ttl.is_zero() && entry.inserted_at.elapsed() >= self.ttl
    }
}
