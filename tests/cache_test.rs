use std::{
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use block_consensus::{
    cache::{CacheKey, CacheRecord, CorrelationCache, Guard, SetDefault},
    types::{
        consensus_log::{ConsensusLog, Phase, Transaction},
        data_types::{BlockId, CryptoHash, PeerId, SequenceId, SignatureBytes, SliceNumber, Timestamp},
    },
};

fn transaction(sequence_id: u64) -> Transaction {
    Transaction {
        primary_peer_id: PeerId::new("peer-0"),
        block_id: BlockId::new("block"),
        slice_number: SliceNumber::new(0),
        primary_sequence_id: SequenceId::new(sequence_id),
    }
}

fn vote(transaction: &Transaction, voter: &str, payload_hash: [u8; 32]) -> ConsensusLog {
    ConsensusLog {
        primary_peer_id: transaction.primary_peer_id.clone(),
        block_id: transaction.block_id.clone(),
        slice_number: transaction.slice_number,
        primary_sequence_id: transaction.primary_sequence_id,
        peer_id: PeerId::new(voter),
        status: Phase::Prepared,
        payload_hash: CryptoHash::new(payload_hash),
        peer_ids: vec![PeerId::new("peer-0"), PeerId::new(voter)],
        client_peer_id: PeerId::new("client"),
        client_address: String::new(),
        public_key: [0u8; 32],
        create_timestamp: Timestamp::new(0),
        signature: SignatureBytes::empty(),
    }
}

#[test]
fn set_default_keeps_the_first_record_test() {
    let cache = CorrelationCache::new(Duration::ZERO);
    let transaction = transaction(1);
    let key = CacheKey::log(transaction.clone(), PeerId::new("peer-1"), Phase::Prepared);
    let first = vote(&transaction, "peer-1", [1u8; 32]);
    let second = vote(&transaction, "peer-1", [2u8; 32]);

    assert_eq!(cache.set_default(key.clone(), CacheRecord::Log(first.clone())), SetDefault::Inserted);
    assert_eq!(
        cache.set_default(key.clone(), CacheRecord::Log(second)),
        SetDefault::Existing(CacheRecord::Log(first.clone()))
    );
    assert_eq!(cache.get(&key), Some(CacheRecord::Log(first)));
    assert_eq!(cache.len(), 1);
}

#[test]
fn claim_succeeds_for_exactly_one_thread_test() {
    let cache = Arc::new(CorrelationCache::new(Duration::ZERO));
    let barrier = Arc::new(Barrier::new(8));
    let key = CacheKey::guard(transaction(1), Guard::Finalized);

    let winners: usize = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            thread::spawn(move || {
                barrier.wait();
                cache.claim(key)
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap() as usize)
        .sum();

    assert_eq!(winners, 1);
}

#[test]
fn delete_if_takes_a_matching_record_once_test() {
    let cache = CorrelationCache::new(Duration::ZERO);
    let key = CacheKey::data_block(BlockId::new("block"), SliceNumber::new(0));
    cache.set(key.clone(), CacheRecord::Marker);

    assert_eq!(cache.delete_if(&key, |record| matches!(record, CacheRecord::Log(_))), None);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.delete_if(&key, |record| *record == CacheRecord::Marker), Some(CacheRecord::Marker));
    assert_eq!(cache.delete_if(&key, |_| true), None);
    assert!(cache.is_empty());
}

#[test]
fn delete_transaction_leaves_other_transactions_test() {
    let cache = CorrelationCache::new(Duration::ZERO);
    let first = transaction(1);
    let second = transaction(2);

    for transaction in [&first, &second] {
        let log = vote(transaction, "peer-1", [1u8; 32]);
        cache.set_default(
            CacheKey::log(transaction.clone(), log.peer_id.clone(), log.status),
            CacheRecord::Log(log),
        );
        cache.claim(CacheKey::guard(transaction.clone(), Guard::CommitBroadcast));
    }
    let block_key = CacheKey::data_block(BlockId::new("block"), SliceNumber::new(0));
    cache.set(block_key.clone(), CacheRecord::Marker);

    assert_eq!(cache.delete_transaction(&first), 2);
    assert_eq!(cache.len(), 3);
    assert!(cache.get(&block_key).is_some());
    assert!(!cache.claim(CacheKey::guard(second, Guard::CommitBroadcast)));
    assert!(cache.claim(CacheKey::guard(first, Guard::CommitBroadcast)));
}

#[test]
fn expired_entries_behave_as_absent_test() {
    let cache = CorrelationCache::new(Duration::from_millis(20));
    let key = CacheKey::guard(transaction(1), Guard::Confirmed);
    assert!(cache.claim(key.clone()));
    assert!(!cache.claim(key.clone()));

    thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get(&key), None);
    assert!(cache.claim(key.clone()));

    thread::sleep(Duration::from_millis(40));
    cache.claim(CacheKey::guard(transaction(2), Guard::Confirmed));
    assert_eq!(cache.purge_expired(), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn zero_ttl_never_expires_test() {
    let cache = CorrelationCache::new(Duration::ZERO);
    cache.claim(CacheKey::guard(transaction(1), Guard::Confirmed));
    thread::sleep(Duration::from_millis(10));
    assert_eq!(cache.purge_expired(), 0);
    assert_eq!(cache.len(), 1);
}

#[test]
fn key_strings_do_not_collide_on_separators_test() {
    let a = CacheKey::data_block(BlockId::new("a:b"), SliceNumber::new(1));
    let b = CacheKey::data_block(BlockId::new("a"), SliceNumber::new(1));
    let log_a = CacheKey::log(transaction(1), PeerId::new("x,y"), Phase::Reply);
    let log_b = CacheKey::log(transaction(1), PeerId::new("x"), Phase::Reply);

    assert_ne!(a.to_key_string(), b.to_key_string());
    assert_ne!(log_a.to_key_string(), log_b.to_key_string());
    assert_eq!(a.to_key_string(), a.clone().to_key_string());
}
