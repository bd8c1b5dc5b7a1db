use std::{sync::Arc, time::Duration};

use block_consensus::{
    cache::CorrelationCache,
    config::PeerSelection,
    engine::{
        quorum::{client_confirmation_threshold, fault_tolerance, is_quorum, write_quorum},
        selection::{rank, select_replicas, selection_seed},
        ConsensusEngine,
    },
    errors::ConsensusError,
    events::EventPublisher,
    networking::messages::{ChainMessage, MessageType, Payload, ProtocolKind, Step},
    types::{
        consensus_log::Phase,
        crypto_primitives::{Keypair, SigningKey},
        data_block::{BlockStatus, BlockType, DataBlock},
        data_types::{BlockId, CryptoHash, PeerId, SequenceId, SliceNumber, Timestamp},
        peer::Peer,
    },
};
use rand_core::OsRng;

mod common;

use crate::common::{mem_store::MemStore, peers::StaticPeers};

type Engine = ConsensusEngine<MemStore, StaticPeers>;

struct Fixture {
    peers: Vec<(Peer, Keypair)>,
    engines: Vec<(Engine, MemStore, StaticPeers)>,
}

/// `count` engines that all know each other and all take part in replica selection.
fn fixture(count: usize, peer_selection: PeerSelection) -> Fixture {
    let mut csprg = OsRng {};
    let peers: Vec<(Peer, Keypair)> = (0..count)
        .map(|i| {
            let signing_key = SigningKey::generate(&mut csprg);
            let peer = Peer::new(
                PeerId::new(format!("peer-{}", i)),
                format!("/memory/peer-{}", i),
                signing_key.verifying_key().to_bytes(),
            );
            (peer, Keypair::new(signing_key))
        })
        .collect();
    let known: Vec<Peer> = peers.iter().map(|(peer, _)| peer.clone()).collect();
    let candidates: Vec<PeerId> = known.iter().map(|peer| peer.peer_id.clone()).collect();

    let engines = peers
        .iter()
        .map(|(peer, keypair)| {
            let store = MemStore::new();
            let peer_service = StaticPeers::new(peer.clone(), &known, &candidates);
            let engine = ConsensusEngine::new(
                keypair.clone(),
                Arc::new(store.clone()),
                Arc::new(peer_service.clone()),
                peer_selection,
                Arc::new(EventPublisher::disabled()),
            );
            (engine, store, peer_service)
        })
        .collect();

    Fixture { peers, engines }
}

fn signed_block(origin: &(Peer, Keypair), block_id: &str, payload: &[u8]) -> DataBlock {
    DataBlock::new_signed(
        &origin.1,
        origin.0.peer_id.clone(),
        BlockId::new(block_id),
        SliceNumber::new(0),
        payload.len() as u64,
        BlockType::Regular,
        payload.to_vec(),
        Timestamp::new(1_700_000_000_000),
    )
}

/// `block` as stamped by `primary`, with the replica set `replicas`.
fn stamped(mut block: DataBlock, primary: &PeerId, replicas: Vec<PeerId>) -> DataBlock {
    block.primary_peer_id = Some(primary.clone());
    block.primary_sequence_id = SequenceId::new(1);
    block.peer_ids = replicas;
    block
}

#[test]
fn quorum_boundaries_test() {
    assert_eq!(fault_tolerance(4), 1);
    assert!(!is_quorum(2, 4));
    assert!(is_quorum(3, 4));

    assert_eq!(fault_tolerance(3), 1);
    assert!(!is_quorum(2, 3));
    assert!(is_quorum(3, 3));

    assert_eq!(fault_tolerance(7), 2);
    assert!(!is_quorum(4, 7));
    assert!(is_quorum(5, 7));

    assert_eq!(client_confirmation_threshold(4), 2);
    assert_eq!(client_confirmation_threshold(7), 3);

    assert_eq!(write_quorum(2, 5), 3);
    assert_eq!(write_quorum(2, 1), 2);
    assert_eq!(write_quorum(0, 0), 1);
}

#[test]
fn quorum_is_monotonic_test() {
    for replicas in 3..=40 {
        let mut reached = false;
        for votes in 0..=replicas {
            let quorum = is_quorum(votes, replicas);
            assert!(!reached || quorum, "quorum lost at {} of {}", votes, replicas);
            reached = quorum;
        }
        assert!(reached, "no quorum with every vote of {}", replicas);
    }
}

#[test]
fn ranking_is_deterministic_test() {
    let candidates: Vec<PeerId> = (0..10).map(|i| PeerId::new(format!("peer-{}", i))).collect();
    let mut reversed = candidates.clone();
    reversed.reverse();
    let seed = selection_seed(&BlockId::new("block"), Timestamp::new(42));

    for policy in [PeerSelection::Nearest, PeerSelection::Random] {
        let ranked = rank(policy, &seed, &candidates);
        assert_eq!(ranked, rank(policy, &seed, &reversed));
        assert_eq!(ranked.len(), candidates.len());

        let mut sorted = ranked.clone();
        sorted.sort();
        assert_eq!(sorted, candidates);
    }

    let other_seed = selection_seed(&BlockId::new("block"), Timestamp::new(43));
    assert_ne!(seed, other_seed);
}

#[test]
fn replica_set_contains_primary_first_test() {
    let candidates: Vec<PeerId> = (0..10).map(|i| PeerId::new(format!("peer-{}", i))).collect();
    let primary = PeerId::new("peer-7");
    let seed = selection_seed(&BlockId::new("block"), Timestamp::new(42));

    let replicas = select_replicas(PeerSelection::Nearest, &seed, &primary, &candidates, 4);
    assert_eq!(replicas.len(), 4);
    assert_eq!(replicas[0], primary);
    assert_eq!(replicas.iter().filter(|peer_id| **peer_id == primary).count(), 1);

    let everyone = select_replicas(PeerSelection::Random, &seed, &primary, &candidates, 100);
    assert_eq!(everyone.len(), candidates.len());
}

#[test]
fn every_peer_agrees_on_the_replica_set_test() {
    for policy in [PeerSelection::Nearest, PeerSelection::Random] {
        let fixture = fixture(6, policy);
        let primary = fixture.peers[2].0.peer_id.clone();
        let block = stamped(signed_block(&fixture.peers[0], "block", b"payload"), &primary, Vec::new());

        let replica_sets: Vec<Vec<PeerId>> = fixture
            .engines
            .iter()
            .map(|(engine, _, _)| engine.choose_consensus_peer(&block, 4).unwrap())
            .collect();
        assert_eq!(replica_sets[0].len(), 4);
        assert_eq!(replica_sets[0][0], primary);
        assert!(replica_sets.iter().all(|replicas| *replicas == replica_sets[0]));
    }
}

#[test]
fn too_few_candidates_yield_no_replica_set_test() {
    let fixture = fixture(2, PeerSelection::Nearest);
    let (engine, _, _) = &fixture.engines[0];
    let block = signed_block(&fixture.peers[0], "block", b"payload");

    assert!(engine.choose_consensus_peer(&block, 4).unwrap().is_empty());
}

#[test]
fn nearest_peers_exclude_myself_test() {
    let fixture = fixture(5, PeerSelection::Nearest);
    let (engine, _, _) = &fixture.engines[0];
    let me = &fixture.peers[0].0.peer_id;
    let block = signed_block(&fixture.peers[0], "block", b"payload");

    let nearest = engine.choose_nearest_peers(&block, 2).unwrap();
    assert_eq!(nearest.len(), 2);
    assert!(!nearest.contains(me));
    assert_eq!(engine.choose_nearest_peers(&block, 10).unwrap().len(), 4);
}

#[test]
fn cache_keys_are_deterministic_test() {
    let fixture = fixture(3, PeerSelection::Nearest);
    let (engine_a, _, _) = &fixture.engines[0];
    let (engine_b, _, _) = &fixture.engines[1];
    let me = &fixture.peers[0].0;
    let primary = me.peer_id.clone();
    let block = stamped(signed_block(&fixture.peers[0], "block", b"payload"), &primary, vec![primary.clone()]);

    let vote = engine_a.create_consensus_log(&block, me, Phase::Prepared).unwrap();
    assert_eq!(engine_a.get_log_cache_key(&vote), engine_b.get_log_cache_key(&vote));
    assert_eq!(
        engine_a
            .get_data_block_cache_key(&block.block_id, block.slice_number)
            .to_key_string(),
        engine_b
            .get_data_block_cache_key(&block.block_id, block.slice_number)
            .to_key_string()
    );
}

#[test]
fn data_block_checks_test() {
    let fixture = fixture(3, PeerSelection::Nearest);
    let (engine, _, peer_service) = &fixture.engines[1];
    let block = signed_block(&fixture.peers[0], "block", b"payload");
    engine.verify_data_block(&block).unwrap();

    let mut tampered = block.clone();
    tampered.transport_payload = b"other payload".to_vec();
    assert!(matches!(
        engine.verify_data_block(&tampered),
        Err(ConsensusError::PayloadHashMismatch(_))
    ));

    // Signed by peer-2, claiming to come from peer-0.
    let mut forged = signed_block(&fixture.peers[2], "block", b"payload");
    forged.peer_id = fixture.peers[0].0.peer_id.clone();
    assert!(matches!(
        engine.verify_data_block(&forged),
        Err(ConsensusError::InvalidSignature(_))
    ));
    assert_eq!(peer_service.penalties().len(), 1);

    let mut unknown = block;
    unknown.peer_id = PeerId::new("stranger");
    assert!(matches!(
        engine.verify_data_block(&unknown),
        Err(ConsensusError::UnknownPeer(_))
    ));
}

#[test]
fn votes_are_verified_against_the_known_key_test() {
    let fixture = fixture(3, PeerSelection::Nearest);
    let (engine_a, _, _) = &fixture.engines[0];
    let (engine_b, _, _) = &fixture.engines[1];
    let me = &fixture.peers[0].0;
    let block = stamped(
        signed_block(&fixture.peers[0], "block", b"payload"),
        &me.peer_id,
        vec![me.peer_id.clone()],
    );

    let vote = engine_a.create_consensus_log(&block, me, Phase::Prepared).unwrap();
    engine_b.verify_vote(&vote).unwrap();

    let mut promoted = vote.clone();
    promoted.status = Phase::Committed;
    assert!(matches!(engine_b.verify_vote(&promoted), Err(ConsensusError::InvalidSignature(_))));

    // Signed by peer-2 in the name of peer-0, with peer-2's key embedded.
    let (impostor_engine, _, _) = &fixture.engines[2];
    let spoofed = impostor_engine.derive_consensus_log(&vote, me, Phase::Prepared);
    assert_eq!(spoofed.public_key, fixture.peers[2].1.public().to_bytes());
    assert!(matches!(engine_b.verify_vote(&spoofed), Err(ConsensusError::InvalidSignature(_))));
}

#[test]
fn record_vote_detects_equivocation_test() {
    let fixture = fixture(3, PeerSelection::Nearest);
    let (engine, _, peer_service) = &fixture.engines[1];
    let voter = &fixture.peers[0].0;
    let cache = CorrelationCache::new(Duration::ZERO);
    let block = stamped(
        signed_block(&fixture.peers[0], "block", b"payload"),
        &voter.peer_id,
        vec![voter.peer_id.clone()],
    );

    let first = fixture.engines[0].0.create_consensus_log(&block, voter, Phase::Prepared).unwrap();
    assert!(engine.record_vote(&cache, ProtocolKind::Pbft, &first).unwrap());
    assert!(!engine.record_vote(&cache, ProtocolKind::Pbft, &first).unwrap());

    let mut conflicting = first.clone();
    conflicting.payload_hash = CryptoHash::new([9u8; 32]);
    assert!(matches!(
        engine.record_vote(&cache, ProtocolKind::Pbft, &conflicting),
        Err(ConsensusError::EquivocationDetected { .. })
    ));

    let kept = engine
        .cached_vote(&cache, &first.transaction(), &voter.peer_id, Phase::Prepared)
        .unwrap();
    assert_eq!(kept.payload_hash, first.payload_hash);
    assert_eq!(peer_service.penalties().len(), 1);
}

#[test]
fn count_votes_starts_from_my_own_test() {
    let fixture = fixture(4, PeerSelection::Nearest);
    let (engine, _, _) = &fixture.engines[0];
    let replicas: Vec<PeerId> = fixture.peers.iter().map(|(peer, _)| peer.peer_id.clone()).collect();
    let me = &fixture.peers[0].0;
    let cache = CorrelationCache::new(Duration::ZERO);
    let block = stamped(signed_block(&fixture.peers[0], "block", b"payload"), &me.peer_id, replicas.clone());
    let transaction = block.transaction().unwrap();

    let count = || {
        engine.count_votes(&cache, &transaction, &replicas, &me.peer_id, Phase::Prepared, &block.payload_hash)
    };
    assert_eq!(count(), 1);

    let vote = fixture.engines[1]
        .0
        .create_consensus_log(&block, &fixture.peers[1].0, Phase::Prepared)
        .unwrap();
    engine.record_vote(&cache, ProtocolKind::Pbft, &vote).unwrap();
    assert_eq!(count(), 2);

    // A vote for another payload does not count.
    let mut other = block.clone();
    other.payload_hash = CryptoHash::new([7u8; 32]);
    let mismatched = fixture.engines[2]
        .0
        .create_consensus_log(&other, &fixture.peers[2].0, Phase::Prepared)
        .unwrap();
    engine.record_vote(&cache, ProtocolKind::Pbft, &mismatched).unwrap();
    assert_eq!(count(), 2);
}

#[test]
fn finalize_block_test() {
    let fixture = fixture(3, PeerSelection::Nearest);
    let (engine, store, _) = &fixture.engines[0];
    let block = signed_block(&fixture.peers[0], "block", b"payload");

    engine.store_draft(&block).unwrap();
    assert_eq!(store.status(&block.block_id, block.slice_number), Some(BlockStatus::Draft));
    engine.finalize_block(&block).unwrap();
    assert_eq!(store.status(&block.block_id, block.slice_number), Some(BlockStatus::Effective));

    let never_drafted = signed_block(&fixture.peers[0], "other", b"payload");
    engine.finalize_block(&never_drafted).unwrap();
    assert_eq!(
        store.status(&never_drafted.block_id, never_drafted.slice_number),
        Some(BlockStatus::Effective)
    );

    let tombstone = signed_block(&fixture.peers[0], "block", b"");
    engine.finalize_block(&tombstone).unwrap();
    assert_eq!(store.block(&block.block_id, block.slice_number), None);

    store.fail_writes();
    assert!(matches!(
        engine.finalize_block(&block),
        Err(ConsensusError::PersistenceFailure(_))
    ));
}

#[test]
fn sequence_ids_start_at_one_test() {
    let fixture = fixture(3, PeerSelection::Nearest);
    let (engine, _, _) = &fixture.engines[0];
    assert_eq!(engine.next_sequence_id(), SequenceId::new(1));
    assert_eq!(engine.next_sequence_id(), SequenceId::new(2));
}

#[test]
fn unresolved_identity_test() {
    let fixture = fixture(3, PeerSelection::Nearest);
    let (engine, _, peer_service) = &fixture.engines[0];
    peer_service.forget_myself();
    assert!(matches!(engine.myself(), Err(ConsensusError::IdentityUnavailable)));
}

#[test]
fn payload_extraction_test() {
    let fixture = fixture(3, PeerSelection::Nearest);
    let (engine, _, _) = &fixture.engines[0];
    let block = signed_block(&fixture.peers[0], "block", b"payload");
    let message = ChainMessage::request(
        PeerId::new("peer-1"),
        PeerId::new("peer-0"),
        PeerId::new("peer-0"),
        MessageType::new(ProtocolKind::Pbft, Step::Consensus),
        Payload::DataBlock(block.clone()),
    );

    assert_eq!(engine.get_data_block(&message).unwrap(), block);
    assert!(matches!(engine.get_consensus_log(&message), Err(ConsensusError::DecodeError(_))));

    let decoded = ChainMessage::decode(&message.encode()).unwrap();
    assert_eq!(decoded, message);
    assert!(ChainMessage::decode(&[1, 2, 3]).is_err());
}
