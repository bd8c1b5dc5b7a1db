use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use block_consensus::{
    config::Configuration,
    events::{ConfirmedEvent, EquivocationDetectedEvent, FinalizeEvent, RejectMessageEvent, ReplyEvent},
    networking::{
        messages::{ChainMessage, MessageType, ProtocolKind, Step},
        receiving::Dispatcher,
    },
    node::{Node, NodeSpec},
    types::{
        consensus_log::Transaction,
        crypto_primitives::{Keypair, SigningKey},
        data_block::{BlockType, DataBlock},
        data_types::{BlockId, PeerId, SliceNumber, Timestamp},
        peer::Peer,
    },
};
use rand_core::OsRng;

use super::{logging::wait_until, mem_store::MemStore, network::NetworkStub, peers::StaticPeers};

/// How long tests wait for a cluster to reach an expected state.
pub(crate) const TIMEOUT: Duration = Duration::from_secs(10);

/// What a node's event handlers observed.
#[derive(Clone, Default)]
pub(crate) struct Observed {
    pub(crate) finalized: Arc<Mutex<Vec<(ProtocolKind, Transaction, bool)>>>,
    pub(crate) confirmed: Arc<Mutex<Vec<(ProtocolKind, Transaction, usize)>>>,
    pub(crate) rejected: Arc<Mutex<Vec<(MessageType, PeerId, String)>>>,
    pub(crate) equivocations: Arc<Mutex<Vec<PeerId>>>,
    pub(crate) replies: Arc<Mutex<Vec<(ProtocolKind, PeerId)>>>,
}

impl Observed {
    pub(crate) fn finalized(&self, protocol: ProtocolKind) -> usize {
        self.finalized
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _, _)| *kind == protocol)
            .count()
    }

    pub(crate) fn confirmed(&self, protocol: ProtocolKind) -> usize {
        self.confirmed
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _, _)| *kind == protocol)
            .count()
    }

    pub(crate) fn rejections(&self) -> Vec<String> {
        self.rejected
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, reason)| reason.clone())
            .collect()
    }
}

/// One running node of a test cluster, with handles to its pluggables.
pub(crate) struct TestNode {
    pub(crate) peer: Peer,
    pub(crate) keypair: Keypair,
    pub(crate) store: MemStore,
    pub(crate) peers: StaticPeers,
    pub(crate) observed: Observed,
    pub(crate) node: Node<MemStore, StaticPeers, NetworkStub>,
}

impl TestNode {
    pub(crate) fn peer_id(&self) -> &PeerId {
        &self.peer.peer_id
    }

    pub(crate) fn dispatcher(&self) -> Arc<Dispatcher<NetworkStub>> {
        self.node.dispatcher()
    }

    /// A regular data block originating from this node, signed with its key.
    pub(crate) fn block(&self, block_id: &str, payload: &[u8]) -> DataBlock {
        self.block_of_type(block_id, payload, BlockType::Regular)
    }

    pub(crate) fn block_of_type(&self, block_id: &str, payload: &[u8], block_type: BlockType) -> DataBlock {
        DataBlock::new_signed(
            &self.keypair,
            self.peer.peer_id.clone(),
            BlockId::new(block_id),
            SliceNumber::new(0),
            payload.len() as u64,
            block_type,
            payload.to_vec(),
            Timestamp::new(1_700_000_000_000),
        )
    }

    pub(crate) fn submit(&self, protocol: ProtocolKind, primary: &PeerId, block: DataBlock) -> DataBlock {
        self.node
            .submit(protocol, primary, block)
            .expect("submission accepted")
            .expect("network stub returns responses")
    }

    /// A request envelope from this node, as another peer would receive it.
    pub(crate) fn envelope(
        &self,
        target: &PeerId,
        protocol: ProtocolKind,
        step: Step,
        payload: impl Into<block_consensus::networking::messages::Payload>,
    ) -> ChainMessage {
        ChainMessage::request(
            self.peer.peer_id.clone(),
            target.clone(),
            target.clone(),
            MessageType::new(protocol, step),
            payload.into(),
        )
    }
}

/// A set of nodes connected by one [`NetworkStub`]: `replicas` candidate peers named `peer-0`,
/// `peer-1`, ... and one `client` that every node knows but that is never a candidate.
pub(crate) struct Cluster {
    pub(crate) network: NetworkStub,
    pub(crate) nodes: Vec<TestNode>,
    pub(crate) client: TestNode,
}

impl Cluster {
    pub(crate) fn start(replicas: usize, min_peer_num: usize) -> Cluster {
        let network = NetworkStub::new();
        let mut csprg = OsRng {};

        let identities: Vec<(Peer, SigningKey)> = (0..replicas)
            .map(|i| format!("peer-{}", i))
            .chain(std::iter::once("client".to_string()))
            .map(|name| {
                let signing_key = SigningKey::generate(&mut csprg);
                let peer = Peer::new(
                    PeerId::new(name.as_str()),
                    format!("/memory/{}", name),
                    signing_key.verifying_key().to_bytes(),
                );
                (peer, signing_key)
            })
            .collect();
        let known: Vec<Peer> = identities.iter().map(|(peer, _)| peer.clone()).collect();
        let candidates: Vec<PeerId> = known[..replicas].iter().map(|peer| peer.peer_id.clone()).collect();

        let mut nodes: Vec<TestNode> = identities
            .into_iter()
            .map(|(peer, signing_key)| {
                let peers = StaticPeers::new(peer.clone(), &known, &candidates);
                start_node(peer, signing_key, peers, network.clone(), min_peer_num)
            })
            .collect();
        let client = nodes.pop().expect("the client is the last identity");

        Cluster {
            network,
            nodes,
            client,
        }
    }

    pub(crate) fn node(&self, peer_id: &PeerId) -> &TestNode {
        self.nodes
            .iter()
            .chain(std::iter::once(&self.client))
            .find(|node| node.peer_id() == peer_id)
            .expect("peer is part of the cluster")
    }

    /// Wait until every node of the cluster has handled and sent everything it queued.
    pub(crate) fn settle(&self) {
        let all_idle = || {
            self.nodes
                .iter()
                .chain(std::iter::once(&self.client))
                .all(|node| node.node.wait_idle(Duration::from_millis(50)))
        };
        // Handling on one node can queue work on another, so idle has to hold twice in a row.
        assert!(wait_until(TIMEOUT, || all_idle() && all_idle()));
    }
}

fn start_node(
    peer: Peer,
    signing_key: SigningKey,
    peers: StaticPeers,
    network: NetworkStub,
    min_peer_num: usize,
) -> TestNode {
    let store = MemStore::new();
    let observed = Observed::default();
    let keypair = Keypair::new(signing_key.clone());

    let configuration = Configuration::builder()
        .me(signing_key)
        .replica_count(4)
        .min_peer_num(min_peer_num)
        .log_events(true)
        .build();

    let node = NodeSpec::builder()
        .store(store.clone())
        .peers(peers.clone())
        .transport(network.clone())
        .configuration(configuration)
        .on_finalize(finalize_handler(observed.clone()))
        .on_confirmed(confirmed_handler(observed.clone()))
        .on_reject_message(reject_message_handler(observed.clone()))
        .on_equivocation_detected(equivocation_detected_handler(observed.clone()))
        .on_reply(reply_handler(observed.clone()))
        .build()
        .start();
    network.attach(peer.peer_id.clone(), &node.dispatcher());

    TestNode {
        peer,
        keypair,
        store,
        peers,
        observed,
        node,
    }
}

fn finalize_handler(observed: Observed) -> impl Fn(&FinalizeEvent) + Send + 'static {
    move |event| {
        observed
            .finalized
            .lock()
            .unwrap()
            .push((event.protocol, event.transaction.clone(), event.tombstone))
    }
}

fn confirmed_handler(observed: Observed) -> impl Fn(&ConfirmedEvent) + Send + 'static {
    move |event| {
        observed
            .confirmed
            .lock()
            .unwrap()
            .push((event.protocol, event.transaction.clone(), event.replies))
    }
}

fn reject_message_handler(observed: Observed) -> impl Fn(&RejectMessageEvent) + Send + 'static {
    move |event| {
        observed
            .rejected
            .lock()
            .unwrap()
            .push((event.message_type, event.origin.clone(), event.reason.clone()))
    }
}

fn equivocation_detected_handler(observed: Observed) -> impl Fn(&EquivocationDetectedEvent) + Send + 'static {
    move |event| observed.equivocations.lock().unwrap().push(event.peer.clone())
}

fn reply_handler(observed: Observed) -> impl Fn(&ReplyEvent) + Send + 'static {
    move |event| {
        observed
            .replies
            .lock()
            .unwrap()
            .push((event.protocol, event.recipient.clone()))
    }
}
