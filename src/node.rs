/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and shut down a consensus node.
//!
//! A node runs the three consensus protocols side by side on top of the library user's implementations
//! of the [`DataStore`], [`PeerService`] and [`Transport`] traits.
//!
//! ## Starting a node
//!
//! ```ignore
//! let node =
//!     NodeSpec::builder()
//!     .store(store)
//!     .peers(peers)
//!     .transport(transport)
//!     .configuration(configuration)
//!     .on_finalize(finalize_handler)
//!     .build()
//!     .start();
//! ```
//!
//! The transport hands every envelope it receives to the node's [dispatcher](Node::dispatcher).
//! Client code submits data blocks with [`Node::submit`].
//!
//! ## Shutting down
//!
//! Dropping the [`Node`] stops the event bus and, once the last reference to the dispatcher is gone,
//! drains and joins the receive and dispatch worker pools.

use std::{
    sync::{
        mpsc::{self, Sender},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::{
    cache::CorrelationCache,
    config::Configuration,
    engine::ConsensusEngine,
    errors::ConsensusError,
    event_bus::{start_event_bus, EventHandlers, HandlerPtr},
    events::*,
    networking::{
        messages::{ChainMessage, MessageType, Payload, ProtocolKind, Step},
        network::Transport,
        receiving::{Dispatcher, HandlerRegistry},
        sending::ConsensusAction,
    },
    pluggables::{DataStore, PeerService},
    protocol::{
        self,
        pbft::{FullMesh, PbftProtocol},
        raft::{LeaderStar, RaftProtocol},
        standard::StandardProtocol,
        ConsensusProtocol,
    },
    types::{crypto_primitives::Keypair, data_block::DataBlock, data_types::PeerId},
};

/// Stores all necessary parameters and trait implementations required to run a [`Node`].
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.store(...)`
    - `.peers(...)`
    - `.transport(...)`
    - `.configuration(...)`

    Optional:
    - `.on_receive_consensus(...)`
    - `.on_receive_vote(...)`
    - `.on_reject_message(...)`
    - `.on_equivocation_detected(...)`
    - `.on_preprepare(...)`
    - `.on_vote(...)`
    - `.on_reply(...)`
    - `.on_delivery_attempted(...)`
    - `.on_collect_quorum(...)`
    - `.on_finalize(...)`
    - `.on_confirmed(...)`
"
))]
pub struct NodeSpec<S: DataStore, P: PeerService, N: Transport> {
    // Required parameters
    #[builder(setter(doc = "Set the durable store of data blocks and consensus logs. Required."))]
    store: S,
    #[builder(setter(doc = "Set the peer identity provider. Required."))]
    peers: P,
    #[builder(setter(doc = "Set the message transport. Required."))]
    transport: N,
    #[builder(setter(doc = "Set the [configuration](Configuration) of the node. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveConsensusEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveConsensusEvent>),
    doc = "Register a handler closure to be invoked after the node accepts a data block as primary. Optional."))]
    on_receive_consensus: Option<HandlerPtr<ReceiveConsensusEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveVoteEvent>),
    doc = "Register a handler closure to be invoked after the node accepts a vote from another peer. Optional."))]
    on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RejectMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RejectMessageEvent>),
    doc = "Register a handler closure to be invoked after the node rejects an inbound message. Optional."))]
    on_reject_message: Option<HandlerPtr<RejectMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EquivocationDetectedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EquivocationDetectedEvent>),
    doc = "Register a handler closure to be invoked after the node catches a peer equivocating. Optional."))]
    on_equivocation_detected: Option<HandlerPtr<EquivocationDetectedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PreprepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PreprepareEvent>),
    doc = "Register a handler closure to be invoked after the node, as primary, fans a data block out. Optional."))]
    on_preprepare: Option<HandlerPtr<PreprepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VoteEvent>),
    doc = "Register a handler closure to be invoked after the node casts a vote. Optional."))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReplyEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReplyEvent>),
    doc = "Register a handler closure to be invoked after the node sends a reply. Optional."))]
    on_reply: Option<HandlerPtr<ReplyEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DeliveryAttemptedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DeliveryAttemptedEvent>),
    doc = "Register a handler closure to be invoked after every queued delivery attempt. Optional."))]
    on_delivery_attempted: Option<HandlerPtr<DeliveryAttemptedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CollectQuorumEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CollectQuorumEvent>),
    doc = "Register a handler closure to be invoked after the node observes a quorum. Optional."))]
    on_collect_quorum: Option<HandlerPtr<CollectQuorumEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FinalizeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FinalizeEvent>),
    doc = "Register a handler closure to be invoked after the node applies a consensus outcome to its store. Optional."))]
    on_finalize: Option<HandlerPtr<FinalizeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ConfirmedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ConfirmedEvent>),
    doc = "Register a handler closure to be invoked after the node, as client, accepts the outcome of a transaction. Optional."))]
    on_confirmed: Option<HandlerPtr<ConfirmedEvent>>,
}

impl<S: DataStore, P: PeerService, N: Transport> NodeSpec<S, P, N> {
    /// Starts the worker pools and the event bus, registers the handlers of every protocol, and returns
    /// the handle to them in a [`Node`].
    pub fn start(self) -> Node<S, P, N> {
        let configuration = self.configuration;

        let event_handlers = EventHandlers::new(
            configuration.log_events,
            self.on_receive_consensus,
            self.on_receive_vote,
            self.on_reject_message,
            self.on_equivocation_detected,
            self.on_preprepare,
            self.on_vote,
            self.on_reply,
            self.on_delivery_attempted,
            self.on_collect_quorum,
            self.on_finalize,
            self.on_confirmed,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };
        let event_publisher = Arc::new(EventPublisher::new(event_publisher));

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                (
                    Some(start_event_bus(event_handlers, event_subscriber, shutdown_receiver)),
                    Some(shutdown),
                )
            }
            None => (None, None),
        };

        let transport = Arc::new(self.transport);
        let engine = Arc::new(ConsensusEngine::new(
            Keypair::new(configuration.me.clone()),
            Arc::new(self.store),
            Arc::new(self.peers),
            configuration.peer_selection,
            Arc::clone(&event_publisher),
        ));
        let action = Arc::new(ConsensusAction::new(
            Arc::clone(&transport),
            Arc::clone(&event_publisher),
            configuration.dispatch_workers,
            configuration.dispatch_queue_capacity,
        ));

        let pbft = Arc::new(PbftProtocol::new(
            FullMesh,
            Arc::clone(&engine),
            Arc::clone(&action),
            CorrelationCache::new(configuration.cache_ttl),
            configuration.effective_replica_count(),
        ));
        let raft = Arc::new(RaftProtocol::new(
            LeaderStar,
            Arc::clone(&engine),
            Arc::clone(&action),
            CorrelationCache::new(configuration.cache_ttl),
            configuration.effective_replica_count(),
        ));
        let standard = Arc::new(StandardProtocol::new(
            Arc::clone(&engine),
            Arc::clone(&action),
            CorrelationCache::new(configuration.cache_ttl),
            configuration.min_peer_num,
        ));

        let registry = HandlerRegistry::new();
        protocol::register(&registry, Arc::clone(&pbft));
        protocol::register(&registry, Arc::clone(&raft));
        protocol::register(&registry, Arc::clone(&standard));

        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            transport,
            Arc::clone(&event_publisher),
            configuration.receive_workers,
            configuration.dispatch_queue_capacity,
        ));

        Node {
            engine,
            action,
            dispatcher,
            pbft,
            raft,
            standard,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// A handle to the worker pools and the event bus of a running node. When this value is dropped, the
/// event bus is shut down.
pub struct Node<S: DataStore, P: PeerService, N: Transport> {
    engine: Arc<ConsensusEngine<S, P>>,
    action: Arc<ConsensusAction<N>>,
    dispatcher: Arc<Dispatcher<N>>,
    pbft: Arc<PbftProtocol<S, P, N>>,
    raft: Arc<RaftProtocol<S, P, N>>,
    standard: Arc<StandardProtocol<S, P, N>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<S: DataStore, P: PeerService, N: Transport> Node<S, P, N> {
    /// The entry point of the transport: every inbound envelope goes to
    /// [`Dispatcher::dispatch`].
    pub fn dispatcher(&self) -> Arc<Dispatcher<N>> {
        Arc::clone(&self.dispatcher)
    }

    /// Submit `block` to `primary` under `protocol`, as the block's client.
    ///
    /// Returns the block as stamped by the primary (its primary, sequence id and replica set), or
    /// `None` if the transport does not wait for responses. The outcome of consensus arrives later, as
    /// a [`ConfirmedEvent`], and only for a stamped block the node has checked and bound.
    pub fn submit(
        &self,
        protocol: ProtocolKind,
        primary: &PeerId,
        block: DataBlock,
    ) -> Result<Option<DataBlock>, ConsensusError> {
        let me = self.engine.myself()?;
        let (block_id, slice_number, payload_hash) = (block.block_id.clone(), block.slice_number, block.payload_hash);
        let message = ChainMessage::request(
            me.peer_id,
            primary.clone(),
            primary.clone(),
            MessageType::new(protocol, Step::Consensus),
            Payload::DataBlock(block),
        );

        match self.dispatcher.send(message)? {
            Some(ChainMessage {
                src_peer_id,
                error: Some(reason),
                ..
            }) => Err(ConsensusError::Rejected {
                peer: src_peer_id,
                reason,
            }),
            Some(ChainMessage {
                src_peer_id,
                payload: Some(Payload::DataBlock(stamped)),
                ..
            }) => {
                if stamped.block_id != block_id
                    || stamped.slice_number != slice_number
                    || stamped.payload_hash != payload_hash
                {
                    return Err(ConsensusError::Rejected {
                        peer: src_peer_id,
                        reason: format!("stamped a different block than {}/{}", block_id, slice_number),
                    });
                }
                self.protocol(protocol).submitted(primary, &stamped)?;
                Ok(Some(stamped))
            }
            _ => Ok(None),
        }
    }

    fn protocol(&self, protocol: ProtocolKind) -> &dyn ConsensusProtocol {
        match protocol {
            ProtocolKind::Pbft => &*self.pbft,
            ProtocolKind::Raft => &*self.raft,
            ProtocolKind::Standard => &*self.standard,
        }
    }

    /// The correlation cache of `protocol`.
    pub fn cache(&self, protocol: ProtocolKind) -> &CorrelationCache {
        self.protocol(protocol).cache()
    }

    /// Remove expired entries from every protocol's cache. Returns how many entries were removed.
    pub fn purge_expired(&self) -> usize {
        ProtocolKind::ALL
            .into_iter()
            .map(|protocol| self.cache(protocol).purge_expired())
            .sum()
    }

    /// Block until both worker pools are idle, or until `timeout` passes. Returns whether they became
    /// idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_idle(timeout) && self.action.wait_idle(timeout)
    }
}

impl<S: DataStore, P: PeerService, N: Transport> Drop for Node<S, P, N> {
    fn drop(&mut self) {
        if let Some(shutdown) = self.event_bus_shutdown.take() {
            // The event bus also returns when this sender is dropped.
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::error!("event bus thread panicked");
            }
        }
    }
}
