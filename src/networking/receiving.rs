//! Functions and types for handling messages received from the P2P network.
//!
//! The [`Transport`] hands every inbound envelope to [`Dispatcher::dispatch`]. The dispatcher looks up
//! the [`MessageHandler`] registered for the envelope's [`MessageType`] and runs it as an independent
//! job on the receive worker pool, so envelopes are handled concurrently and in no particular order.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, SystemTime},
};

use crate::{
    errors::ConsensusError,
    events::{Event, EventPublisher, RejectMessageEvent},
    sync,
};

use super::{
    messages::{ChainMessage, MessageType, Payload},
    network::Transport,
    worker_pool::{PoolError, WorkerPool},
};

/// The three callbacks registered for one [`MessageType`].
pub trait MessageHandler: Send + Sync + 'static {
    /// Check an envelope of this type that the local peer originates, before it is delivered.
    fn send(&self, _message: &ChainMessage) -> Result<(), ConsensusError> {
        Ok(())
    }

    /// Handle an inbound request. A returned payload is sent back to the requester in the response.
    fn receive(&self, message: &ChainMessage) -> Result<Option<Payload>, ConsensusError>;

    /// Handle the response to a request the local peer sent.
    fn response(&self, message: &ChainMessage) {
        log_response(message)
    }
}

/// Log the outcome carried by a response.
pub fn log_response(message: &ChainMessage) {
    match &message.error {
        Some(error) => log::warn!(
            "{} rejected by {}: {}",
            message.message_type,
            message.src_peer_id,
            error
        ),
        None => log::debug!("{} acknowledged by {}", message.message_type, message.src_peer_id),
    }
}

/// The handlers of a node, keyed by message type.
#[derive(Clone, Default)]
pub struct HandlerRegistry(Arc<RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>>);

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Register `handler` for `message_type`, replacing any handler registered before.
    pub fn register(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.write().insert(message_type, handler);
    }

    pub fn get(&self, message_type: &MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.read().get(message_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<MessageType, Arc<dyn MessageHandler>>> {
        sync::read(&self.0)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<MessageType, Arc<dyn MessageHandler>>> {
        sync::write(&self.0)
    }
}

pub struct Dispatcher<N: Transport> {
    receive_pool: WorkerPool,
    registry: HandlerRegistry,
    transport: Arc<N>,
    event_publisher: Arc<EventPublisher>,
}

impl<N: Transport> Dispatcher<N> {
    pub(crate) fn new(
        registry: HandlerRegistry,
        transport: Arc<N>,
        event_publisher: Arc<EventPublisher>,
        workers: usize,
        capacity: usize,
    ) -> Dispatcher<N> {
        Dispatcher {
            receive_pool: WorkerPool::new("receive pool", workers, capacity),
            registry,
            transport,
            event_publisher,
        }
    }

    /// Queue `message` for handling on the receive pool. Returns without waiting for the handler.
    pub fn dispatch(&self, message: ChainMessage) -> Result<(), PoolError> {
        let registry = self.registry.clone();
        let transport = Arc::clone(&self.transport);
        let event_publisher = Arc::clone(&self.event_publisher);
        self.receive_pool
            .execute(move || handle_message(&registry, transport.as_ref(), &event_publisher, message))
    }

    /// Decode wire bytes and queue the envelope for handling.
    pub fn dispatch_bytes(&self, bytes: &[u8]) -> Result<(), ConsensusError> {
        let message = ChainMessage::decode(bytes)?;
        Ok(self.dispatch(message)?)
    }

    /// Handle `message` on the calling thread. A response, if any, goes out through
    /// [`Transport::response`].
    pub fn handle(&self, message: ChainMessage) {
        handle_message(&self.registry, self.transport.as_ref(), &self.event_publisher, message)
    }

    /// Handle an inbound request on the calling thread and return its response to the caller instead of
    /// sending it. For transports that carry the response on the connection the request came in on.
    pub fn respond(&self, message: ChainMessage) -> Option<ChainMessage> {
        process(&self.registry, &self.event_publisher, message)
    }

    /// Deliver a request the local peer originates. If the local peer is the target, the request is
    /// handled on the calling thread; otherwise it goes straight to the target and the target's
    /// response, if the transport returns one, is passed back.
    pub fn send(&self, message: ChainMessage) -> Result<Option<ChainMessage>, ConsensusError> {
        let handler = self
            .registry
            .get(&message.message_type)
            .ok_or_else(|| ConsensusError::UnregisteredMessageType(message.message_type.name()))?;
        handler.send(&message)?;

        if message.src_peer_id == message.target_peer_id {
            let payload = handler.receive(&message)?;
            return Ok(Some(message.response(message.target_peer_id.clone(), payload)));
        }
        Ok(self.transport.direct_send(message)?)
    }

    /// Block until every queued inbound envelope is handled, or until `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.receive_pool.wait_idle(timeout)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}

fn handle_message<N: Transport>(
    registry: &HandlerRegistry,
    transport: &N,
    event_publisher: &EventPublisher,
    message: ChainMessage,
) {
    let Some(response) = process(registry, event_publisher, message) else {
        return;
    };
    let message_type = response.message_type;
    let target = response.target_peer_id.clone();
    if let Err(error) = transport.response(response) {
        log::warn!("failed to respond to {} from {}: {}", message_type, target, error);
    }
}

/// Run the handler of `message`. Returns the response owed to the requester, if `message` is a request
/// that produced a payload or failed.
fn process(registry: &HandlerRegistry, event_publisher: &EventPublisher, message: ChainMessage) -> Option<ChainMessage> {
    let Some(handler) = registry.get(&message.message_type) else {
        let error = ConsensusError::UnregisteredMessageType(message.message_type.name());
        return reject(event_publisher, &message, error);
    };

    if !message.is_request() {
        handler.response(&message);
        return None;
    }

    match handler.receive(&message) {
        Ok(None) => None,
        Ok(Some(payload)) => Some(message.response(message.target_peer_id.clone(), Some(payload))),
        Err(error) => reject(event_publisher, &message, error),
    }
}

fn reject(event_publisher: &EventPublisher, message: &ChainMessage, error: ConsensusError) -> Option<ChainMessage> {
    let reason = error.to_string();
    event_publisher.publish(Event::RejectMessage(RejectMessageEvent {
        timestamp: SystemTime::now(),
        message_type: message.message_type,
        origin: message.src_peer_id.clone(),
        reason: reason.clone(),
    }));

    if message.is_request() {
        Some(message.error_response(message.target_peer_id.clone(), reason))
    } else {
        log::warn!("dropped {} response from {}: {}", message.message_type, message.src_peer_id, reason);
        None
    }
}
