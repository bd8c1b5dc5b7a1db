/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for sending messages to the P2P network.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::{
    events::{DeliveryAttemptedEvent, Event, EventPublisher},
    types::data_types::PeerId,
};

use super::{
    messages::{ChainMessage, MessageType, Payload},
    network::Transport,
    worker_pool::WorkerPool,
};

/// How an envelope reaches its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Peer to peer, through [`Transport::direct_send`].
    Direct,
    /// Through the transport's routing, [`Transport::send`].
    Routed,
}

/// Builds [`ChainMessage`] envelopes and delivers them.
///
/// Deliveries queued with [`dispatch`](Self::dispatch) run on a bounded pool of dispatch threads and
/// are never awaited by the caller. Each of them publishes a [`DeliveryAttemptedEvent`], including the
/// ones that could not be queued because the pool was full.
pub struct ConsensusAction<N: Transport> {
    transport: Arc<N>,
    dispatch_pool: WorkerPool,
    event_publisher: Arc<EventPublisher>,
}

impl<N: Transport> ConsensusAction<N> {
    pub(crate) fn new(
        transport: Arc<N>,
        event_publisher: Arc<EventPublisher>,
        workers: usize,
        capacity: usize,
    ) -> ConsensusAction<N> {
        ConsensusAction {
            transport,
            dispatch_pool: WorkerPool::new("dispatch pool", workers, capacity),
            event_publisher,
        }
    }

    /// Wrap `payload` into a request envelope from `src` to `target`.
    pub fn envelope(
        &self,
        src: &PeerId,
        target: &PeerId,
        message_type: MessageType,
        payload: impl Into<Payload>,
    ) -> ChainMessage {
        ChainMessage::request(src.clone(), target.clone(), target.clone(), message_type, payload.into())
    }

    /// Queue `message` for delivery and return immediately.
    pub fn dispatch(&self, message: ChainMessage, route: Route) {
        let message_type = message.message_type;
        let target = message.target_peer_id.clone();
        let transport = Arc::clone(&self.transport);
        let event_publisher = Arc::clone(&self.event_publisher);

        let queued = self.dispatch_pool.execute(move || {
            let message_type = message.message_type;
            let target = message.target_peer_id.clone();
            let result = deliver(transport.as_ref(), message, route);
            if let Err(error) = &result {
                log::debug!("delivery of {} to {} failed: {}", message_type, target, error);
            }
            event_publisher.publish(Event::DeliveryAttempted(DeliveryAttemptedEvent {
                timestamp: SystemTime::now(),
                message_type,
                target,
                result,
            }));
        });

        if let Err(error) = queued {
            log::warn!("dropped {} to {}: {}", message_type, target, error);
            self.event_publisher.publish(Event::DeliveryAttempted(DeliveryAttemptedEvent {
                timestamp: SystemTime::now(),
                message_type,
                target,
                result: Err(error.to_string()),
            }));
        }
    }

    /// Queue one envelope carrying `payload` for every peer in `targets` except `src`. Returns the peers
    /// the envelope was queued for.
    pub fn fan_out(
        &self,
        src: &PeerId,
        targets: &[PeerId],
        message_type: MessageType,
        payload: impl Into<Payload>,
        route: Route,
    ) -> Vec<PeerId> {
        let payload = payload.into();
        let recipients: Vec<PeerId> = targets.iter().filter(|target| *target != src).cloned().collect();
        for target in &recipients {
            self.dispatch(self.envelope(src, target, message_type, payload.clone()), route);
        }
        recipients
    }

    /// Block until every queued delivery has been attempted, or until `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.dispatch_pool.wait_idle(timeout)
    }
}

fn deliver<N: Transport>(transport: &N, message: ChainMessage, route: Route) -> Result<(), String> {
    match route {
        Route::Direct => match transport.direct_send(message) {
            Ok(Some(ChainMessage { error: Some(error), .. })) => Err(error),
            Ok(_) => Ok(()),
            Err(error) => Err(error.to_string()),
        },
        Route::Routed => transport.send(message).map_err(|error| error.to_string()),
    }
}
