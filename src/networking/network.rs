use thiserror::Error;

use crate::types::data_types::PeerId;

use super::messages::ChainMessage;

/// The message transport provided by the library user.
///
/// The transport owns encryption, compression and routing. In the other direction, it hands every
/// inbound envelope to [`Dispatcher::dispatch`](super::receiving::Dispatcher::dispatch).
pub trait Transport: Send + Sync + 'static {
    /// Deliver `message` straight to `message.target_peer_id`, bypassing application-level routing.
    /// Returns the target's response, if the transport waits for one.
    fn direct_send(&self, message: ChainMessage) -> Result<Option<ChainMessage>, TransportError>;

    /// Deliver `message` through the routed path, starting at `message.connect_peer_id`.
    fn send(&self, message: ChainMessage) -> Result<(), TransportError>;

    /// Deliver a response envelope back to the source of a request.
    fn response(&self, message: ChainMessage) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("transport is shut down")]
    Closed,

    #[error("{0}")]
    Other(String),
}
