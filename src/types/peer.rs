//! The [`Peer`] record as resolved by the peer identity provider.

use super::data_types::PeerId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: PeerId,
    /// Network address used by the transport to reach the peer.
    pub address: String,
    /// Ed25519 verifying key bytes.
    pub public_key: [u8; 32],
}

impl Peer {
    pub fn new(peer_id: PeerId, address: impl Into<String>, public_key: [u8; 32]) -> Peer {
        Peer {
            peer_id,
            address: address.into(),
            public_key,
        }
    }
}
