//! A fixed, in-memory implementation of [`PeerService`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use block_consensus::{
    pluggables::PeerService,
    types::{data_types::PeerId, peer::Peer},
};

/// Knows every peer of a test cluster from the start. Only the peers in `candidates` may join a
/// replica set; the others (clients) are known but never selected.
#[derive(Clone)]
pub(crate) struct StaticPeers {
    me: Arc<Mutex<Option<Peer>>>,
    known: Arc<HashMap<PeerId, Peer>>,
    candidates: Vec<PeerId>,
    penalties: Arc<Mutex<Vec<(PeerId, String)>>>,
}

impl StaticPeers {
    pub(crate) fn new(me: Peer, known: &[Peer], candidates: &[PeerId]) -> StaticPeers {
        StaticPeers {
            me: Arc::new(Mutex::new(Some(me))),
            known: Arc::new(
                known
                    .iter()
                    .map(|peer| (peer.peer_id.clone(), peer.clone()))
                    .collect(),
            ),
            candidates: candidates.to_vec(),
            penalties: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Forget the local identity, as if discovery had not resolved it yet.
    pub(crate) fn forget_myself(&self) {
        *self.me.lock().unwrap() = None;
    }

    pub(crate) fn penalties(&self) -> Vec<(PeerId, String)> {
        self.penalties.lock().unwrap().clone()
    }
}

impl PeerService for StaticPeers {
    fn myself(&self) -> Option<Peer> {
        self.me.lock().unwrap().clone()
    }

    fn find(&self, peer_id: &PeerId) -> Option<Peer> {
        self.known.get(peer_id).cloned()
    }

    fn candidates(&self) -> Vec<Peer> {
        self.candidates
            .iter()
            .filter_map(|peer_id| self.known.get(peer_id).cloned())
            .collect()
    }

    fn penalize(&self, peer_id: &PeerId, reason: &str) {
        self.penalties
            .lock()
            .unwrap()
            .push((peer_id.clone(), reason.to_string()));
    }
}
