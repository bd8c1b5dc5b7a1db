use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock, Weak},
};

use block_consensus::{
    networking::{
        messages::{ChainMessage, MessageType},
        network::{Transport, TransportError},
        receiving::Dispatcher,
    },
    types::data_types::PeerId,
};

type Dispatchers = HashMap<PeerId, Weak<Dispatcher<NetworkStub>>>;

/// A mock network stub that hands envelopes straight to the dispatcher of the target node.
///
/// Direct requests are handled on the sending thread and their response is returned, like an RPC.
/// Routed messages and responses are queued on the target's receive pool. Every envelope handed to
/// the stub is recorded, including the ones to unreachable peers.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    dispatchers: Arc<RwLock<Dispatchers>>,
    unreachable: Arc<Mutex<HashSet<PeerId>>>,
    sent: Arc<Mutex<Vec<ChainMessage>>>,
}

impl NetworkStub {
    pub(crate) fn new() -> NetworkStub {
        NetworkStub {
            dispatchers: Arc::new(RwLock::new(HashMap::new())),
            unreachable: Arc::new(Mutex::new(HashSet::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make `dispatcher` the receiving end of `peer_id`. The stub does not keep the dispatcher alive.
    pub(crate) fn attach(&self, peer_id: PeerId, dispatcher: &Arc<Dispatcher<NetworkStub>>) {
        self.dispatchers
            .write()
            .unwrap()
            .insert(peer_id, Arc::downgrade(dispatcher));
    }

    /// Drop every envelope addressed to `peer_id` from now on.
    pub(crate) fn cut(&self, peer_id: &PeerId) {
        self.unreachable.lock().unwrap().insert(peer_id.clone());
    }

    /// Every envelope of `message_type` sent so far.
    pub(crate) fn sent(&self, message_type: MessageType) -> Vec<ChainMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.message_type == message_type)
            .cloned()
            .collect()
    }

    fn target(&self, message: &ChainMessage) -> Result<Arc<Dispatcher<NetworkStub>>, TransportError> {
        self.sent.lock().unwrap().push(message.clone());
        let peer_id = &message.target_peer_id;
        if self.unreachable.lock().unwrap().contains(peer_id) {
            return Err(TransportError::Unreachable(peer_id.clone()));
        }
        self.dispatchers
            .read()
            .unwrap()
            .get(peer_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(peer_id.clone()))
    }
}

impl Transport for NetworkStub {
    fn direct_send(&self, message: ChainMessage) -> Result<Option<ChainMessage>, TransportError> {
        let dispatcher = self.target(&message)?;
        if message.is_request() {
            return Ok(dispatcher.respond(message));
        }
        dispatcher
            .dispatch(message)
            .map_err(|error| TransportError::Other(error.to_string()))?;
        Ok(None)
    }

    fn send(&self, message: ChainMessage) -> Result<(), TransportError> {
        self.target(&message)?
            .dispatch(message)
            .map_err(|error| TransportError::Other(error.to_string()))
    }

    fn response(&self, message: ChainMessage) -> Result<(), TransportError> {
        self.send(message)
    }
}
