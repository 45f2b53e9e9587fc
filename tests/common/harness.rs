//! tests/common/harness.rs
//!
//! An in-memory fake `Transport` for driving a real `Gossip` +
//! `ConnectionManager` pair through the end-to-end scenarios of §8 without
//! opening a socket. Dialing, handshake completion, and replies are all
//! scripted by the test rather than happening over the wire.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use validator_gossip::domain::{ConnectionId, Endpoint, PublicKey};
use validator_gossip::error::Result;
use validator_gossip::transport::{ApplicationMessageSink, ReplyCallback, Transport};
use validator_gossip::wire::{AckStatus, MessageType, NetworkAcknowledgement};

#[derive(Default)]
pub struct FakeTransport {
    next_id: Mutex<u64>,
    dialed: Mutex<Vec<Endpoint>>,
    endpoints: Mutex<HashMap<ConnectionId, Endpoint>>,
    handshake_complete: Mutex<HashMap<ConnectionId, bool>>,
    public_keys: Mutex<HashMap<ConnectionId, PublicKey>>,
    sent: Mutex<Vec<(MessageType, Vec<u8>, ConnectionId, bool)>>,
    pending_replies: Mutex<Vec<(ConnectionId, MessageType, ReplyCallback)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dial_count(&self, endpoint: &Endpoint) -> usize {
        self.dialed.lock().unwrap().iter().filter(|e| *e == endpoint).count()
    }

    pub fn is_dialing(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.lock().unwrap().values().any(|e| e == endpoint)
    }

    /// Authorizes a dialed connection, as Transport would once the QUIC
    /// handshake finishes. The caller still has to call
    /// `Gossip::connect_success` to drive the peering/topology dispatch,
    /// exactly as the production transport does.
    pub fn complete_handshake(&self, connection_id: &ConnectionId, public_key: PublicKey) {
        self.handshake_complete
            .lock()
            .unwrap()
            .insert(connection_id.clone(), true);
        self.public_keys
            .lock()
            .unwrap()
            .insert(connection_id.clone(), public_key);
    }

    pub fn sent_messages(&self) -> Vec<(MessageType, Vec<u8>, ConnectionId, bool)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn connection_id_for(&self, endpoint: &Endpoint) -> Option<ConnectionId> {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .find(|(_, e)| *e == endpoint)
            .map(|(id, _)| id.clone())
    }

    /// Fires the oldest pending reply callback of the given type, as if the
    /// remote peer had just acknowledged it.
    pub fn ack_oldest(&self, msg_type: MessageType, status: AckStatus) -> bool {
        let mut pending = self.pending_replies.lock().unwrap();
        let Some(pos) = pending.iter().position(|(_, t, _)| *t == msg_type) else {
            return false;
        };
        let (_, _, callback) = pending.remove(pos);
        drop(pending);
        callback(NetworkAcknowledgement { status });
        true
    }

    fn next_connection_id(&self) -> ConnectionId {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        ConnectionId(format!("fake-conn-{next}"))
    }
}

impl Transport for FakeTransport {
    fn send(
        &self,
        msg_type: MessageType,
        payload: Vec<u8>,
        connection_id: &ConnectionId,
        one_way: bool,
        callback: Option<ReplyCallback>,
    ) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((msg_type, payload, connection_id.clone(), one_way));
        if let Some(callback) = callback {
            self.pending_replies
                .lock()
                .unwrap()
                .push((connection_id.clone(), msg_type, callback));
        }
        Ok(())
    }

    fn add_outbound_connection(&self, endpoint: &Endpoint) -> Result<ConnectionId> {
        self.dialed.lock().unwrap().push(endpoint.clone());
        let connection_id = self.next_connection_id();
        self.endpoints
            .lock()
            .unwrap()
            .insert(connection_id.clone(), endpoint.clone());
        self.handshake_complete
            .lock()
            .unwrap()
            .insert(connection_id.clone(), false);
        Ok(connection_id)
    }

    fn remove_connection(&self, connection_id: &ConnectionId) {
        self.endpoints.lock().unwrap().remove(connection_id);
        self.handshake_complete.lock().unwrap().remove(connection_id);
        self.public_keys.lock().unwrap().remove(connection_id);
    }

    fn has_connection(&self, connection_id: &ConnectionId) -> bool {
        self.endpoints.lock().unwrap().contains_key(connection_id)
    }

    fn is_connection_handshake_complete(&self, connection_id: &ConnectionId) -> bool {
        *self
            .handshake_complete
            .lock()
            .unwrap()
            .get(connection_id)
            .unwrap_or(&false)
    }

    fn get_connection_id_by_endpoint(&self, endpoint: &Endpoint) -> Option<ConnectionId> {
        self.connection_id_for(endpoint)
    }

    fn connection_id_to_endpoint(&self, connection_id: &ConnectionId) -> Option<Endpoint> {
        self.endpoints.lock().unwrap().get(connection_id).cloned()
    }

    fn connection_id_to_public_key(&self, connection_id: &ConnectionId) -> Option<PublicKey> {
        self.public_keys.lock().unwrap().get(connection_id).cloned()
    }

    fn public_key_to_connection_id(&self, public_key: &PublicKey) -> Option<ConnectionId> {
        self.public_keys
            .lock()
            .unwrap()
            .iter()
            .find(|(_, k)| *k == public_key)
            .map(|(id, _)| id.clone())
    }
}

impl ApplicationMessageSink for FakeTransport {}

/// Polls `predicate` until it returns `true` or `deadline` elapses, for
/// waiting on the connection-manager thread's background reconciliation.
pub fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if predicate() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn distinct_endpoints(sent: &[(MessageType, Vec<u8>, ConnectionId, bool)]) -> HashSet<ConnectionId> {
    sent.iter().map(|(_, _, id, _)| id.clone()).collect()
}
