//! src/gossip.rs
//!
//! `Gossip`: the peer registry and the fan-out entry points application code
//! calls (§4.1). Peer-mutating methods acquire `CM_LOCK` then `G_LOCK`
//! (§5) because promoting/demoting a peer also updates connection-status
//! bookkeeping that belongs to `ConnectionManager`.

use crate::connection_manager::{CmState, ConnectionManager, ManagerConfig, Shared};
use crate::consensus::ConsensusNotifier;
use crate::domain::{ConnectionId, Endpoint, PeerStatus, PublicKey};
use crate::error::{Error, PeerRejectedReason, Result};
use crate::health::HealthSink;
use crate::settings::SettingsCache;
use crate::transport::Transport;
use crate::wire::{
    random_nonce, GetPeersResponse, GossipBatchByBatchIdRequest, GossipBatchByTransactionIdRequest,
    GossipBlockRequest, GossipContentType, GossipMessage, MessageType, PeerUnregisterRequest,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct Gossip {
    pub(crate) shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    consensus: Arc<dyn ConsensusNotifier>,
    settings: Arc<dyn SettingsCache>,
    self_endpoint: Option<Endpoint>,
    max_peers: usize,
    manager: Mutex<Option<Arc<ConnectionManager>>>,
}

impl Gossip {
    pub fn new(
        transport: Arc<dyn Transport>,
        consensus: Arc<dyn ConsensusNotifier>,
        settings: Arc<dyn SettingsCache>,
        self_endpoint: Option<Endpoint>,
        max_peers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Shared::new(),
            transport,
            consensus,
            settings,
            self_endpoint,
            max_peers,
            manager: Mutex::new(None),
        })
    }

    /// Builds and launches the `ConnectionManager` reconciliation thread
    /// (§4.1 `start`).
    pub fn start(
        self: &Arc<Self>,
        manager_config: ManagerConfig,
        health: Arc<dyn HealthSink>,
        current_chain_head: Box<dyn Fn() -> Option<String> + Send + Sync>,
    ) {
        let manager = ConnectionManager::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.transport),
            health,
            manager_config,
            Arc::downgrade(self),
            current_chain_head,
        );
        manager.spawn();
        *self.manager.lock().unwrap() = Some(manager);
    }

    /// Sends `PeerUnregister` to every current peer (best-effort) and stops
    /// the `ConnectionManager` (§4.1 `stop`).
    pub fn stop(&self) {
        let peers = self.get_peers();
        let payload = bincode::serialize(&PeerUnregisterRequest {}).unwrap_or_default();
        for conn_id in peers.keys() {
            let _ = self
                .transport
                .send(MessageType::GossipUnregister, payload.clone(), conn_id, true, None);
        }
        if let Some(manager) = self.manager.lock().unwrap().take() {
            manager.stop();
        }
    }

    pub fn get_peers(&self) -> HashMap<ConnectionId, Endpoint> {
        self.shared.peers.lock().unwrap().clone()
    }

    pub(crate) fn connection_manager(&self) -> Option<Arc<ConnectionManager>> {
        self.manager.lock().unwrap().clone()
    }

    /// Removes `connection_id` from the peer map, assuming both locks are
    /// already held by the caller. Returns the public key to notify of the
    /// disconnect, left for the caller to fire after releasing the locks
    /// (§9: "outside `G_LOCK`").
    pub(crate) fn unregister_peer_locked(
        &self,
        connection_id: &ConnectionId,
        cm: &mut CmState,
        peers: &mut HashMap<ConnectionId, Endpoint>,
    ) -> Option<PublicKey> {
        if peers.remove(connection_id).is_some() {
            let public_key = self.transport.connection_id_to_public_key(connection_id);
            cm.connection_status
                .insert(connection_id.clone(), PeerStatus::Temp);
            debug!(%connection_id, remaining = peers.len(), "removed peer");
            public_key
        } else {
            debug!(%connection_id, "unregister peer failed: not registered");
            None
        }
    }

    pub fn unregister_peer(&self, connection_id: &ConnectionId) {
        let public_key = {
            let mut cm = self.shared.cm.lock().unwrap();
            let mut peers = self.shared.peers.lock().unwrap();
            self.unregister_peer_locked(connection_id, &mut cm, &mut peers)
        };
        if let Some(public_key) = public_key {
            self.consensus.notify_peer_disconnected(&public_key);
        }
    }

    pub(crate) fn notify_disconnected(&self, public_keys: Vec<PublicKey>) {
        for public_key in public_keys {
            self.consensus.notify_peer_disconnected(&public_key);
        }
    }

    /// Promotes `connection_id` to peer (§4.1 `register_peer`).
    pub fn register_peer(&self, connection_id: ConnectionId, endpoint: Endpoint) -> Result<()> {
        let mut cm = self.shared.cm.lock().unwrap();
        let mut peers = self.shared.peers.lock().unwrap();

        let stale: Vec<ConnectionId> = peers
            .iter()
            .filter(|(_, ep)| **ep == endpoint)
            .map(|(id, _)| id.clone())
            .collect();
        if !stale.is_empty() {
            let disconnected: Vec<PublicKey> = stale
                .iter()
                .filter_map(|id| self.unregister_peer_locked(id, &mut cm, &mut peers))
                .collect();
            drop(peers);
            drop(cm);
            for public_key in disconnected {
                self.consensus.notify_peer_disconnected(&public_key);
            }
            return Err(Error::PeerRejected(PeerRejectedReason::AlreadyConnected));
        }

        if peers.len() >= self.max_peers {
            return Err(Error::PeerRejected(PeerRejectedReason::MaxReached));
        }

        peers.insert(connection_id.clone(), endpoint.clone());
        cm.connection_status
            .insert(connection_id.clone(), PeerStatus::Peer);
        debug!(%connection_id, %endpoint, peer_count = peers.len(), "registered peer");

        let public_key = self.transport.connection_id_to_public_key(&connection_id);
        drop(peers);
        drop(cm);
        if let Some(public_key) = public_key {
            self.consensus.notify_peer_connected(&public_key);
        }
        Ok(())
    }

    fn time_to_live(&self, override_ttl: Option<u32>) -> u32 {
        override_ttl.unwrap_or_else(|| self.settings.gossip_time_to_live())
    }

    /// Forwards to Transport; drops the connection on `InvalidConnection`
    /// (§4.1 `send`).
    pub fn send(
        &self,
        msg_type: MessageType,
        payload: Vec<u8>,
        connection_id: &ConnectionId,
        one_way: bool,
    ) {
        if let Err(Error::InvalidConnection(_)) =
            self.transport.send(msg_type, payload, connection_id, one_way, None)
        {
            debug!(%connection_id, "connection is no longer valid, removing from peers");
            self.shared.peers.lock().unwrap().remove(connection_id);
        }
    }

    /// Sends to every current peer not in `exclude` (§4.1 `broadcast`).
    /// The payload is serialized once before iterating.
    pub fn broadcast(&self, payload: Vec<u8>, msg_type: MessageType, exclude: &[ConnectionId]) {
        for connection_id in self.get_peers().keys() {
            if exclude.contains(connection_id) {
                continue;
            }
            self.send(msg_type, payload.clone(), connection_id, true);
        }
    }

    fn broadcast_gossip_message(
        &self,
        content_type: GossipContentType,
        content: Vec<u8>,
        exclude: &[ConnectionId],
        time_to_live: Option<u32>,
    ) {
        let message = GossipMessage {
            content_type,
            content,
            time_to_live: self.time_to_live(time_to_live),
        };
        let payload = bincode::serialize(&message).unwrap_or_default();
        self.broadcast(payload, MessageType::GossipMessage, exclude);
    }

    pub fn broadcast_block(&self, block: Vec<u8>, exclude: &[ConnectionId], time_to_live: Option<u32>) {
        self.broadcast_gossip_message(GossipContentType::Block, block, exclude, time_to_live);
    }

    pub fn broadcast_batch(&self, batch: Vec<u8>, exclude: &[ConnectionId], time_to_live: Option<u32>) {
        self.broadcast_gossip_message(GossipContentType::Batch, batch, exclude, time_to_live);
    }

    pub fn broadcast_consensus_message(&self, message: Vec<u8>) {
        self.broadcast_gossip_message(GossipContentType::Consensus, message, &[], None);
    }

    pub fn send_block_request(&self, block_id: &str, connection_id: &ConnectionId) {
        let request = GossipBlockRequest {
            block_id: block_id.to_string(),
            nonce: random_nonce(),
            time_to_live: self.time_to_live(None),
        };
        let payload = bincode::serialize(&request).unwrap_or_default();
        self.send(MessageType::GossipBlockRequest, payload, connection_id, true);
    }

    pub fn broadcast_block_request(&self, block_id: &str) {
        let request = GossipBlockRequest {
            block_id: block_id.to_string(),
            nonce: random_nonce(),
            time_to_live: self.time_to_live(None),
        };
        let payload = bincode::serialize(&request).unwrap_or_default();
        self.broadcast(payload, MessageType::GossipBlockRequest, &[]);
    }

    pub fn broadcast_batch_by_batch_id_request(&self, batch_id: &str) {
        let request = GossipBatchByBatchIdRequest {
            id: batch_id.to_string(),
            nonce: random_nonce(),
            time_to_live: self.time_to_live(None),
        };
        let payload = bincode::serialize(&request).unwrap_or_default();
        self.broadcast(payload, MessageType::GossipBatchByBatchIdRequest, &[]);
    }

    pub fn broadcast_batch_by_transaction_id_request(&self, transaction_ids: Vec<String>) {
        let request = GossipBatchByTransactionIdRequest {
            ids: transaction_ids,
            nonce: random_nonce(),
            time_to_live: self.time_to_live(None),
        };
        let payload = bincode::serialize(&request).unwrap_or_default();
        self.broadcast(payload, MessageType::GossipBatchByTransactionIdRequest, &[]);
    }

    /// Unicasts our peer list to `connection_id`, one-way because the
    /// destination may be a temp connection about to close (§4.1 `send_peers`).
    pub fn send_peers(&self, connection_id: &ConnectionId) {
        let mut peer_endpoints: Vec<Endpoint> = self.get_peers().into_values().collect();
        if let Some(self_endpoint) = &self.self_endpoint {
            peer_endpoints.push(self_endpoint.clone());
        }
        let response = GetPeersResponse { peer_endpoints };
        let payload = bincode::serialize(&response).unwrap_or_default();
        self.send(MessageType::GossipGetPeersResponse, payload, connection_id, true);
    }

    /// Delivers endpoints learned from a `GetPeersResponse` to the
    /// connection manager's candidate list.
    pub fn add_candidate_peer_endpoints(&self, endpoints: Vec<Endpoint>) {
        if let Some(manager) = self.connection_manager() {
            manager.add_candidate_peer_endpoints(endpoints);
        } else {
            debug!("could not add candidate endpoints: connection manager not started");
        }
    }

    /// Forwarded from Transport's authorization callback (§4.2.3).
    pub fn connect_success(&self, connection_id: &ConnectionId) {
        if let Some(manager) = self.connection_manager() {
            manager.connect_success(connection_id);
        }
    }

    pub fn remove_temporary_connection(&self, connection_id: &ConnectionId) {
        if let Some(manager) = self.connection_manager() {
            manager.remove_temporary_connection(connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::NullConsensusNotifier;
    use crate::settings::StaticSettingsCache;
    use crate::transport::{ApplicationMessageSink, ReplyCallback};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeTransport {
        sent: StdMutex<Vec<(MessageType, Vec<u8>, ConnectionId, bool)>>,
        handshake_complete: StdMutex<HashMap<ConnectionId, bool>>,
        public_keys: StdMutex<HashMap<ConnectionId, PublicKey>>,
    }

    impl Transport for FakeTransport {
        fn send(
            &self,
            msg_type: MessageType,
            payload: Vec<u8>,
            connection_id: &ConnectionId,
            one_way: bool,
            _callback: Option<ReplyCallback>,
        ) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((msg_type, payload, connection_id.clone(), one_way));
            Ok(())
        }

        fn add_outbound_connection(&self, _endpoint: &Endpoint) -> Result<ConnectionId> {
            unimplemented!()
        }

        fn remove_connection(&self, _connection_id: &ConnectionId) {}

        fn has_connection(&self, _connection_id: &ConnectionId) -> bool {
            true
        }

        fn is_connection_handshake_complete(&self, connection_id: &ConnectionId) -> bool {
            *self
                .handshake_complete
                .lock()
                .unwrap()
                .get(connection_id)
                .unwrap_or(&true)
        }

        fn get_connection_id_by_endpoint(&self, _endpoint: &Endpoint) -> Option<ConnectionId> {
            None
        }

        fn connection_id_to_endpoint(&self, _connection_id: &ConnectionId) -> Option<Endpoint> {
            None
        }

        fn connection_id_to_public_key(&self, connection_id: &ConnectionId) -> Option<PublicKey> {
            self.public_keys.lock().unwrap().get(connection_id).cloned()
        }

        fn public_key_to_connection_id(&self, _public_key: &PublicKey) -> Option<ConnectionId> {
            None
        }
    }
    impl ApplicationMessageSink for FakeTransport {}

    fn gossip_with_max(max_peers: usize) -> (Arc<Gossip>, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        let gossip = Gossip::new(
            transport.clone(),
            Arc::new(NullConsensusNotifier),
            Arc::new(StaticSettingsCache::default()),
            Some(Endpoint::from("tcp://self:1")),
            max_peers,
        );
        (gossip, transport)
    }

    #[test]
    fn register_peer_succeeds_under_max() {
        let (gossip, _t) = gossip_with_max(3);
        gossip
            .register_peer(ConnectionId("c1".into()), Endpoint::from("tcp://a:1"))
            .unwrap();
        assert_eq!(gossip.get_peers().len(), 1);
    }

    #[test]
    fn register_peer_rejects_at_max_peers() {
        let (gossip, _t) = gossip_with_max(1);
        gossip
            .register_peer(ConnectionId("c1".into()), Endpoint::from("tcp://a:1"))
            .unwrap();
        let err = gossip
            .register_peer(ConnectionId("c2".into()), Endpoint::from("tcp://b:1"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PeerRejected(PeerRejectedReason::MaxReached)
        ));
        assert_eq!(gossip.get_peers().len(), 1);
    }

    #[test]
    fn register_peer_sweeps_abandoned_peer_at_same_endpoint() {
        let (gossip, _t) = gossip_with_max(3);
        let endpoint = Endpoint::from("tcp://p:1");
        gossip
            .register_peer(ConnectionId("c1".into()), endpoint.clone())
            .unwrap();
        let err = gossip
            .register_peer(ConnectionId("c2".into()), endpoint)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PeerRejected(PeerRejectedReason::AlreadyConnected)
        ));
        assert!(!gossip.get_peers().contains_key(&ConnectionId("c1".into())));
        assert!(!gossip.get_peers().contains_key(&ConnectionId("c2".into())));
    }

    #[test]
    fn broadcast_never_delivers_to_excluded_connections() {
        let (gossip, transport) = gossip_with_max(5);
        for (id, ep) in [("c1", "tcp://a:1"), ("c2", "tcp://b:1"), ("c3", "tcp://c:1")] {
            gossip
                .register_peer(ConnectionId(id.into()), Endpoint::from(ep))
                .unwrap();
        }
        gossip.broadcast_block(b"block-bytes".to_vec(), &[ConnectionId("c2".into())], Some(3));

        let sent = transport.sent.lock().unwrap();
        let recipients: Vec<&ConnectionId> = sent.iter().map(|(_, _, id, _)| id).collect();
        assert_eq!(sent.len(), 2);
        assert!(!recipients.contains(&&ConnectionId("c2".into())));
        for (_, payload, _, one_way) in sent.iter() {
            assert!(one_way);
            let decoded: GossipMessage = bincode::deserialize(payload).unwrap();
            assert_eq!(decoded.content, b"block-bytes");
            assert_eq!(decoded.time_to_live, 3);
        }
    }
}
