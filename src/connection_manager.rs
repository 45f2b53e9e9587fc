//! src/connection_manager.rs
//!
//! The reconciliation engine: a dedicated worker thread that dials and
//! retires connections under the two peering policies, and the bookkeeping
//! (`CmState`) it protects with its own lock (§4.2, §5).
//!
//! Lock order is `CM_LOCK` then `G_LOCK` (§5, §9). Rather than encode that
//! with guard tokens, both locks live on one shared object (`Shared`,
//! §9's explicitly allowed alternative: "a single combined state object if
//! contention permits") and every function that needs both takes `cm` first.

use crate::domain::{ConnectionId, DialIntent, Endpoint, EndpointInfo, PeerStatus, StaticPeerInfo};
use crate::error::Error;
use crate::gossip::Gossip;
use crate::health::HealthSink;
use crate::transport::Transport;
use crate::wire::{
    AckStatus, GetPeersRequest, MessageType, NetworkAcknowledgement, NetworkDisconnect,
    PeerRegisterRequest, NETWORK_PROTOCOL_VERSION,
};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Fields protected by `CM_LOCK`.
#[derive(Default)]
pub(crate) struct CmState {
    pub temp_connections: HashMap<ConnectionId, EndpointInfo>,
    pub connection_status: HashMap<ConnectionId, PeerStatus>,
    pub candidates: Vec<Endpoint>,
    pub static_peers: HashMap<Endpoint, StaticPeerInfo>,
    pub stopped: bool,
}

/// Combined lock pair the spec calls out as `CM_LOCK`/`G_LOCK`.
pub(crate) struct Shared {
    pub cm: Mutex<CmState>,
    pub peers: Mutex<HashMap<ConnectionId, Endpoint>>,
}

impl Shared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cm: Mutex::new(CmState::default()),
            peers: Mutex::new(HashMap::new()),
        })
    }
}

pub struct ManagerConfig {
    pub self_endpoint: Option<Endpoint>,
    pub static_peer_endpoints: Vec<Endpoint>,
    pub seed_endpoints: Vec<Endpoint>,
    pub peering_mode: crate::domain::PeeringMode,
    pub min_peers: usize,
    pub check_frequency: Duration,
    pub initial_retry_frequency: Duration,
    pub maximum_retry_frequency: Duration,
    pub maximum_static_retry_frequency: Duration,
    pub maximum_static_retries: u32,
    pub ticks_before_reboot: u32,
    pub response_wait: Duration,
}

pub struct ConnectionManager {
    pub(crate) shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    health: Arc<dyn HealthSink>,
    config: ManagerConfig,
    gossip: Weak<Gossip>,
    current_chain_head: Box<dyn Fn() -> Option<String> + Send + Sync>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub(crate) fn new(
        shared: Arc<Shared>,
        transport: Arc<dyn Transport>,
        health: Arc<dyn HealthSink>,
        config: ManagerConfig,
        gossip: Weak<Gossip>,
        current_chain_head: Box<dyn Fn() -> Option<String> + Send + Sync>,
    ) -> Arc<Self> {
        let half_initial = config.initial_retry_frequency / 2;
        {
            let mut cm = shared.cm.lock().unwrap();
            let self_ep = config.self_endpoint.clone();
            for endpoint in &config.static_peer_endpoints {
                if Some(endpoint) == self_ep.as_ref() {
                    continue;
                }
                cm.static_peers
                    .insert(endpoint.clone(), StaticPeerInfo::fresh(half_initial));
            }
        }
        Arc::new(Self {
            shared,
            transport,
            health,
            config,
            gossip,
            current_chain_head,
            thread: Mutex::new(None),
        })
    }

    fn gossip(&self) -> Arc<Gossip> {
        self.gossip
            .upgrade()
            .expect("ConnectionManager outlives its Gossip")
    }

    /// Spawns the reconciliation loop on a dedicated thread.
    pub(crate) fn spawn(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("connection-manager".into())
            .spawn(move || this.run())
            .expect("failed to spawn connection-manager thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    fn is_stopped(&self) -> bool {
        self.shared.cm.lock().unwrap().stopped
    }

    fn run(self: Arc<Self>) {
        let mut has_chain_head = (self.current_chain_head)().is_some();
        let mut countdown = self.config.ticks_before_reboot as i64;

        while !self.is_stopped() {
            countdown -= 1;
            if countdown < 0 {
                let peer_count = self.gossip().get_peers().len();
                if peer_count < self.config.min_peers {
                    info!(peer_count, "health countdown expired while under-peered");
                    self.health.on_unhealthy(peer_count, self.config.min_peers);
                }
            }

            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                match self.config.peering_mode {
                    crate::domain::PeeringMode::Dynamic => self.retry_dynamic_peering(),
                    crate::domain::PeeringMode::Static => self.retry_static_peering(),
                }
            }));
            if let Err(panic) = outcome {
                error!(?panic, "unhandled panic during peer refresh");
            }

            has_chain_head = has_chain_head || (self.current_chain_head)().is_some();
            if !has_chain_head {
                let peered = self.peered_connections();
                if !peered.is_empty() {
                    debug!(count = peered.len(), "requesting chain head from peers");
                    let gossip = self.gossip();
                    for conn_id in peered {
                        gossip.send_block_request(crate::wire::HEAD_BLOCK_ID, &conn_id);
                    }
                }
            }

            std::thread::sleep(self.config.check_frequency);
        }
    }

    fn peered_connections(&self) -> Vec<ConnectionId> {
        let gossip = self.gossip();
        let peers = gossip.get_peers();
        let cm = self.shared.cm.lock().unwrap();
        peers
            .keys()
            .filter(|id| matches!(cm.connection_status.get(*id), Some(PeerStatus::Peer)))
            .cloned()
            .collect()
    }

    /// Stops the loop and best-effort disconnects every non-closed
    /// connection (§4.2.6). Idempotent.
    pub(crate) fn stop(&self) {
        let mut cm = self.shared.cm.lock().unwrap();
        cm.stopped = true;
        let ids: Vec<ConnectionId> = cm.connection_status.keys().cloned().collect();
        for id in ids {
            if matches!(cm.connection_status.get(&id), Some(PeerStatus::Closed)) {
                continue;
            }
            let _ = self.transport.send(
                MessageType::NetworkDisconnect,
                bincode::serialize(&NetworkDisconnect {}).unwrap_or_default(),
                &id,
                true,
                None,
            );
            cm.connection_status.insert(id, PeerStatus::Closed);
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            drop(cm);
            let _ = handle.join();
        }
    }

    // ---- dynamic peering (§4.2.1) ----

    fn retry_dynamic_peering(&self) {
        let gossip = self.gossip();
        let (peers, disconnected) = {
            let mut cm = self.shared.cm.lock().unwrap();
            let mut peers = self.shared.peers.lock().unwrap();
            let disconnected = self.refresh_peer_list(&mut cm, &mut peers, &gossip);
            (peers.clone(), disconnected)
        };
        notify_disconnected(&gossip, disconnected);

        let peer_count = peers.len();
        if peer_count >= self.config.min_peers {
            return;
        }
        debug!(peer_count, min_peers = self.config.min_peers, "below minimum peer threshold, searching topology");

        {
            let mut cm = self.shared.cm.lock().unwrap();
            cm.candidates.clear();
            self.refresh_connection_states(&mut cm);
            self.check_temp_connections(&mut cm);
        }

        self.get_peers_of_peers(&peers);
        self.get_peers_of_endpoints();

        std::thread::sleep(self.config.response_wait);

        let peers = gossip.get_peers();
        let peered_endpoints: HashSet<Endpoint> = peers.values().cloned().collect();

        let unpeered: Vec<Endpoint> = {
            let cm = self.shared.cm.lock().unwrap();
            cm.candidates
                .iter()
                .filter(|e| {
                    !peered_endpoints.contains(*e) && Some(*e) != self.config.self_endpoint.as_ref()
                })
                .cloned()
                .collect()
        };

        debug!(
            peered = peered_endpoints.len(),
            unpeered = unpeered.len(),
            "dynamic peering candidate pass"
        );

        if let Some(chosen) = unpeered.choose(&mut rand::thread_rng()) {
            self.attempt_to_peer_with_endpoint(chosen.clone());
        }
    }

    fn endpoints_not_peered(
        &self,
        peers: &HashMap<ConnectionId, Endpoint>,
        initial_endpoints: &[Endpoint],
    ) -> HashSet<Endpoint> {
        let peered: HashSet<&Endpoint> = peers.values().collect();
        initial_endpoints
            .iter()
            .filter(|e| Some(*e) != self.config.self_endpoint.as_ref() && !peered.contains(e))
            .cloned()
            .collect()
    }

    // ---- static peering (§4.2.2) ----

    fn retry_static_peering(&self) {
        let gossip = self.gossip();
        let mut to_remove = Vec::new();

        let (candidates, peers, disconnected) = {
            let mut cm = self.shared.cm.lock().unwrap();
            self.refresh_connection_states(&mut cm);
            let mut peers = self.shared.peers.lock().unwrap();
            let disconnected = self.refresh_peer_list(&mut cm, &mut peers, &gossip);
            let candidates =
                self.endpoints_not_peered(&peers, &self.static_endpoint_list(&cm));
            (candidates, peers.clone(), disconnected)
        };
        notify_disconnected(&gossip, disconnected);

        let half_initial = self.config.initial_retry_frequency / 2;
        {
            let mut cm = self.shared.cm.lock().unwrap();
            let static_endpoints: Vec<Endpoint> = cm.static_peers.keys().cloned().collect();
            let peered: HashSet<&Endpoint> = peers.values().collect();
            for endpoint in static_endpoints {
                if peered.contains(&endpoint) {
                    if let Some(info) = cm.static_peers.get_mut(&endpoint) {
                        let connection_id = info.connection_id.clone();
                        *info = StaticPeerInfo {
                            connection_id,
                            last_attempt: Instant::now()
                                .checked_sub(half_initial + Duration::from_secs(1))
                                .unwrap_or_else(Instant::now),
                            retry_threshold: half_initial,
                            attempt_count: 0,
                        };
                    }
                }
            }
        }

        for endpoint in candidates {
            let mut cm = self.shared.cm.lock().unwrap();
            let info = match cm.static_peers.get(&endpoint) {
                Some(info) => info.clone(),
                None => continue,
            };
            if info.last_attempt.elapsed() <= info.retry_threshold {
                continue;
            }

            if info.retry_threshold == self.config.maximum_static_retry_frequency {
                if info.attempt_count >= self.config.maximum_static_retries {
                    to_remove.push(endpoint);
                    continue;
                }
                cm.static_peers.insert(
                    endpoint.clone(),
                    StaticPeerInfo {
                        connection_id: info.connection_id.clone(),
                        last_attempt: Instant::now(),
                        retry_threshold: self.config.maximum_static_retry_frequency,
                        attempt_count: info.attempt_count + 1,
                    },
                );
            } else {
                let new_threshold = (info.retry_threshold * 2)
                    .min(self.config.maximum_static_retry_frequency);
                cm.static_peers.insert(
                    endpoint.clone(),
                    StaticPeerInfo {
                        connection_id: info.connection_id.clone(),
                        last_attempt: Instant::now(),
                        retry_threshold: new_threshold,
                        attempt_count: info.attempt_count,
                    },
                );
            }

            let complete = match &info.connection_id {
                Some(conn_id) => {
                    let complete = self.transport.is_connection_handshake_complete(conn_id);
                    if !complete {
                        cm.temp_connections.remove(conn_id);
                        self.transport.remove_connection(conn_id);
                    }
                    complete
                }
                None => false,
            };

            if !complete {
                debug!(%endpoint, "attempting to peer with static endpoint");
                match self.transport.add_outbound_connection(&endpoint) {
                    Ok(new_conn) => {
                        if let Some(entry) = cm.static_peers.get_mut(&endpoint) {
                            entry.connection_id = Some(new_conn.clone());
                        }
                        cm.temp_connections.insert(
                            new_conn,
                            EndpointInfo {
                                endpoint: endpoint.clone(),
                                intent: DialIntent::Peering,
                                dialed_at: Instant::now(),
                                retry_threshold: self.config.initial_retry_frequency,
                            },
                        );
                    }
                    Err(e) => warn!(%endpoint, error = %e, "failed to dial static endpoint"),
                }
            }
        }

        if !to_remove.is_empty() {
            let mut cm = self.shared.cm.lock().unwrap();
            for endpoint in &to_remove {
                info!(%endpoint, "giving up on static endpoint after exhausting retries");
                cm.static_peers.remove(endpoint);
            }
        }
    }

    fn static_endpoint_list(&self, cm: &CmState) -> Vec<Endpoint> {
        cm.static_peers.keys().cloned().collect()
    }

    // ---- shared reconciliation helpers ----

    fn refresh_peer_list(
        &self,
        cm: &mut CmState,
        peers: &mut HashMap<ConnectionId, Endpoint>,
        gossip: &Gossip,
    ) -> Vec<crate::domain::PublicKey> {
        let stale: Vec<ConnectionId> = peers
            .iter()
            .filter(|(id, _)| !self.transport.is_connection_handshake_complete(id))
            .map(|(id, _)| id.clone())
            .collect();
        let mut disconnected = Vec::new();
        for conn_id in stale {
            debug!(%conn_id, "removing peer because connection went away");
            if let Some(public_key) = gossip.unregister_peer_locked(&conn_id, cm, peers) {
                disconnected.push(public_key);
            }
            cm.connection_status.remove(&conn_id);
        }
        disconnected
    }

    fn refresh_connection_states(&self, cm: &mut CmState) {
        let closed: Vec<ConnectionId> = cm
            .connection_status
            .keys()
            .filter(|id| !self.transport.has_connection(id))
            .cloned()
            .collect();
        for id in closed {
            cm.connection_status.remove(&id);
        }
    }

    fn check_temp_connections(&self, cm: &mut CmState) {
        let now = Instant::now();
        let retry: Vec<(ConnectionId, EndpointInfo)> = cm
            .temp_connections
            .iter()
            .filter(|(id, info)| {
                now.duration_since(info.dialed_at) > info.retry_threshold
                    && !self.transport.is_connection_handshake_complete(id)
            })
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect();

        for (conn_id, info) in retry {
            debug!(endpoint = %info.endpoint, threshold = ?info.retry_threshold, "temp connection exceeded retry threshold");
            let mut new_threshold = if info.retry_threshold == self.config.maximum_retry_frequency
            {
                self.config.initial_retry_frequency / 2
            } else {
                info.retry_threshold
            };
            new_threshold = (new_threshold * 2).min(self.config.maximum_retry_frequency);

            cm.temp_connections.remove(&conn_id);
            self.transport.remove_connection(&conn_id);
            if let Ok(new_conn) = self.transport.add_outbound_connection(&info.endpoint) {
                cm.temp_connections.insert(
                    new_conn,
                    EndpointInfo {
                        endpoint: info.endpoint,
                        intent: info.intent,
                        dialed_at: now,
                        retry_threshold: new_threshold,
                    },
                );
            }
        }
    }

    fn get_peers_of_peers(&self, peers: &HashMap<ConnectionId, Endpoint>) {
        let payload = bincode::serialize(&GetPeersRequest {}).unwrap_or_default();
        for conn_id in peers.keys() {
            if let Err(e) = self.transport.send(
                MessageType::GossipGetPeersRequest,
                payload.clone(),
                conn_id,
                false,
                None,
            ) {
                debug!(%conn_id, error = %e, "peer disconnected while requesting peers");
            }
        }
    }

    fn get_peers_of_endpoints(&self) {
        let (endpoints, peered) = {
            // Held for CM_LOCK-before-G_LOCK ordering even though this read
            // doesn't need its data.
            let _cm = self.shared.cm.lock().unwrap();
            let peers = self.shared.peers.lock().unwrap();
            let endpoints = self.endpoints_not_peered(&peers, &self.config.seed_endpoints);
            let peered: HashSet<Endpoint> = peers.values().cloned().collect();
            (endpoints, peered)
        };

        for endpoint in endpoints {
            if peered.contains(&endpoint) {
                continue;
            }
            if self
                .transport
                .get_connection_id_by_endpoint(&endpoint)
                .is_some()
            {
                continue;
            }
            let mut cm = self.shared.cm.lock().unwrap();
            if let Ok(new_conn) = self.transport.add_outbound_connection(&endpoint) {
                cm.temp_connections.insert(
                    new_conn,
                    EndpointInfo {
                        endpoint,
                        intent: DialIntent::Topology,
                        dialed_at: Instant::now(),
                        retry_threshold: self.config.initial_retry_frequency,
                    },
                );
            }
        }
    }

    fn attempt_to_peer_with_endpoint(&self, endpoint: Endpoint) {
        if self
            .transport
            .get_connection_id_by_endpoint(&endpoint)
            .is_some()
        {
            debug!(%endpoint, "endpoint already has an outstanding connection");
            return;
        }
        debug!(%endpoint, "attempting to connect/peer");
        let mut cm = self.shared.cm.lock().unwrap();
        if let Ok(new_conn) = self.transport.add_outbound_connection(&endpoint) {
            cm.temp_connections.insert(
                new_conn,
                EndpointInfo {
                    endpoint,
                    intent: DialIntent::Peering,
                    dialed_at: Instant::now(),
                    retry_threshold: self.config.initial_retry_frequency,
                },
            );
        }
    }

    pub(crate) fn add_candidate_peer_endpoints(&self, endpoints: Vec<Endpoint>) {
        let mut cm = self.shared.cm.lock().unwrap();
        for endpoint in endpoints {
            if !cm.candidates.contains(&endpoint) {
                cm.candidates.push(endpoint);
            }
        }
    }

    // ---- handshake / register lifecycle (§4.2.3, §4.2.4, §4.2.5) ----

    /// Invoked by Transport once a dialed or accepted connection authorizes.
    pub fn connect_success(&self, connection_id: &ConnectionId) {
        let endpoint = self.transport.connection_id_to_endpoint(connection_id);
        let mut cm = self.shared.cm.lock().unwrap();
        let info = cm.temp_connections.get(connection_id).cloned();
        debug!(%connection_id, ?endpoint, "connection authorized");
        match info {
            None => debug!(?endpoint, "connect_success for unknown connection"),
            Some(info) => match info.intent {
                DialIntent::Peering => {
                    cm.connection_status
                        .insert(connection_id.clone(), PeerStatus::Temp);
                    drop(cm);
                    self.send_peer_register(connection_id, &info.endpoint);
                    cm = self.shared.cm.lock().unwrap();
                }
                DialIntent::Topology => {
                    cm.connection_status
                        .insert(connection_id.clone(), PeerStatus::Temp);
                    drop(cm);
                    self.send_topology_get_peers(connection_id);
                    cm = self.shared.cm.lock().unwrap();
                }
            },
        }
        cm.temp_connections.remove(connection_id);
    }

    fn send_peer_register(&self, connection_id: &ConnectionId, endpoint: &Endpoint) {
        let request = PeerRegisterRequest {
            endpoint: self.config.self_endpoint.clone(),
            protocol_version: NETWORK_PROTOCOL_VERSION,
        };
        let payload = match bincode::serialize(&request) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to serialize PeerRegister");
                return;
            }
        };
        let this_connection_id = connection_id.clone();
        let this_endpoint = endpoint.clone();
        let gossip = Arc::downgrade(&self.gossip());
        let shared = Arc::clone(&self.shared);
        let transport = Arc::clone(&self.transport);
        let callback: crate::transport::ReplyCallback = Box::new(move |ack| {
            peer_callback(
                &shared,
                &transport,
                gossip,
                &this_connection_id,
                &this_endpoint,
                ack,
            );
        });
        if let Err(e) =
            self.transport
                .send(MessageType::GossipRegister, payload, connection_id, false, Some(callback))
        {
            debug!(%connection_id, error = %e, "connection disconnected before PeerRegister could be sent");
        }
    }

    fn send_topology_get_peers(&self, connection_id: &ConnectionId) {
        let payload = bincode::serialize(&GetPeersRequest {}).unwrap_or_default();
        // No-op reply callback: responses arrive as unsolicited messages, not
        // through this callback (§4.2.3, §9 — racing a close here reopened a
        // bug in the original implementation).
        if let Err(e) = self.transport.send(
            MessageType::GossipGetPeersRequest,
            payload,
            connection_id,
            false,
            Some(Box::new(|_ack| {})),
        ) {
            debug!(%connection_id, error = %e, "connection disconnected before GetPeers could be sent");
        }
    }

    /// §4.2.5: close a non-peer connection. Peer closure goes through
    /// `Gossip::unregister_peer` instead.
    pub(crate) fn remove_temporary_connection(&self, connection_id: &ConnectionId) {
        let mut cm = self.shared.cm.lock().unwrap();
        match cm.connection_status.get(connection_id) {
            Some(PeerStatus::Temp) => {
                debug!(%connection_id, "closing temporary connection");
                let _ = self.transport.send(
                    MessageType::NetworkDisconnect,
                    bincode::serialize(&NetworkDisconnect {}).unwrap_or_default(),
                    connection_id,
                    true,
                    None,
                );
                self.transport.remove_connection(connection_id);
                cm.connection_status.remove(connection_id);
            }
            Some(PeerStatus::Peer) => {
                debug!(%connection_id, "ignoring close request for a registered peer");
            }
            _ => debug!(%connection_id, "ignoring close request for unknown connection"),
        }
    }
}

/// Out-of-line because it's invoked from a `'static` closure handed to
/// Transport, after `ConnectionManager`'s own borrow has ended (§4.2.4).
fn peer_callback(
    shared: &Arc<Shared>,
    transport: &Arc<dyn Transport>,
    gossip: Weak<Gossip>,
    connection_id: &ConnectionId,
    endpoint: &Endpoint,
    ack: NetworkAcknowledgement,
) {
    let gossip = match gossip.upgrade() {
        Some(g) => g,
        None => return,
    };
    match ack.status {
        AckStatus::Ok => {
            debug!(%connection_id, %endpoint, "peering request succeeded");
            match gossip.register_peer(connection_id.clone(), endpoint.clone()) {
                Ok(()) => gossip.send_block_request(crate::wire::HEAD_BLOCK_ID, connection_id),
                Err(Error::PeerRejected(reason)) => {
                    warn!(%connection_id, %endpoint, %reason, "unable to peer");
                    close_temporary(shared, transport, connection_id);
                }
                Err(e) => error!(%connection_id, error = %e, "unexpected error registering peer"),
            }
        }
        AckStatus::Error | AckStatus::Unknown => {
            debug!(%connection_id, %endpoint, "peering request was not successful");
            close_temporary(shared, transport, connection_id);
        }
    }
}

fn notify_disconnected(gossip: &Gossip, public_keys: Vec<crate::domain::PublicKey>) {
    gossip.notify_disconnected(public_keys);
}

fn close_temporary(shared: &Arc<Shared>, transport: &Arc<dyn Transport>, connection_id: &ConnectionId) {
    let mut cm = shared.cm.lock().unwrap();
    if matches!(cm.connection_status.get(connection_id), Some(PeerStatus::Temp)) {
        let _ = transport.send(
            MessageType::NetworkDisconnect,
            bincode::serialize(&NetworkDisconnect {}).unwrap_or_default(),
            connection_id,
            true,
            None,
        );
        transport.remove_connection(connection_id);
        cm.connection_status.remove(connection_id);
    }
}
