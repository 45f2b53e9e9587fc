//! src/transport/quic.rs
//!
//! The production `Transport`: QUIC connections over `quinn`, with a tokio
//! runtime driving accept/dial loops and per-stream request/reply framing.
//! `gossip`/`connection_manager` only ever see `dyn Transport`; this is the
//! implementation that makes the crate runnable end to end (§10.5).
//!
//! Framing is deliberately simple, following the teacher's single
//! `read_to_end` style: one message per stream, a one-byte type tag followed
//! by a bincode payload. Non-one-way sends open a bidirectional stream and
//! read back a `NetworkAcknowledgement`; one-way sends use a unidirectional
//! stream and expect nothing back.

use crate::domain::{ConnectionId, Endpoint, PublicKey};
use crate::error::{Error, Result};
use crate::gossip::Gossip;
use crate::transport::{certs, tls, ApplicationMessageSink, ReplyCallback, Transport};
use crate::wire::{
    AckStatus, GetPeersResponse, GossipBatchByBatchIdRequest, GossipBatchByTransactionIdRequest,
    GossipBlockRequest, GossipContentType, GossipMessage, MessageType, NetworkAcknowledgement,
    PeerRegisterRequest,
};
use quinn::{Connection, Endpoint as QuinnEndpoint};
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Sanity ceiling on a single framed message, matching the original's
/// defensive read limit.
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

fn generate_connection_id() -> ConnectionId {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    ConnectionId(hex::encode(bytes))
}

fn tag(msg_type: MessageType) -> u8 {
    match msg_type {
        MessageType::GossipMessage => 0,
        MessageType::GossipBlockRequest => 1,
        MessageType::GossipBatchByBatchIdRequest => 2,
        MessageType::GossipBatchByTransactionIdRequest => 3,
        MessageType::GossipRegister => 4,
        MessageType::GossipUnregister => 5,
        MessageType::GossipGetPeersRequest => 6,
        MessageType::GossipGetPeersResponse => 7,
        MessageType::NetworkDisconnect => 8,
    }
}

fn from_tag(tag: u8) -> Option<MessageType> {
    Some(match tag {
        0 => MessageType::GossipMessage,
        1 => MessageType::GossipBlockRequest,
        2 => MessageType::GossipBatchByBatchIdRequest,
        3 => MessageType::GossipBatchByTransactionIdRequest,
        4 => MessageType::GossipRegister,
        5 => MessageType::GossipUnregister,
        6 => MessageType::GossipGetPeersRequest,
        7 => MessageType::GossipGetPeersResponse,
        8 => MessageType::NetworkDisconnect,
        _ => return None,
    })
}

fn decode_frame(bytes: &[u8]) -> Option<(MessageType, Vec<u8>)> {
    let (&tag_byte, payload) = bytes.split_first()?;
    let msg_type = from_tag(tag_byte)?;
    Some((msg_type, payload.to_vec()))
}

fn parse_endpoint(endpoint: &Endpoint) -> Result<SocketAddr> {
    let addr_part = endpoint.0.rsplit("://").next().unwrap_or(&endpoint.0);
    addr_part
        .parse()
        .map_err(|_| Error::TlsConfig(format!("endpoint {endpoint} is not a host:port URI")))
}

/// A peer's identity is its leaf TLS certificate, DER-encoded. `PublicKey` is
/// an opaque byte string as far as this crate is concerned; the certificate
/// already binds that identity cryptographically during the handshake.
fn extract_public_key(connection: &Connection) -> Option<PublicKey> {
    let certs = connection
        .peer_identity()?
        .downcast::<Vec<rustls::Certificate>>()
        .ok()?;
    certs.first().map(|cert| PublicKey(cert.0.clone()))
}

struct ConnEntry {
    connection: Option<Connection>,
    endpoint: Option<Endpoint>,
    public_key: Option<PublicKey>,
    handshake_complete: bool,
}

#[derive(Default)]
struct State {
    connections: HashMap<ConnectionId, ConnEntry>,
    by_endpoint: HashMap<Endpoint, ConnectionId>,
}

pub struct QuicTransport {
    endpoint: QuinnEndpoint,
    runtime: tokio::runtime::Handle,
    state: Mutex<State>,
    gossip: Mutex<Option<Weak<Gossip>>>,
    self_weak: Mutex<Option<Weak<QuicTransport>>>,
    sink: Arc<dyn ApplicationMessageSink>,
}

impl QuicTransport {
    /// Binds `bind_addr`, bootstrapping dev certificates under `cert_dir` if
    /// none exist yet, and spawns the accept loop on `runtime`.
    pub fn new(
        bind_addr: SocketAddr,
        cert_dir: &Path,
        subject_alt_names: &[String],
        sink: Arc<dyn ApplicationMessageSink>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Arc<Self>> {
        certs::ensure_dev_certs(cert_dir, subject_alt_names)?;
        let (server_config, client_config) = tls::configure_tls(cert_dir)?;

        let mut endpoint = QuinnEndpoint::server(server_config, bind_addr)?;
        endpoint.set_default_client_config(client_config);

        let this = Arc::new(Self {
            endpoint,
            runtime,
            state: Mutex::new(State::default()),
            gossip: Mutex::new(None),
            self_weak: Mutex::new(None),
            sink,
        });
        *this.self_weak.lock().unwrap() = Some(Arc::downgrade(&this));
        Arc::clone(&this).spawn_accept_loop();
        Ok(this)
    }

    /// Wires the transport to the `Gossip` it serves. `Gossip::new` needs a
    /// transport handle first, so the two are connected after the fact
    /// rather than at construction.
    pub fn attach_gossip(&self, gossip: Weak<Gossip>) {
        *self.gossip.lock().unwrap() = Some(gossip);
    }

    fn arc(&self) -> Arc<Self> {
        self.self_weak
            .lock()
            .unwrap()
            .clone()
            .and_then(|w| w.upgrade())
            .expect("QuicTransport always holds its own Arc")
    }

    fn gossip(&self) -> Option<Arc<Gossip>> {
        self.gossip.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn spawn_accept_loop(self: Arc<Self>) {
        let endpoint = self.endpoint.clone();
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            while let Some(connecting) = endpoint.accept().await {
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    match connecting.await {
                        Ok(connection) => this.adopt_inbound(connection).await,
                        Err(e) => warn!(error = %e, "inbound handshake failed"),
                    }
                });
            }
        });
    }

    async fn adopt_inbound(self: Arc<Self>, connection: Connection) {
        let connection_id = generate_connection_id();
        debug!(%connection_id, remote = %connection.remote_address(), "accepted inbound connection");
        {
            let mut state = self.state.lock().unwrap();
            state.connections.insert(
                connection_id.clone(),
                ConnEntry {
                    connection: Some(connection.clone()),
                    endpoint: None,
                    public_key: extract_public_key(&connection),
                    handshake_complete: true,
                },
            );
        }
        self.drive_connection(connection_id, connection).await;
    }

    fn dial(self: &Arc<Self>, endpoint: &Endpoint) -> Result<ConnectionId> {
        let addr = parse_endpoint(endpoint)?;
        let connection_id = generate_connection_id();
        {
            let mut state = self.state.lock().unwrap();
            state.connections.insert(
                connection_id.clone(),
                ConnEntry {
                    connection: None,
                    endpoint: Some(endpoint.clone()),
                    public_key: None,
                    handshake_complete: false,
                },
            );
            state
                .by_endpoint
                .insert(endpoint.clone(), connection_id.clone());
        }

        let this = Arc::clone(self);
        let endpoint_value = endpoint.clone();
        let quinn_endpoint = self.endpoint.clone();
        let dial_id = connection_id.clone();
        self.runtime.spawn(async move {
            let connecting = match quinn_endpoint.connect(addr, "localhost") {
                Ok(c) => c,
                Err(e) => {
                    warn!(endpoint = %endpoint_value, error = %e, "failed to start dial");
                    this.state.lock().unwrap().connections.remove(&dial_id);
                    return;
                }
            };
            match connecting.await {
                Ok(connection) => {
                    {
                        let mut state = this.state.lock().unwrap();
                        if let Some(entry) = state.connections.get_mut(&dial_id) {
                            entry.public_key = extract_public_key(&connection);
                            entry.connection = Some(connection.clone());
                            entry.handshake_complete = true;
                        }
                    }
                    if let Some(gossip) = this.gossip() {
                        gossip.connect_success(&dial_id);
                    }
                    this.drive_connection(dial_id, connection).await;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint_value, error = %e, "outbound handshake failed");
                    this.state.lock().unwrap().connections.remove(&dial_id);
                }
            }
        });

        Ok(connection_id)
    }

    async fn drive_connection(self: Arc<Self>, connection_id: ConnectionId, connection: Connection) {
        loop {
            tokio::select! {
                stream = connection.accept_bi() => {
                    match stream {
                        Ok((send, recv)) => {
                            let this = Arc::clone(&self);
                            let id = connection_id.clone();
                            tokio::spawn(async move { this.handle_bi_stream(id, send, recv).await; });
                        }
                        Err(e) => {
                            debug!(%connection_id, error = %e, "connection closing");
                            break;
                        }
                    }
                }
                stream = connection.accept_uni() => {
                    match stream {
                        Ok(recv) => {
                            let this = Arc::clone(&self);
                            let id = connection_id.clone();
                            tokio::spawn(async move { this.handle_uni_stream(id, recv).await; });
                        }
                        Err(e) => {
                            debug!(%connection_id, error = %e, "connection closing");
                            break;
                        }
                    }
                }
            }
        }
        self.teardown(&connection_id);
    }

    fn teardown(&self, connection_id: &ConnectionId) {
        let endpoint = {
            let mut state = self.state.lock().unwrap();
            state.connections.remove(connection_id).and_then(|e| e.endpoint)
        };
        if let Some(endpoint) = endpoint {
            self.state.lock().unwrap().by_endpoint.remove(&endpoint);
        }
        if let Some(gossip) = self.gossip() {
            gossip.unregister_peer(connection_id);
        }
    }

    async fn handle_uni_stream(self: Arc<Self>, connection_id: ConnectionId, mut recv: quinn::RecvStream) {
        let bytes = match recv.read_to_end(MAX_MESSAGE_SIZE).await {
            Ok(b) => b,
            Err(e) => {
                debug!(%connection_id, error = %e, "failed reading one-way stream");
                return;
            }
        };
        let Some((msg_type, payload)) = decode_frame(&bytes) else {
            warn!(%connection_id, "discarding malformed frame");
            return;
        };
        self.dispatch_one_way(&connection_id, msg_type, &payload);
    }

    async fn handle_bi_stream(
        self: Arc<Self>,
        connection_id: ConnectionId,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) {
        let bytes = match recv.read_to_end(MAX_MESSAGE_SIZE).await {
            Ok(b) => b,
            Err(e) => {
                debug!(%connection_id, error = %e, "failed reading request stream");
                return;
            }
        };
        let Some((msg_type, payload)) = decode_frame(&bytes) else {
            warn!(%connection_id, "discarding malformed request");
            return;
        };
        let ack = self.dispatch_request(&connection_id, msg_type, &payload);
        let ack_bytes = bincode::serialize(&ack).unwrap_or_default();
        if let Err(e) = send.write_all(&ack_bytes).await {
            debug!(%connection_id, error = %e, "failed to write reply");
            return;
        }
        let _ = send.finish().await;
    }

    fn dispatch_one_way(&self, connection_id: &ConnectionId, msg_type: MessageType, payload: &[u8]) {
        let Some(gossip) = self.gossip() else { return };
        match msg_type {
            MessageType::NetworkDisconnect => {
                debug!(%connection_id, "peer requested disconnect");
                gossip.unregister_peer(connection_id);
                self.remove_connection(connection_id);
            }
            MessageType::GossipUnregister => gossip.unregister_peer(connection_id),
            MessageType::GossipGetPeersResponse => {
                if let Ok(response) = bincode::deserialize::<GetPeersResponse>(payload) {
                    gossip.add_candidate_peer_endpoints(response.peer_endpoints);
                }
            }
            MessageType::GossipMessage => {
                if let Ok(message) = bincode::deserialize::<GossipMessage>(payload) {
                    match message.content_type {
                        GossipContentType::Block => {
                            self.sink.on_block(connection_id, &message.content, message.time_to_live)
                        }
                        GossipContentType::Batch => {
                            self.sink.on_batch(connection_id, &message.content, message.time_to_live)
                        }
                        GossipContentType::Consensus => self.sink.on_consensus_message(
                            connection_id,
                            &message.content,
                            message.time_to_live,
                        ),
                    }
                }
            }
            MessageType::GossipBlockRequest => {
                if let Ok(request) = bincode::deserialize::<GossipBlockRequest>(payload) {
                    self.sink.on_block_request(connection_id, &request.block_id);
                }
            }
            MessageType::GossipBatchByBatchIdRequest => {
                if let Ok(request) = bincode::deserialize::<GossipBatchByBatchIdRequest>(payload) {
                    self.sink
                        .on_batch_by_batch_id_request(connection_id, &request.id);
                }
            }
            MessageType::GossipBatchByTransactionIdRequest => {
                if let Ok(request) = bincode::deserialize::<GossipBatchByTransactionIdRequest>(payload) {
                    self.sink
                        .on_batch_by_transaction_id_request(connection_id, &request.ids);
                }
            }
            MessageType::GossipRegister | MessageType::GossipGetPeersRequest => {
                warn!(%connection_id, "request-style message arrived on a one-way stream");
            }
        }
    }

    fn dispatch_request(
        &self,
        connection_id: &ConnectionId,
        msg_type: MessageType,
        payload: &[u8],
    ) -> NetworkAcknowledgement {
        let Some(gossip) = self.gossip() else {
            return NetworkAcknowledgement { status: AckStatus::Error };
        };
        match msg_type {
            MessageType::GossipRegister => {
                let Ok(request) = bincode::deserialize::<PeerRegisterRequest>(payload) else {
                    return NetworkAcknowledgement { status: AckStatus::Error };
                };
                let endpoint = request
                    .endpoint
                    .unwrap_or_else(|| Endpoint(connection_id.0.clone()));
                {
                    let mut state = self.state.lock().unwrap();
                    if let Some(entry) = state.connections.get_mut(connection_id) {
                        entry.endpoint = Some(endpoint.clone());
                    }
                    state.by_endpoint.insert(endpoint.clone(), connection_id.clone());
                }
                match gossip.register_peer(connection_id.clone(), endpoint) {
                    Ok(()) => {
                        gossip.send_peers(connection_id);
                        NetworkAcknowledgement { status: AckStatus::Ok }
                    }
                    Err(e) => {
                        debug!(%connection_id, error = %e, "rejecting peer registration");
                        NetworkAcknowledgement { status: AckStatus::Error }
                    }
                }
            }
            MessageType::GossipGetPeersRequest => {
                gossip.send_peers(connection_id);
                NetworkAcknowledgement { status: AckStatus::Ok }
            }
            other => {
                self.dispatch_one_way(connection_id, other, payload);
                NetworkAcknowledgement { status: AckStatus::Ok }
            }
        }
    }
}

impl Transport for QuicTransport {
    fn send(
        &self,
        msg_type: MessageType,
        payload: Vec<u8>,
        connection_id: &ConnectionId,
        one_way: bool,
        callback: Option<ReplyCallback>,
    ) -> Result<()> {
        let connection = {
            let state = self.state.lock().unwrap();
            state
                .connections
                .get(connection_id)
                .and_then(|e| e.connection.clone())
        }
        .ok_or_else(|| Error::InvalidConnection(connection_id.clone()))?;

        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(tag(msg_type));
        frame.extend_from_slice(&payload);

        let connection_id = connection_id.clone();
        self.runtime.spawn(async move {
            if one_way {
                match connection.open_uni().await {
                    Ok(mut send) => {
                        if let Err(e) = send.write_all(&frame).await {
                            debug!(%connection_id, error = %e, "failed to write one-way message");
                        }
                        let _ = send.finish().await;
                    }
                    Err(e) => debug!(%connection_id, error = %e, "failed to open one-way stream"),
                }
                return;
            }

            let (mut send, mut recv) = match connection.open_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(%connection_id, error = %e, "failed to open request stream");
                    return;
                }
            };
            if let Err(e) = send.write_all(&frame).await {
                debug!(%connection_id, error = %e, "failed to write request");
                return;
            }
            if let Err(e) = send.finish().await {
                debug!(%connection_id, error = %e, "failed to finish request stream");
                return;
            }
            match recv.read_to_end(MAX_MESSAGE_SIZE).await {
                Ok(bytes) => {
                    if let (Ok(ack), Some(callback)) =
                        (bincode::deserialize::<NetworkAcknowledgement>(&bytes), callback)
                    {
                        callback(ack);
                    }
                }
                Err(e) => debug!(%connection_id, error = %e, "failed reading reply"),
            }
        });
        Ok(())
    }

    fn add_outbound_connection(&self, endpoint: &Endpoint) -> Result<ConnectionId> {
        self.arc().dial(endpoint)
    }

    fn remove_connection(&self, connection_id: &ConnectionId) {
        let entry = self.state.lock().unwrap().connections.remove(connection_id);
        if let Some(entry) = entry {
            if let Some(endpoint) = entry.endpoint {
                self.state.lock().unwrap().by_endpoint.remove(&endpoint);
            }
            if let Some(connection) = entry.connection {
                connection.close(0u32.into(), b"closed");
            }
        }
    }

    fn has_connection(&self, connection_id: &ConnectionId) -> bool {
        self.state.lock().unwrap().connections.contains_key(connection_id)
    }

    fn is_connection_handshake_complete(&self, connection_id: &ConnectionId) -> bool {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(connection_id)
            .map(|e| e.handshake_complete)
            .unwrap_or(false)
    }

    fn get_connection_id_by_endpoint(&self, endpoint: &Endpoint) -> Option<ConnectionId> {
        self.state.lock().unwrap().by_endpoint.get(endpoint).cloned()
    }

    fn connection_id_to_endpoint(&self, connection_id: &ConnectionId) -> Option<Endpoint> {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(connection_id)
            .and_then(|e| e.endpoint.clone())
    }

    fn connection_id_to_public_key(&self, connection_id: &ConnectionId) -> Option<PublicKey> {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(connection_id)
            .and_then(|e| e.public_key.clone())
    }

    fn public_key_to_connection_id(&self, public_key: &PublicKey) -> Option<ConnectionId> {
        let state = self.state.lock().unwrap();
        state
            .connections
            .iter()
            .find(|(_, e)| e.public_key.as_ref() == Some(public_key))
            .map(|(id, _)| id.clone())
    }
}
