//! src/transport/mod.rs
//!
//! Defines the `Transport` capability surface consumed by `gossip` and
//! `connection_manager`, plus the concrete QUIC implementation that makes the
//! crate runnable end to end.
//!
//! The core never downcasts to the concrete implementation: it only sees
//! `dyn Transport`. `gossip`/`connection_manager` call these methods both
//! under their own locks and outside them; implementations must be safe for
//! that (§5 of the design: "Transport is assumed thread-safe").

pub mod certs;
pub mod quic;
pub mod tls;

use crate::domain::{ConnectionId, Endpoint, PublicKey};
use crate::error::Result;
use crate::wire::{MessageType, NetworkAcknowledgement};

/// Invoked once, off the caller's lock, when a reply to a `send` arrives (or
/// never, if the connection dies first). Used for the `PeerRegister` ack and
/// deliberately left a no-op for topology `GetPeers` requests (see
/// `connection_manager::connect_success`).
pub type ReplyCallback = Box<dyn FnOnce(NetworkAcknowledgement) + Send>;

/// The network capability surface the gossip overlay depends on. Dialing,
/// handshake completion, and raw send/receive are Transport's job; the core
/// only needs to be able to name a connection, ask about its state, and move
/// bytes across it.
pub trait Transport: Send + Sync {
    /// Send `payload` tagged with `msg_type` over `connection_id`. May fail
    /// with `Error::InvalidConnection` if the connection is gone; callers
    /// must treat that as "drop this connection_id from my bookkeeping", not
    /// propagate further. `callback`, if given, fires once a reply arrives.
    fn send(
        &self,
        msg_type: MessageType,
        payload: Vec<u8>,
        connection_id: &ConnectionId,
        one_way: bool,
        callback: Option<ReplyCallback>,
    ) -> Result<()>;

    /// Begin dialing `endpoint`. Returns immediately with a fresh
    /// `connection_id`; completion is reported asynchronously: real
    /// implementations drive `ConnectionManager::connect_success` once the
    /// handshake finishes, and until then
    /// `is_connection_handshake_complete` reports `false`.
    fn add_outbound_connection(&self, endpoint: &Endpoint) -> Result<ConnectionId>;

    /// Tear down a connection. Best-effort; errors are not surfaced because
    /// every caller treats "already gone" the same as "now gone".
    fn remove_connection(&self, connection_id: &ConnectionId);

    fn has_connection(&self, connection_id: &ConnectionId) -> bool;

    fn is_connection_handshake_complete(&self, connection_id: &ConnectionId) -> bool;

    fn get_connection_id_by_endpoint(&self, endpoint: &Endpoint) -> Option<ConnectionId>;

    fn connection_id_to_endpoint(&self, connection_id: &ConnectionId) -> Option<Endpoint>;

    fn connection_id_to_public_key(&self, connection_id: &ConnectionId) -> Option<PublicKey>;

    fn public_key_to_connection_id(&self, public_key: &PublicKey) -> Option<ConnectionId>;
}

/// Sink for application-level gossip traffic (blocks, batches, consensus
/// frames, and the request variants of each) whose encoded formats are out of
/// scope for this crate (§1). The production Transport hands decoded frames
/// here; tests and embedders that don't care about a particular frame kind
/// can rely on the default no-op.
pub trait ApplicationMessageSink: Send + Sync {
    fn on_block(&self, _connection_id: &ConnectionId, _content: &[u8], _time_to_live: u32) {}
    fn on_batch(&self, _connection_id: &ConnectionId, _content: &[u8], _time_to_live: u32) {}
    fn on_consensus_message(
        &self,
        _connection_id: &ConnectionId,
        _content: &[u8],
        _time_to_live: u32,
    ) {
    }
    fn on_block_request(&self, _connection_id: &ConnectionId, _block_id: &str) {}
    fn on_batch_by_batch_id_request(&self, _connection_id: &ConnectionId, _batch_id: &str) {}
    fn on_batch_by_transaction_id_request(
        &self,
        _connection_id: &ConnectionId,
        _transaction_ids: &[String],
    ) {
    }
}

/// An `ApplicationMessageSink` that discards everything, for embedders that
/// only care about connectivity.
pub struct NullApplicationMessageSink;
impl ApplicationMessageSink for NullApplicationMessageSink {}
