//! src/wire.rs
//!
//! Wire messages exchanged with peers over Transport, and the message-type
//! tag used to route them. Payloads are opaque byte strings with a type tag
//! as far as the rest of the node is concerned (blocks/batches/consensus
//! frames); this module only defines the gossip-layer envelope.

use crate::domain::Endpoint;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// The only protocol version this implementation speaks or accepts.
pub const NETWORK_PROTOCOL_VERSION: u32 = 1;

/// Sentinel `block_id` meaning "send me your chain head".
pub const HEAD_BLOCK_ID: &str = "HEAD";

/// The validator-layer message-type tag carried alongside each payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    GossipMessage,
    GossipBlockRequest,
    GossipBatchByBatchIdRequest,
    GossipBatchByTransactionIdRequest,
    GossipRegister,
    GossipUnregister,
    GossipGetPeersRequest,
    GossipGetPeersResponse,
    NetworkDisconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipContentType {
    Block,
    Batch,
    Consensus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipMessage {
    pub content_type: GossipContentType,
    pub content: Vec<u8>,
    pub time_to_live: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipBlockRequest {
    pub block_id: String,
    pub nonce: String,
    pub time_to_live: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipBatchByBatchIdRequest {
    pub id: String,
    pub nonce: String,
    pub time_to_live: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipBatchByTransactionIdRequest {
    pub ids: Vec<String>,
    pub nonce: String,
    pub time_to_live: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRegisterRequest {
    pub endpoint: Option<Endpoint>,
    pub protocol_version: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PeerUnregisterRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetPeersRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetPeersResponse {
    pub peer_endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkDisconnect {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Ok,
    Error,
    /// Any value the wire format can carry that isn't `Ok`/`Error`. The
    /// protocol treats this identically to `Error` (close as temporary).
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkAcknowledgement {
    pub status: AckStatus,
}

/// A 16-byte random nonce, hex-encoded, used to differentiate duplicate
/// request-type messages.
pub fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
