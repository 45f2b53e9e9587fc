//! src/domain.rs
//!
//! Core data model shared by `gossip` and `connection_manager`: identifiers,
//! peering modes, and the bookkeeping records that track a connection from
//! dial to either peer promotion or teardown.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// An opaque identifier minted by [`crate::transport::Transport`], stable for
/// the lifetime of a single connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.0[..self.0.len().min(8)];
        write!(f, "{short}")
    }
}

/// A publicly reachable transport URI, e.g. `tcp://host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(pub String);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Endpoint(s.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(s: String) -> Self {
        Endpoint(s)
    }
}

/// A node's public key, as surfaced by Transport's identity mapping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub Vec<u8>);

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..self.0.len().min(4)]))
    }
}

/// How a validator discovers and dials peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeeringMode {
    Static,
    Dynamic,
}

/// Per-connection lifecycle status tracked by the `ConnectionManager`.
///
/// Invariant: a `connection_id` present in `Gossip`'s peer map always has
/// status `Peer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    /// Authorized but not yet promoted to peer.
    Temp,
    /// Registered and eligible for broadcasts.
    Peer,
    /// An explicit disconnect has been sent.
    Closed,
}

/// Why a temp connection was dialed: to become a peer, or just to ask its
/// peer list (topology discovery).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialIntent {
    Peering,
    Topology,
}

/// A temp-connection record: exists between dial and either promotion to
/// peer, fulfillment of a peer-list query, or timeout-and-retry.
#[derive(Clone, Debug)]
pub struct EndpointInfo {
    pub endpoint: Endpoint,
    pub intent: DialIntent,
    pub dialed_at: Instant,
    pub retry_threshold: Duration,
}

/// Per-statically-configured-endpoint bookkeeping, used only in static mode.
#[derive(Clone, Debug)]
pub struct StaticPeerInfo {
    pub connection_id: Option<ConnectionId>,
    pub last_attempt: Instant,
    pub retry_threshold: Duration,
    pub attempt_count: u32,
}

impl StaticPeerInfo {
    /// A record that has never been attempted. The original implementation
    /// stores `time=0` so that `now - last_attempt` is always huge on the
    /// first reconciliation pass; we get the same effect by backdating.
    pub fn fresh(retry_threshold: Duration) -> Self {
        Self {
            connection_id: None,
            last_attempt: Instant::now()
                .checked_sub(retry_threshold + Duration::from_secs(1))
                .unwrap_or_else(Instant::now),
            retry_threshold,
            attempt_count: 0,
        }
    }
}
