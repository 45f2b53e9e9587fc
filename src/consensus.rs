//! src/consensus.rs
//!
//! The consensus notifier peer up/down events are delivered to (§6). Calls
//! happen strictly after the corresponding peer-map mutation has been
//! committed, and always outside `Gossip`'s lock (§5, §9).

use crate::domain::PublicKey;
use tokio::sync::mpsc;

pub trait ConsensusNotifier: Send + Sync {
    fn notify_peer_connected(&self, public_key: &PublicKey);
    fn notify_peer_disconnected(&self, public_key: &PublicKey);
}

/// A notifier a peer-connectivity event was delivered for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PublicKey),
    Disconnected(PublicKey),
}

/// Forwards events over an unbounded channel for an embedder's consensus
/// engine to drain at its own pace, rather than running arbitrary callback
/// code under the caller's thread.
pub struct ChannelConsensusNotifier {
    sender: mpsc::UnboundedSender<PeerEvent>,
}

impl ChannelConsensusNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ConsensusNotifier for ChannelConsensusNotifier {
    fn notify_peer_connected(&self, public_key: &PublicKey) {
        let _ = self.sender.send(PeerEvent::Connected(public_key.clone()));
    }

    fn notify_peer_disconnected(&self, public_key: &PublicKey) {
        let _ = self
            .sender
            .send(PeerEvent::Disconnected(public_key.clone()));
    }
}

/// A `ConsensusNotifier` that discards every event, for embedders that don't
/// run consensus in-process.
pub struct NullConsensusNotifier;
impl ConsensusNotifier for NullConsensusNotifier {
    fn notify_peer_connected(&self, _public_key: &PublicKey) {}
    fn notify_peer_disconnected(&self, _public_key: &PublicKey) {}
}
