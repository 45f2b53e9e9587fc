//! tests/integration/max_peers.rs
//!
//! Scenarios 4 and 5: a peer-register reply that arrives once the peer map
//! is already full, and an abandoned peer swept aside by a fresh register
//! for the same endpoint.

use std::sync::Arc;
use std::time::Duration;

use validator_gossip::connection_manager::ManagerConfig;
use validator_gossip::consensus::{ChannelConsensusNotifier, PeerEvent};
use validator_gossip::domain::{ConnectionId, Endpoint, PeeringMode, PublicKey};
use validator_gossip::error::{Error, PeerRejectedReason};
use validator_gossip::gossip::Gossip;
use validator_gossip::health::RecordingHealthSink;
use validator_gossip::settings::StaticSettingsCache;
use validator_gossip::wire::{AckStatus, MessageType};

use crate::common::harness::{wait_until, FakeTransport};

fn short_manager_config() -> ManagerConfig {
    ManagerConfig {
        self_endpoint: None,
        static_peer_endpoints: Vec::new(),
        seed_endpoints: Vec::new(),
        peering_mode: PeeringMode::Dynamic,
        min_peers: 5,
        check_frequency: Duration::from_millis(5),
        initial_retry_frequency: Duration::from_millis(20),
        maximum_retry_frequency: Duration::from_millis(80),
        maximum_static_retry_frequency: Duration::from_millis(80),
        maximum_static_retries: 2,
        ticks_before_reboot: 10_000,
        response_wait: Duration::from_millis(5),
    }
}

#[test]
fn register_reply_at_max_peers_closes_connection_as_temporary() {
    let transport = FakeTransport::new();
    let (consensus, mut events) = ChannelConsensusNotifier::new();
    let gossip = Gossip::new(
        transport.clone(),
        Arc::new(consensus),
        Arc::new(StaticSettingsCache::default()),
        None,
        1,
    );

    gossip.start(
        short_manager_config(),
        Arc::new(RecordingHealthSink::new()),
        Box::new(|| None),
    );

    // Fill the single peer slot directly, bypassing dial/handshake.
    let existing = ConnectionId("existing".into());
    transport.complete_handshake(&existing, PublicKey(b"node-existing".to_vec()));
    gossip
        .register_peer(existing, Endpoint::from("tcp://existing:1"))
        .unwrap();
    assert_eq!(gossip.get_peers().len(), 1);

    // Now walk a fourth connection through the normal PEERING handshake path.
    gossip.add_candidate_peer_endpoints(vec![Endpoint::from("tcp://d:1")]);
    assert!(wait_until(Duration::from_secs(2), || {
        transport.dial_count(&Endpoint::from("tcp://d:1")) >= 1
    }));
    let connection_id = transport
        .connection_id_for(&Endpoint::from("tcp://d:1"))
        .expect("candidate was dialed");
    transport.complete_handshake(&connection_id, PublicKey(b"node-d".to_vec()));
    gossip.connect_success(&connection_id);

    assert!(wait_until(Duration::from_secs(1), || {
        transport
            .sent_messages()
            .iter()
            .any(|(t, _, id, _)| *t == MessageType::GossipRegister && id == &connection_id)
    }));
    assert!(transport.ack_oldest(MessageType::GossipRegister, AckStatus::Ok));

    // The peer map must stay exactly as it was: the reply is rejected with
    // max_reached and the offending connection is closed, not promoted.
    assert!(wait_until(Duration::from_secs(1), || {
        transport
            .sent_messages()
            .iter()
            .any(|(t, _, id, _)| *t == MessageType::NetworkDisconnect && id == &connection_id)
    }));
    assert_eq!(gossip.get_peers().len(), 1);
    assert!(!gossip.get_peers().contains_key(&connection_id));

    // Only the original peer's connect notification fired, never one for the
    // rejected connection.
    let event = events.try_recv().expect("original peer notified once");
    assert!(matches!(event, PeerEvent::Connected(_)));
    assert!(events.try_recv().is_err(), "no further peer events expected");

    gossip.stop();
}

#[test]
fn fresh_register_sweeps_a_stale_peer_at_the_same_endpoint() {
    let transport = FakeTransport::new();
    let (consensus, mut events) = ChannelConsensusNotifier::new();
    let gossip = Gossip::new(
        transport.clone(),
        Arc::new(consensus),
        Arc::new(StaticSettingsCache::default()),
        None,
        5,
    );

    let endpoint = Endpoint::from("tcp://p:1");
    let stale = ConnectionId("stale".into());
    transport.complete_handshake(&stale, PublicKey(b"node-p".to_vec()));
    gossip.register_peer(stale.clone(), endpoint.clone()).unwrap();
    let _ = events.try_recv();

    // A new connection to the same endpoint (Transport no longer reports the
    // old connection's handshake as complete, simulating a silently-dead link).
    let err = gossip
        .register_peer(ConnectionId("fresh".into()), endpoint)
        .unwrap_err();
    assert!(matches!(err, Error::PeerRejected(PeerRejectedReason::AlreadyConnected)));

    assert!(!gossip.get_peers().contains_key(&stale));
    assert!(!gossip.get_peers().contains_key(&ConnectionId("fresh".into())));

    let event = events.try_recv().expect("stale peer's disconnect was notified");
    assert!(matches!(event, PeerEvent::Disconnected(_)));

    gossip.stop();
}
