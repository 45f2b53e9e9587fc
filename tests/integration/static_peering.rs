//! tests/integration/static_peering.rs
//!
//! Scenarios 1 and 2 of the static-peering end-to-end properties: a
//! configured static peer that authorizes successfully, and one that never
//! does and is eventually given up on.

use std::sync::Arc;
use std::time::Duration;

use validator_gossip::connection_manager::ManagerConfig;
use validator_gossip::consensus::{ChannelConsensusNotifier, PeerEvent};
use validator_gossip::domain::{Endpoint, PeeringMode, PublicKey};
use validator_gossip::gossip::Gossip;
use validator_gossip::health::RecordingHealthSink;
use validator_gossip::settings::StaticSettingsCache;
use validator_gossip::wire::{AckStatus, MessageType};

use crate::common::harness::{wait_until, FakeTransport};

fn short_manager_config(static_peers: Vec<Endpoint>) -> ManagerConfig {
    ManagerConfig {
        self_endpoint: None,
        static_peer_endpoints: static_peers,
        seed_endpoints: Vec::new(),
        peering_mode: PeeringMode::Static,
        min_peers: 1,
        check_frequency: Duration::from_millis(5),
        initial_retry_frequency: Duration::from_millis(10),
        maximum_retry_frequency: Duration::from_millis(40),
        maximum_static_retry_frequency: Duration::from_millis(40),
        maximum_static_retries: 2,
        ticks_before_reboot: 10_000,
        response_wait: Duration::from_millis(5),
    }
}

#[test]
fn static_peering_happy_path() {
    let endpoint_a = Endpoint::from("tcp://a:1");
    let transport = FakeTransport::new();
    let (consensus, mut events) = ChannelConsensusNotifier::new();
    let gossip = Gossip::new(
        transport.clone(),
        Arc::new(consensus),
        Arc::new(StaticSettingsCache::default()),
        None,
        5,
    );

    gossip.start(
        short_manager_config(vec![endpoint_a.clone()]),
        Arc::new(RecordingHealthSink::new()),
        Box::new(|| None),
    );

    assert!(wait_until(Duration::from_secs(2), || transport.dial_count(&endpoint_a) >= 1));
    let connection_id = transport.connection_id_for(&endpoint_a).expect("dialed endpoint has a connection id");

    let public_key = PublicKey(b"node-a".to_vec());
    transport.complete_handshake(&connection_id, public_key.clone());
    gossip.connect_success(&connection_id);

    assert!(wait_until(Duration::from_secs(1), || {
        transport
            .sent_messages()
            .iter()
            .any(|(t, _, id, _)| *t == MessageType::GossipRegister && id == &connection_id)
    }));

    assert!(transport.ack_oldest(MessageType::GossipRegister, AckStatus::Ok));

    assert!(wait_until(Duration::from_secs(1), || {
        gossip.get_peers().get(&connection_id) == Some(&endpoint_a)
    }));

    assert!(wait_until(Duration::from_secs(1), || {
        transport
            .sent_messages()
            .iter()
            .any(|(t, _, id, _)| *t == MessageType::GossipBlockRequest && id == &connection_id)
    }));

    let event = events.try_recv().expect("peer-connected event was fired");
    assert_eq!(event, PeerEvent::Connected(public_key));

    gossip.stop();
}

#[test]
fn static_peering_gives_up_after_exhausting_retries() {
    let endpoint_b = Endpoint::from("tcp://b:1");
    let transport = FakeTransport::new();
    let gossip = Gossip::new(
        transport.clone(),
        Arc::new(validator_gossip::consensus::NullConsensusNotifier),
        Arc::new(StaticSettingsCache::default()),
        None,
        5,
    );

    gossip.start(
        short_manager_config(vec![endpoint_b.clone()]),
        Arc::new(RecordingHealthSink::new()),
        Box::new(|| None),
    );

    // Never authorize the connection: every temp connection times out and is
    // redialed until the static endpoint's retry budget is exhausted.
    assert!(wait_until(Duration::from_secs(2), || transport.dial_count(&endpoint_b) >= 3));

    let stopped_growing = wait_until(Duration::from_millis(500), {
        let mut last_seen = 0;
        let mut stable_since = std::time::Instant::now();
        move || {
            let current = transport.dial_count(&endpoint_b);
            if current != last_seen {
                last_seen = current;
                stable_since = std::time::Instant::now();
            }
            stable_since.elapsed() > Duration::from_millis(150)
        }
    });
    assert!(stopped_growing, "dial attempts never stopped growing");

    assert!(gossip.get_peers().is_empty());
    gossip.stop();
}
