//! tests/integration/dynamic_peering.rs
//!
//! Scenario 3: a node below its minimum peer count learns a candidate
//! endpoint from an unsolicited peer-list response and dials it.

use std::sync::Arc;
use std::time::Duration;

use validator_gossip::connection_manager::ManagerConfig;
use validator_gossip::consensus::NullConsensusNotifier;
use validator_gossip::domain::{Endpoint, PeeringMode, PublicKey};
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
        min_peers: 1,
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
fn dynamic_peering_discovers_and_peers_with_candidate() {
    let endpoint_c = Endpoint::from("tcp://c:1");
    let transport = FakeTransport::new();
    let gossip = Gossip::new(
        transport.clone(),
        Arc::new(NullConsensusNotifier),
        Arc::new(StaticSettingsCache::default()),
        None,
        5,
    );

    gossip.start(
        short_manager_config(),
        Arc::new(RecordingHealthSink::new()),
        Box::new(|| None),
    );

    // No peers and no candidates yet: the reconciliation loop has nothing to
    // dial.
    assert!(!wait_until(Duration::from_millis(100), || transport.dial_count(&endpoint_c) >= 1));

    // Simulate an unsolicited GetPeersResponse surfacing the candidate.
    // Keep re-delivering it: the candidate list is rebuilt every
    // reconciliation pass, so a single injection can land just before it
    // gets cleared.
    assert!(wait_until(Duration::from_secs(3), || {
        gossip.add_candidate_peer_endpoints(vec![endpoint_c.clone()]);
        transport.dial_count(&endpoint_c) >= 1
    }));

    let connection_id = transport
        .connection_id_for(&endpoint_c)
        .expect("dialed candidate has a connection id");

    let public_key = PublicKey(b"node-c".to_vec());
    transport.complete_handshake(&connection_id, public_key);
    gossip.connect_success(&connection_id);

    assert!(wait_until(Duration::from_secs(1), || {
        transport
            .sent_messages()
            .iter()
            .any(|(t, _, id, _)| *t == MessageType::GossipRegister && id == &connection_id)
    }));

    assert!(transport.ack_oldest(MessageType::GossipRegister, AckStatus::Ok));

    assert!(wait_until(Duration::from_secs(1), || {
        gossip.get_peers().get(&connection_id) == Some(&endpoint_c)
    }));

    gossip.stop();
}

#[test]
fn dynamic_peering_stays_idle_once_min_peers_met() {
    let transport = FakeTransport::new();
    let gossip = Gossip::new(
        transport.clone(),
        Arc::new(NullConsensusNotifier),
        Arc::new(StaticSettingsCache::default()),
        None,
        5,
    );

    let mut config = short_manager_config();
    config.min_peers = 0;
    gossip.start(config, Arc::new(RecordingHealthSink::new()), Box::new(|| None));

    let endpoint_d = Endpoint::from("tcp://d:1");
    std::thread::sleep(Duration::from_millis(100));
    gossip.add_candidate_peer_endpoints(vec![endpoint_d.clone()]);
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(transport.dial_count(&endpoint_d), 0, "already satisfied min_peers, should not dial");
    gossip.stop();
}
