//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`. Defaults match
//! the production constants (§3): `INITIAL_RETRY_FREQUENCY`,
//! `MAXIMUM_RETRY_FREQUENCY`, `MAXIMUM_STATIC_RETRY_FREQUENCY`,
//! `MAXIMUM_STATIC_RETRIES`, `TICKS_BEFORE_REBOOT`, `RESPONSE_WAIT`, exposed
//! as overridable so tests can shrink them.

use crate::domain::{Endpoint, PeeringMode};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub peering_mode: PeeringMode,
    pub self_endpoint: Option<Endpoint>,
    /// Static mode: endpoints to dial and keep peered. Dynamic mode: also
    /// dialed, in addition to discovery through `seed_endpoints`.
    pub peer_endpoints: Vec<Endpoint>,
    /// Dynamic mode only: endpoints queried for peer-of-peer candidates.
    pub seed_endpoints: Vec<Endpoint>,
    pub min_peers: usize,
    pub max_peers: usize,
    pub check_frequency_secs: u64,
    pub initial_retry_frequency_secs: u64,
    pub maximum_retry_frequency_secs: u64,
    pub maximum_static_retry_frequency_secs: u64,
    pub maximum_static_retries: u32,
    pub ticks_before_reboot: u32,
    pub response_wait_secs: u64,
    pub bind_addr: SocketAddr,
    pub cert_dir: PathBuf,
    pub status_api: Option<StatusApiConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusApiConfig {
    pub bind_addr: SocketAddr,
}

impl Config {
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("GOSSIP_"))
            .extract()
    }

    pub fn check_frequency(&self) -> Duration {
        Duration::from_secs(self.check_frequency_secs)
    }

    pub fn initial_retry_frequency(&self) -> Duration {
        Duration::from_secs(self.initial_retry_frequency_secs)
    }

    pub fn maximum_retry_frequency(&self) -> Duration {
        Duration::from_secs(self.maximum_retry_frequency_secs)
    }

    pub fn maximum_static_retry_frequency(&self) -> Duration {
        Duration::from_secs(self.maximum_static_retry_frequency_secs)
    }

    pub fn response_wait(&self) -> Duration {
        Duration::from_secs(self.response_wait_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peering_mode: PeeringMode::Static,
            self_endpoint: None,
            peer_endpoints: Vec::new(),
            seed_endpoints: Vec::new(),
            min_peers: 3,
            max_peers: 10,
            check_frequency_secs: 1,
            initial_retry_frequency_secs: 10,
            maximum_retry_frequency_secs: 300,
            maximum_static_retry_frequency_secs: 3600,
            maximum_static_retries: 24,
            ticks_before_reboot: 300,
            response_wait_secs: 5,
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000),
            cert_dir: PathBuf::from("certs"),
            status_api: None,
        }
    }
}
