//! src/app.rs
//!
//! Defines the main `App` struct, which wires `Config` into a running
//! `Gossip` + `ConnectionManager` pair over a QUIC `Transport`, plus the
//! optional status API, and manages their shared lifecycle.

use crate::{
    api::ApiServer,
    config::Config,
    connection_manager::ManagerConfig,
    consensus::NullConsensusNotifier,
    error::Result,
    gossip::Gossip,
    health::ProcessExitHealthSink,
    settings::StaticSettingsCache,
    transport::{quic::QuicTransport, NullApplicationMessageSink},
};
use std::sync::Arc;

/// Encapsulates the entire application, including its configuration and the
/// lifecycle management of its concurrent services.
pub struct App {
    config: Config,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self { config })
    }

    /// The main run loop: builds the transport, starts the gossip overlay's
    /// reconciliation thread, optionally serves the status API, and waits
    /// for a shutdown signal before tearing everything down.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            bind_addr = %self.config.bind_addr,
            peering_mode = ?self.config.peering_mode,
            "🚀 starting gossip node"
        );

        let transport = QuicTransport::new(
            self.config.bind_addr,
            &self.config.cert_dir,
            &[self.config.bind_addr.ip().to_string()],
            Arc::new(NullApplicationMessageSink),
            tokio::runtime::Handle::current(),
        )?;

        let gossip = Gossip::new(
            transport.clone(),
            Arc::new(NullConsensusNotifier),
            Arc::new(StaticSettingsCache::default()),
            self.config.self_endpoint.clone(),
            self.config.max_peers,
        );
        transport.attach_gossip(Arc::downgrade(&gossip));

        let manager_config = ManagerConfig {
            self_endpoint: self.config.self_endpoint.clone(),
            static_peer_endpoints: self.config.peer_endpoints.clone(),
            seed_endpoints: self.config.seed_endpoints.clone(),
            peering_mode: self.config.peering_mode,
            min_peers: self.config.min_peers,
            check_frequency: self.config.check_frequency(),
            initial_retry_frequency: self.config.initial_retry_frequency(),
            maximum_retry_frequency: self.config.maximum_retry_frequency(),
            maximum_static_retry_frequency: self.config.maximum_static_retry_frequency(),
            maximum_static_retries: self.config.maximum_static_retries,
            ticks_before_reboot: self.config.ticks_before_reboot,
            response_wait: self.config.response_wait(),
        };

        gossip.start(manager_config, Arc::new(ProcessExitHealthSink), Box::new(|| None));
        tracing::debug!("gossip service started");

        let api_task = if let Some(status_api) = self.config.status_api.clone() {
            tracing::info!(bind_addr = %status_api.bind_addr, "status API enabled");
            let api_server = ApiServer::new(
                status_api.bind_addr,
                Arc::clone(&gossip),
                self.config.min_peers,
                self.config.max_peers,
            );
            let shutdown = tokio_util::sync::CancellationToken::new();
            let task = tokio::spawn(api_server.run(shutdown.clone()));
            Some((task, shutdown))
        } else {
            None
        };

        tokio::signal::ctrl_c().await?;
        tracing::info!("Ctrl+C received. Initiating graceful shutdown...");

        gossip.stop();
        if let Some((task, shutdown)) = api_task {
            shutdown.cancel();
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "status API task failed");
            }
        }

        tracing::info!("👋 node has shut down gracefully");
        Ok(())
    }
}
