//! src/api/mod.rs
//!
//! Optional operational status surface (§10.6): a small `axum` server
//! exposing the current peer list and connection counts. Off by default,
//! gated behind `Config::status_api`; not part of the gossip protocol
//! itself.

use crate::gossip::Gossip;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct ApiState {
    gossip: Arc<Gossip>,
    min_peers: usize,
    max_peers: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    peer_count: usize,
    min_peers: usize,
    max_peers: usize,
    peers: Vec<String>,
}

pub struct ApiServer {
    bind_addr: SocketAddr,
    gossip: Arc<Gossip>,
    min_peers: usize,
    max_peers: usize,
}

impl ApiServer {
    pub fn new(bind_addr: SocketAddr, gossip: Arc<Gossip>, min_peers: usize, max_peers: usize) -> Self {
        Self {
            bind_addr,
            gossip,
            min_peers,
            max_peers,
        }
    }

    pub async fn run(self, shutdown_token: CancellationToken) -> crate::error::Result<()> {
        let state = ApiState {
            gossip: self.gossip,
            min_peers: self.min_peers,
            max_peers: self.max_peers,
        };
        let app = Router::new().route("/status", get(status)).with_state(state);

        tracing::info!(listen_addr = %self.bind_addr, "status API listening");
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
                tracing::info!("status API received shutdown signal");
            })
            .await?;
        Ok(())
    }
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let peers = state.gossip.get_peers();
    Json(StatusResponse {
        peer_count: peers.len(),
        min_peers: state.min_peers,
        max_peers: state.max_peers,
        peers: peers.values().map(|e| e.to_string()).collect(),
    })
}
