//! src/transport/tls.rs
//!
//! Manages the configuration of TLS for QUIC using a private PKI.

use crate::error::{Error, Result};
use quinn::{ClientConfig, ServerConfig};
use std::{fs, path::Path, sync::Arc};

/// ALPN identifier negotiated by both ends; a peer presenting a different
/// protocol under this private CA is rejected during the handshake.
const ALPN_PROTOCOL: &[u8] = b"gossip/1.0";

/// Configures TLS for the client and server using a shared private CA.
/// Expects `ca.cert`, `node.cert`, and `node.key` files under `cert_dir`.
pub fn configure_tls(cert_dir: &Path) -> Result<(ServerConfig, ClientConfig)> {
    let ca_cert_der = fs::read(cert_dir.join("ca.cert")).map_err(|e| {
        Error::TlsConfig(format!("failed to read CA certificate (ca.cert): {e}"))
    })?;
    let ca_cert = rustls::Certificate(ca_cert_der);

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(&ca_cert)
        .map_err(|e| Error::TlsConfig(format!("failed to add CA to root store: {e}")))?;

    let mut client_crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    let client_config = ClientConfig::new(Arc::new(client_crypto));

    let cert_chain_der = fs::read(cert_dir.join("node.cert")).map_err(|e| {
        Error::TlsConfig(format!("failed to read node certificate (node.cert): {e}"))
    })?;
    let key_der = fs::read(cert_dir.join("node.key")).map_err(|e| {
        Error::TlsConfig(format!("failed to read node private key (node.key): {e}"))
    })?;
    let cert_chain = vec![rustls::Certificate(cert_chain_der)];
    let key = rustls::PrivateKey(key_der);

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsConfig(format!("failed to build server TLS config: {e}")))?;
    server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(server_crypto));
    let transport_config = Arc::get_mut(&mut server_config.transport).unwrap();
    transport_config.keep_alive_interval(Some(std::time::Duration::from_secs(10)));

    Ok((server_config, client_config))
}