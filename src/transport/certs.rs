//! src/transport/certs.rs
//!
//! Bootstraps a private-CA cert chain for nodes that don't already have one,
//! so `cargo run`/tests work without an operator pre-provisioning `certs/`
//! out of band. Not a general-purpose CA: one CA key signs every node cert
//! in a deployment, matching the private-PKI model `tls::configure_tls`
//! expects (§6: "authorization is membership in this private PKI").

use crate::error::{Error, Result};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, IsCa, SanType};
use std::fs;
use std::path::Path;

/// If `cert_dir` is missing `ca.cert`/`node.cert`/`node.key`, generates a
/// fresh self-signed CA and a node certificate signed by it, valid for the
/// given `subject_alt_names` (hostnames/IPs this node answers to). Existing
/// files are left untouched.
pub fn ensure_dev_certs(cert_dir: &Path, subject_alt_names: &[String]) -> Result<()> {
    let ca_path = cert_dir.join("ca.cert");
    let node_cert_path = cert_dir.join("node.cert");
    let node_key_path = cert_dir.join("node.key");
    if ca_path.exists() && node_cert_path.exists() && node_key_path.exists() {
        return Ok(());
    }

    fs::create_dir_all(cert_dir)?;

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_name = DistinguishedName::new();
    ca_name.push(DnType::CommonName, "gossip-overlay dev CA");
    ca_params.distinguished_name = ca_name;
    let ca_cert = Certificate::from_params(ca_params)
        .map_err(|e| Error::TlsConfig(format!("failed to generate dev CA: {e}")))?;

    let mut node_params = CertificateParams::default();
    let mut node_name = DistinguishedName::new();
    node_name.push(DnType::CommonName, "gossip-overlay node");
    node_params.distinguished_name = node_name;
    node_params.subject_alt_names = subject_alt_names
        .iter()
        .map(|s| SanType::DnsName(s.clone()))
        .collect();
    let node_cert = Certificate::from_params(node_params)
        .map_err(|e| Error::TlsConfig(format!("failed to generate node cert: {e}")))?;

    let ca_der = ca_cert
        .serialize_der()
        .map_err(|e| Error::TlsConfig(format!("failed to serialize CA cert: {e}")))?;
    let node_der = node_cert
        .serialize_der_with_signer(&ca_cert)
        .map_err(|e| Error::TlsConfig(format!("failed to serialize node cert: {e}")))?;
    let node_key_der = node_cert.serialize_private_key_der();

    fs::write(&ca_path, ca_der)?;
    fs::write(&node_cert_path, node_der)?;
    fs::write(&node_key_path, node_key_der)?;
    Ok(())
}
