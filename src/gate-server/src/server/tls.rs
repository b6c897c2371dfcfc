//! TLS configuration for the server's listeners.

use crate::cert_manager::{CertificateError, ServerCertificate};
use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Load TLS certificates from PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening cert file {:?}", path))?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parsing certificates")
}

/// Load private key from PEM file
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening key file {:?}", path))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .context("parsing private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {:?}", path))
}

/// Load a [`ServerCertificate`] from separate certificate and key files.
pub fn load_server_certificate(cert_path: &Path, key_path: &Path) -> Result<ServerCertificate> {
    let mut pem = std::fs::read(cert_path)
        .with_context(|| format!("reading cert file {:?}", cert_path))?;
    pem.push(b'\n');
    pem.extend(
        std::fs::read(key_path).with_context(|| format!("reading key file {:?}", key_path))?,
    );
    ServerCertificate::from_pem(&pem).context("building server certificate")
}

/// Build a rustls server configuration presenting `cert`.
pub fn build_tls_server_config(
    cert: &ServerCertificate,
) -> Result<Arc<rustls::ServerConfig>, CertificateError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert.certificate_chain().to_vec(), cert.private_key())?;
    Ok(Arc::new(config))
}
