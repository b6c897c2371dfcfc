//! Certificate Manager
//!
//! Resolves the TLS certificate presented on each listening endpoint. The
//! access server is the source of truth; resolved certificates are cached
//! per endpoint until the cache is cleared. While the access server is in
//! maintenance a self-signed maintenance certificate (random DNS subject,
//! `OU=MT`) is served instead, so handshakes keep completing.

use crate::access_server::{AccessError, AccessServer};
use gate_common::{generate_maintenance_cert, CommonError, SelfSignedCert, MAINTENANCE_UNIT};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use x509_parser::prelude::*;

/// Default time the maintenance certificate is served before the access
/// server is asked again.
pub const DEFAULT_MAINTENANCE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("invalid PEM data: {0}")]
    Pem(String),

    #[error("no certificate found in PEM data")]
    NoCertificate,

    #[error("no private key found in PEM data")]
    NoPrivateKey,

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("access server error: {0}")]
    Access(#[from] AccessError),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] CommonError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Certificate chain plus private key, ready for rustls.
#[derive(Debug)]
pub struct ServerCertificate {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    common_name: Option<String>,
    organizational_unit: Option<String>,
}

impl ServerCertificate {
    /// Parse PEM data holding the certificate chain and the private key.
    pub fn from_pem(data: &[u8]) -> Result<Self, CertificateError> {
        let mut reader = data;
        let chain = certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertificateError::Pem(e.to_string()))?;
        let leaf = chain.first().ok_or(CertificateError::NoCertificate)?;
        let (common_name, organizational_unit) = parse_subject(leaf)?;

        let mut reader = data;
        let key = private_key(&mut reader)
            .map_err(|e| CertificateError::Pem(e.to_string()))?
            .ok_or(CertificateError::NoPrivateKey)?;

        Ok(Self {
            chain,
            key,
            common_name,
            organizational_unit,
        })
    }

    pub fn from_self_signed(cert: &SelfSignedCert) -> Result<Self, CertificateError> {
        Self::from_pem(cert.bundle_pem().as_bytes())
    }

    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Subject CN of the leaf certificate.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn organizational_unit(&self) -> Option<&str> {
        self.organizational_unit.as_deref()
    }

    pub fn is_maintenance(&self) -> bool {
        self.organizational_unit() == Some(MAINTENANCE_UNIT)
    }
}

fn parse_subject(cert: &CertificateDer<'_>) -> Result<(Option<String>, Option<String>), CertificateError> {
    let (_, x509) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| CertificateError::Parse(e.to_string()))?;
    let subject = x509.subject();
    let cn = subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    let ou = subject
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    Ok((cn, ou))
}

/// Per-endpoint certificate cache with maintenance fallback.
pub struct CertificateCache {
    access_server: Arc<dyn AccessServer>,
    certificates: RwLock<HashMap<SocketAddr, Arc<ServerCertificate>>>,
    maintenance_certificate: OnceCell<Arc<ServerCertificate>>,
    maintenance_check_interval: Duration,
    last_maintenance: Mutex<Instant>,
}

impl CertificateCache {
    /// A zero `maintenance_check_interval` disables caching entirely.
    pub fn new(access_server: Arc<dyn AccessServer>, maintenance_check_interval: Duration) -> Self {
        Self {
            access_server,
            certificates: RwLock::new(HashMap::new()),
            maintenance_certificate: OnceCell::new(),
            maintenance_check_interval,
            last_maintenance: Mutex::new(Instant::now()),
        }
    }

    /// Certificate to present on `endpoint`.
    pub async fn get_certificate(
        &self,
        endpoint: SocketAddr,
    ) -> Result<Arc<ServerCertificate>, CertificateError> {
        if self.access_server.is_maintenance_mode()
            && self.last_maintenance.lock().elapsed() < self.maintenance_check_interval
        {
            return self.maintenance_certificate().await;
        }

        if let Some(cert) = self.certificates.read().get(&endpoint) {
            debug!(%endpoint, "Certificate cache hit");
            return Ok(cert.clone());
        }

        match self.access_server.get_ssl_certificate_data(endpoint).await {
            Ok(data) => {
                let cert = Arc::new(ServerCertificate::from_pem(&data)?);
                if self.maintenance_check_interval.is_zero() {
                    return Ok(cert);
                }
                let cert = self
                    .certificates
                    .write()
                    .entry(endpoint)
                    .or_insert(cert)
                    .clone();
                debug!(%endpoint, cn = ?cert.common_name(), "Certificate cached");
                Ok(cert)
            }
            Err(AccessError::Maintenance) => {
                self.clear_cache();
                *self.last_maintenance.lock() = Instant::now();
                info!(%endpoint, "Access server in maintenance, serving maintenance certificate");
                self.maintenance_certificate().await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every cached certificate.
    pub fn clear_cache(&self) {
        let dropped = std::mem::take(&mut *self.certificates.write());
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Certificate cache cleared");
        }
    }

    pub fn cached_count(&self) -> usize {
        self.certificates.read().len()
    }

    pub fn maintenance_check_interval(&self) -> Duration {
        self.maintenance_check_interval
    }

    /// The self-signed maintenance certificate, generated on first use.
    pub async fn maintenance_certificate(&self) -> Result<Arc<ServerCertificate>, CertificateError> {
        self.maintenance_certificate
            .get_or_try_init(|| async {
                let cert = generate_maintenance_cert()?;
                info!(cn = %cert.common_name, "Maintenance certificate generated");
                ServerCertificate::from_self_signed(&cert).map(Arc::new)
            })
            .await
            .cloned()
    }
}
