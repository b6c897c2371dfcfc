//! Self-signed certificates for the server's TLS fallback path.
//!
//! The access server normally supplies the TLS certificate for each listening
//! endpoint. When it cannot (maintenance), the server presents a self-signed
//! certificate with a random DNS-like subject so that handshakes still
//! complete. Output is PEM so the private key stays exportable.

use crate::rng::random_dns_name;
use crate::{CommonError, Result};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};

/// Organizational unit carried by maintenance certificates.
pub const MAINTENANCE_UNIT: &str = "MT";

/// Validity of a generated self-signed certificate.
pub const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// Self-signed certificate with exportable key material
#[derive(Debug, Clone)]
pub struct SelfSignedCert {
    /// Subject common name (also the only SAN)
    pub common_name: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl SelfSignedCert {
    /// Certificate and key concatenated, the format access servers hand out.
    pub fn bundle_pem(&self) -> String {
        format!("{}\n{}", self.cert_pem, self.key_pem)
    }
}

/// Generate a self-signed server certificate for `common_name`.
pub fn generate_self_signed(common_name: &str, unit: Option<&str>) -> Result<SelfSignedCert> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CommonError::KeyGen(e.to_string()))?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    if let Some(unit) = unit {
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, unit);
    }
    params.subject_alt_names.push(SanType::DnsName(
        common_name.to_string().try_into().map_err(|e| {
            CommonError::Certificate(format!("invalid dns name {common_name}: {e}"))
        })?,
    ));

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(SELF_SIGNED_VALIDITY_DAYS);

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.self_signed(&key)?;

    Ok(SelfSignedCert {
        common_name: common_name.to_string(),
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Generate the maintenance certificate: random DNS subject, `OU=MT`.
pub fn generate_maintenance_cert() -> Result<SelfSignedCert> {
    generate_self_signed(&random_dns_name(), Some(MAINTENANCE_UNIT))
}
