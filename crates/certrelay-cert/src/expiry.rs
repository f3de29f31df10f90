//! Leaf certificate expiry checks

use chrono::{DateTime, Duration, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExpiryError {
    #[error("Failed to parse certificate PEM: {0}")]
    Pem(String),

    #[error("No certificate found in PEM data")]
    Empty,

    #[error("Failed to parse certificate: {0}")]
    X509(String),
}

/// Expiry of the first certificate in a PEM bundle
pub fn leaf_not_after(cert_pem: &[u8]) -> Result<DateTime<Utc>, ExpiryError> {
    let leaf = rustls_pemfile::certs(&mut &cert_pem[..])
        .next()
        .ok_or(ExpiryError::Empty)?
        .map_err(|e| ExpiryError::Pem(e.to_string()))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| ExpiryError::X509(e.to_string()))?;

    Utc.timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| ExpiryError::X509("not_after out of range".to_string()))
}

/// Whether a certificate expires within `renew_before` of `now`
///
/// Unparseable certificates always need renewal.
pub fn needs_renewal(cert_pem: &[u8], renew_before: Duration, now: DateTime<Utc>) -> bool {
    match leaf_not_after(cert_pem) {
        Ok(not_after) => not_after - now < renew_before,
        Err(e) => {
            tracing::warn!("Treating unreadable certificate as due for renewal: {}", e);
            true
        }
    }
}

/// Whether the certificate is past its expiry; unparseable counts as expired
pub fn is_expired(cert_pem: &[u8], now: DateTime<Utc>) -> bool {
    leaf_not_after(cert_pem).map_or(true, |not_after| not_after <= now)
}
