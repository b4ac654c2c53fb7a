//! Self-signed certificate generation for development and testing
//!
//! Produces throwaway certificates valid for localhost. Production
//! deployments use static files, domain validation or the managed
//! authority instead.

use std::path::Path;
use std::time::{Duration, SystemTime};

use rcgen::{CertificateParams, DistinguishedName};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelfSignedError {
    #[error("certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),
}

/// A self-signed certificate with its private key.
pub struct SelfSignedCertificate {
    /// Certificate in DER format
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format
    pub pem_cert: String,

    /// Private key in PEM format
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files.
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

/// Generate a self-signed certificate valid for 90 days.
///
/// Includes localhost, 127.0.0.1 and ::1 as subject alternative names.
/// Not trusted by anything; clients must skip verification or pin it.
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, SelfSignedError> {
    generate_self_signed_cert_valid_for(Duration::from_secs(90 * 24 * 60 * 60))
}

/// Generate a self-signed certificate with a caller-chosen validity window
/// starting now. Used by tests that need certificates close to expiry.
pub fn generate_self_signed_cert_valid_for(
    valid_for: Duration,
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "UserDir development certificate");
    dn.push(rcgen::DnType::OrganizationName, "UserDir");
    params.distinguished_name = dn;

    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(
            rcgen::Ia5String::try_from("localhost")
                .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?,
        ),
        rcgen::SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        rcgen::SanType::IpAddress(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)),
    ];

    let not_before = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let not_after = not_before + valid_for;
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    // Random serial to avoid collisions between repeated test runs
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let pem_cert = cert.pem();
    let pem_key = key_pair.serialize_pem();
    let cert_der = cert.der().to_vec();
    let key_der = key_pair.serialize_der();

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert_der),
        key_der: PrivateKeyDer::try_from(key_der)
            .map_err(|e| SelfSignedError::KeyGenerationFailed(format!("{:?}", e)))?,
        pem_cert,
        pem_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed_cert() {
        let cert = generate_self_signed_cert().unwrap();

        assert!(!cert.cert_der.is_empty());
        assert!(cert.pem_cert.contains("BEGIN CERTIFICATE"));
        assert!(cert.pem_key.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_cert_can_be_used_with_rustls() {
        let cert = generate_self_signed_cert().unwrap();

        let server_config = rustls::ServerConfig::builder_with_provider(crate::crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.cert_der], cert.key_der);

        assert!(server_config.is_ok());
    }

    #[test]
    fn test_custom_validity_window() {
        let cert = generate_self_signed_cert_valid_for(Duration::from_secs(3600)).unwrap();

        let not_after = crate::parse_not_after(cert.pem_cert.as_bytes()).unwrap();
        let remaining = not_after - chrono::Utc::now();
        assert!(remaining <= chrono::Duration::hours(1));
        assert!(remaining > chrono::Duration::minutes(55));
    }
}
