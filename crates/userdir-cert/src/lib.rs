//! Transport-credential provisioning for the user directory service
//!
//! Resolves the selected security mode into concrete rustls material:
//! static PEM files, self-signed development certificates, automatic
//! domain-validated issuance, or managed issuance from a central
//! certificate authority with renewal before expiry.

pub mod acme;
pub mod client_tls;
pub mod managed;
pub mod mode;
pub mod renewal;
pub mod self_signed;
pub mod source;
pub mod static_file;

pub use acme::{AcmeConfig, AcmeError, AcmeManager};
pub use client_tls::client_config;
pub use managed::{CertificateIssuer, CertificateRequest, IssueError, VaultIssuer};
pub use mode::{
    ClientSecurityOptions, ConfigError, CredentialSpec, SecurityMode, ServerSecurityOptions,
};
pub use renewal::{RenewalError, RenewingCertificateCache};
pub use self_signed::{
    generate_self_signed_cert, generate_self_signed_cert_valid_for, SelfSignedCertificate,
    SelfSignedError,
};
pub use source::{obtain, ObtainOptions, TlsCredentials, TransportCredentials};

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }
}

/// Errors loading or assembling key material. All of these are fatal at
/// startup; there is no retry path.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("cannot read {path}: {source}")]
    FileUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed PEM material in {0}")]
    MalformedPem(String),

    #[error("certificate or key rejected: {0}")]
    Rejected(String),
}

/// The crypto provider every TLS configuration in this crate is built with.
pub(crate) fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Install the process-wide default crypto provider. Binaries call this once
/// before building any TLS configuration; repeated calls are harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Parse the expiry time out of the first certificate in a PEM bundle.
pub fn parse_not_after(cert_pem: &[u8]) -> Result<DateTime<Utc>, CredentialError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem)
        .map_err(|_| CredentialError::MalformedPem("certificate".to_string()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)
        .map_err(|_| CredentialError::MalformedPem("certificate".to_string()))?;

    let ts = cert.validity().not_after.timestamp();
    DateTime::<Utc>::from_timestamp(ts, 0)
        .ok_or_else(|| CredentialError::Rejected("certificate validity out of range".to_string()))
}

/// Assemble a rustls [`CertifiedKey`] from PEM-encoded chain and key,
/// returning it together with the leaf certificate's expiry.
pub fn certified_key_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(Arc<CertifiedKey>, DateTime<Utc>), CredentialError> {
    let chain = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| CredentialError::MalformedPem("certificate chain".to_string()))?;
    if chain.is_empty() {
        return Err(CredentialError::MalformedPem(
            "certificate chain".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|_| CredentialError::MalformedPem("private key".to_string()))?
        .ok_or_else(|| CredentialError::MalformedPem("private key".to_string()))?;

    let not_after = parse_not_after(cert_pem)?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CredentialError::Rejected(e.to_string()))?;

    Ok((Arc::new(CertifiedKey::new(chain, signing_key)), not_after))
}

/// Something that can produce the certificate a handshake should present.
///
/// Implemented by the fixed static-file credential, the domain-validated
/// manager and the renewing authority-backed cache. The serving layer calls
/// this before each TLS accept and feeds the result into the
/// [`SnapshotCertResolver`] installed in the server configuration.
#[async_trait::async_trait]
pub trait CertificateSupplier: Send + Sync {
    async fn certified_key(&self) -> Result<Arc<CertifiedKey>, RenewalError>;
}

/// Certificate loaded once at startup and never replaced.
pub struct FixedCertificate(Arc<CertifiedKey>);

impl FixedCertificate {
    pub fn new(key: Arc<CertifiedKey>) -> Self {
        Self(key)
    }
}

#[async_trait::async_trait]
impl CertificateSupplier for FixedCertificate {
    async fn certified_key(&self) -> Result<Arc<CertifiedKey>, RenewalError> {
        Ok(self.0.clone())
    }
}

/// rustls certificate resolver serving the latest installed snapshot.
///
/// rustls resolves synchronously during the handshake, so issuance cannot
/// happen here; the accept path refreshes the snapshot first and the
/// resolver only hands out what is already installed.
pub struct SnapshotCertResolver {
    current: ArcSwapOption<CertifiedKey>,
}

impl SnapshotCertResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwapOption::empty(),
        })
    }

    pub fn store(&self, key: Arc<CertifiedKey>) {
        self.current.store(Some(key));
    }
}

impl std::fmt::Debug for SnapshotCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCertResolver")
            .field("installed", &self.current.load().is_some())
            .finish()
    }
}

impl ResolvesServerCert for SnapshotCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.load_full()
    }
}
