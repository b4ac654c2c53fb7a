//! Server credential assembly
//!
//! Turns a resolved [`CredentialSpec`] into ready-to-serve transport
//! credentials: either plaintext or a rustls server configuration whose
//! certificate is fed by the mode's supplier (fixed file material, the
//! domain-validation manager, or the renewing authority cache).

use std::path::PathBuf;
use std::sync::Arc;

use rustls::ServerConfig;
use tracing::info;

use crate::acme::{AcmeConfig, AcmeManager};
use crate::managed::{CertificateRequest, VaultIssuer};
use crate::mode::{CredentialSpec, SecurityMode};
use crate::renewal::{RenewalError, RenewingCertificateCache};
use crate::{
    crypto_provider, static_file, CertificateSupplier, CredentialError, FixedCertificate,
    SnapshotCertResolver,
};

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Everything the serving layer needs for one deployment mode.
pub enum TransportCredentials {
    /// No transport security; bind the RPC server directly.
    Plaintext,
    /// TLS with a per-handshake certificate supplier.
    Tls(TlsCredentials),
}

/// TLS credentials with their certificate supplier.
///
/// The server configuration resolves certificates from a snapshot; the
/// accept path calls [`TlsCredentials::refresh`] before each handshake so
/// the snapshot is current (and so renewal blocks the handshake that
/// needs it instead of racing it).
#[derive(Clone)]
pub struct TlsCredentials {
    server_config: Arc<ServerConfig>,
    resolver: Arc<SnapshotCertResolver>,
    supplier: Arc<dyn CertificateSupplier>,
    acme: Option<Arc<AcmeManager>>,
}

impl TlsCredentials {
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    /// The domain-validation manager, present only in that mode. The
    /// serving layer uses it to answer validation challenges.
    pub fn acme(&self) -> Option<Arc<AcmeManager>> {
        self.acme.clone()
    }

    /// Make sure the handshake about to run sees a current certificate.
    pub async fn refresh(&self) -> Result<(), RenewalError> {
        let key = self.supplier.certified_key().await?;
        self.resolver.store(key);
        Ok(())
    }
}

/// Mode-independent knobs for credential assembly.
#[derive(Debug, Clone)]
pub struct ObtainOptions {
    /// Host name the server is reached as; subject of managed certificates.
    pub host: String,
    /// Contact email for the domain-validation account.
    pub acme_contact: Option<String>,
    /// Use the domain validator's staging environment.
    pub acme_staging: bool,
    /// Override the domain-validation cache directory.
    pub acme_cache_dir: Option<PathBuf>,
}

impl Default for ObtainOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            acme_contact: None,
            acme_staging: false,
            acme_cache_dir: None,
        }
    }
}

/// Produce transport credentials for a resolved server spec.
///
/// Called once at startup. Failures are fatal: unreadable or malformed
/// key material never degrades to a partially-secured listener.
pub fn obtain(
    spec: &CredentialSpec,
    opts: &ObtainOptions,
) -> Result<TransportCredentials, CredentialError> {
    match spec.mode() {
        SecurityMode::Insecure => Ok(TransportCredentials::Plaintext),

        SecurityMode::StaticCertFile => {
            let cert_path = spec.cert_path().ok_or_else(|| {
                CredentialError::Rejected("static mode without a certificate path".to_string())
            })?;
            let key_path = spec.key_path().ok_or_else(|| {
                CredentialError::Rejected("static mode without a key path".to_string())
            })?;

            let certificate = static_file::load_certificate(cert_path, key_path)?;
            let signing_key =
                rustls::crypto::ring::sign::any_supported_type(&certificate.private_key)
                    .map_err(|e| CredentialError::Rejected(e.to_string()))?;
            let certified_key = Arc::new(rustls::sign::CertifiedKey::new(
                certificate.cert_chain,
                signing_key,
            ));

            build_tls(
                Arc::new(FixedCertificate::new(certified_key)),
                None,
                &[ALPN_H2],
            )
        }

        SecurityMode::DomainValidatedAutomatic => {
            let domain = spec.domain().ok_or_else(|| {
                CredentialError::Rejected("domain validation without a domain".to_string())
            })?;

            let mut config = AcmeConfig::new(domain);
            if let Some(contact) = &opts.acme_contact {
                config = config.with_contact_email(contact.clone());
            }
            if opts.acme_staging {
                config = config.with_staging();
            }
            if let Some(dir) = &opts.acme_cache_dir {
                config = config.with_cache_dir(dir.clone());
            }

            let manager = Arc::new(
                AcmeManager::new(config).map_err(|e| CredentialError::Rejected(e.to_string()))?,
            );
            info!("automatic certificate issuance enabled for {domain}");

            // The shared listener answers both gRPC and plain HTTP.
            build_tls(manager.clone(), Some(manager), &[ALPN_H2, ALPN_HTTP1])
        }

        SecurityMode::AuthorityIssuedManaged => {
            let endpoint = spec.authority_endpoint().ok_or_else(|| {
                CredentialError::Rejected("managed mode without an endpoint".to_string())
            })?;
            let token = spec.authority_token().ok_or_else(|| {
                CredentialError::Rejected("managed mode without a token".to_string())
            })?;
            let role = spec.authority_role().ok_or_else(|| {
                CredentialError::Rejected("managed mode without a role".to_string())
            })?;
            let ca_path = spec.ca_path().ok_or_else(|| {
                CredentialError::Rejected("managed mode without a CA bundle".to_string())
            })?;

            let ca_bundle = static_file::read_pem_bytes(ca_path)?;
            let issuer = VaultIssuer::new(endpoint, role, token, &ca_bundle)?;
            let cache = Arc::new(RenewingCertificateCache::new(
                Arc::new(issuer),
                CertificateRequest::for_host(&opts.host),
            ));
            info!("managed certificate issuance enabled via {endpoint}");

            build_tls(cache, None, &[ALPN_H2])
        }

        mode => Err(CredentialError::Rejected(format!(
            "{mode} is a client-side mode"
        ))),
    }
}

fn build_tls(
    supplier: Arc<dyn CertificateSupplier>,
    acme: Option<Arc<AcmeManager>>,
    alpn: &[&[u8]],
) -> Result<TransportCredentials, CredentialError> {
    let resolver = SnapshotCertResolver::new();

    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| CredentialError::Rejected(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(resolver.clone());
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(TransportCredentials::Tls(TlsCredentials {
        server_config: Arc::new(config),
        resolver,
        supplier,
        acme,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ServerSecurityOptions;
    use crate::self_signed::generate_self_signed_cert;

    fn write_cert_files(dir: &std::path::Path) -> (PathBuf, PathBuf) {
        let cert_path = dir.join("service.pem");
        let key_path = dir.join("service.key");
        let cert = generate_self_signed_cert().unwrap();
        cert.save_to_files(&cert_path, &key_path).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_insecure_round_trip() {
        let spec = CredentialSpec::resolve_server(&ServerSecurityOptions::default()).unwrap();
        let creds = obtain(&spec, &ObtainOptions::default()).unwrap();
        assert!(matches!(creds, TransportCredentials::Plaintext));
    }

    #[tokio::test]
    async fn test_static_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_cert_files(dir.path());

        let spec = CredentialSpec::resolve_server(&ServerSecurityOptions {
            static_cert: true,
            cert_path: Some(cert_path),
            key_path: Some(key_path),
            ..Default::default()
        })
        .unwrap();

        let creds = obtain(&spec, &ObtainOptions::default()).unwrap();
        let TransportCredentials::Tls(tls) = creds else {
            panic!("expected TLS credentials");
        };
        assert!(tls.acme().is_none());

        // Fixed supplier installs its certificate without network access.
        tls.refresh().await.unwrap();
    }

    #[test]
    fn test_static_round_trip_missing_file() {
        let spec = CredentialSpec::resolve_server(&ServerSecurityOptions {
            static_cert: true,
            cert_path: Some(PathBuf::from("/nonexistent/service.pem")),
            key_path: Some(PathBuf::from("/nonexistent/service.key")),
            ..Default::default()
        })
        .unwrap();

        let result = obtain(&spec, &ObtainOptions::default());
        assert!(matches!(result, Err(CredentialError::FileUnreadable { .. })));
    }

    #[test]
    fn test_acme_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CredentialSpec::resolve_server(&ServerSecurityOptions {
            acme: true,
            domain: Some("example.com".to_string()),
            ..Default::default()
        })
        .unwrap();

        let opts = ObtainOptions {
            acme_cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let creds = obtain(&spec, &opts).unwrap();
        let TransportCredentials::Tls(tls) = creds else {
            panic!("expected TLS credentials");
        };
        assert_eq!(tls.acme().unwrap().domain(), "example.com");
    }

    #[test]
    fn test_managed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca-org.pem");
        let cert = generate_self_signed_cert().unwrap();
        std::fs::write(&ca_path, &cert.pem_cert).unwrap();

        let spec = CredentialSpec::resolve_server(&ServerSecurityOptions {
            managed: true,
            authority_endpoint: Some("https://localhost:8200".to_string()),
            authority_token: Some("s.token".to_string()),
            authority_role: Some("my-role".to_string()),
            authority_ca: Some(ca_path),
            ..Default::default()
        })
        .unwrap();

        let creds = obtain(&spec, &ObtainOptions::default()).unwrap();
        assert!(matches!(creds, TransportCredentials::Tls(_)));
    }
}
