//! Client-side TLS configurations
//!
//! Builds the rustls [`ClientConfig`] for each client security mode: no
//! verification, system trust anchors, a custom CA bundle, or one pinned
//! certificate file. Insecure mode produces no TLS configuration at all.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::mode::{CredentialSpec, SecurityMode};
use crate::{crypto_provider, static_file, CredentialError};

/// ALPN identifier for HTTP/2, which carries gRPC.
const ALPN_H2: &[u8] = b"h2";

/// Build the TLS configuration for a client credential spec.
///
/// Returns `None` for [`SecurityMode::Insecure`]; every other client mode
/// yields a ready configuration with HTTP/2 ALPN.
pub fn client_config(spec: &CredentialSpec) -> Result<Option<Arc<ClientConfig>>, CredentialError> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| CredentialError::Rejected(e.to_string()))?;

    let mut config = match spec.mode() {
        SecurityMode::Insecure => return Ok(None),
        SecurityMode::SelfSignedSkipVerify => builder
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth(),
        SecurityMode::SelfSignedVerify => builder
            .with_root_certificates(system_roots())
            .with_no_client_auth(),
        SecurityMode::VerifyWithCustomCa => {
            let path = spec.ca_path().ok_or_else(|| {
                CredentialError::Rejected("custom-ca mode without a CA bundle".to_string())
            })?;
            builder
                .with_root_certificates(static_file::load_trust_anchors(path)?)
                .with_no_client_auth()
        }
        SecurityMode::StaticCertFile => {
            // Trust exactly the server's own certificate file.
            let path = spec.cert_path().ok_or_else(|| {
                CredentialError::Rejected("pinned-cert mode without a certificate".to_string())
            })?;
            builder
                .with_root_certificates(static_file::load_trust_anchors(path)?)
                .with_no_client_auth()
        }
        mode => {
            return Err(CredentialError::Rejected(format!(
                "{mode} is a server-side mode"
            )))
        }
    };

    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Some(Arc::new(config)))
}

fn system_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Certificate verifier that accepts anything. Only reachable through the
/// explicit no-verify client mode.
#[derive(Debug)]
struct SkipVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(crypto_provider()))
    }
}

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
