//! Static on-disk key material
//!
//! Loads PEM-encoded certificate chains, private keys and trust-anchor
//! bundles. Failures here are startup failures; nothing retries.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use tracing::info;

use crate::{Certificate, CredentialError};

/// Load a certificate chain plus private key, e.g. for serving.
pub fn load_certificate(cert_path: &Path, key_path: &Path) -> Result<Certificate, CredentialError> {
    let cert_chain = load_certs(cert_path)?;
    let private_key = load_private_key(key_path)?;

    info!(
        "loaded certificate from {} and {}",
        cert_path.display(),
        key_path.display()
    );

    Ok(Certificate {
        cert_chain,
        private_key,
    })
}

/// Load the certificates in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let mut reader = open(path)?;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| CredentialError::MalformedPem(path.display().to_string()))?;

    if certs.is_empty() {
        return Err(CredentialError::MalformedPem(path.display().to_string()));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CredentialError> {
    let mut reader = open(path)?;

    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| CredentialError::MalformedPem(path.display().to_string()))?
        .ok_or_else(|| CredentialError::MalformedPem(path.display().to_string()))
}

/// Build a trust-anchor pool from a PEM bundle.
pub fn load_trust_anchors(path: &Path) -> Result<RootCertStore, CredentialError> {
    let certs = load_certs(path)?;

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|_| CredentialError::MalformedPem(path.display().to_string()))?;
    }
    Ok(roots)
}

/// Read an entire PEM file, mapping IO failures to [`CredentialError`].
pub fn read_pem_bytes(path: &Path) -> Result<Vec<u8>, CredentialError> {
    std::fs::read(path).map_err(|source| CredentialError::FileUnreadable {
        path: path.display().to_string(),
        source,
    })
}

fn open(path: &Path) -> Result<BufReader<File>, CredentialError> {
    let file = File::open(path).map_err(|source| CredentialError::FileUnreadable {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}
