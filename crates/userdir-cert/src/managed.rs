//! Managed certificate authority issuance
//!
//! The server never talks the authority's protocol directly; it builds a
//! request template and a CSR and hands them to a [`CertificateIssuer`].
//! The production implementation is [`VaultIssuer`], which submits the CSR
//! to a Vault-style PKI sign endpoint authenticated with a bearer token.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::CredentialError;

/// Authority request timeout. An authority that takes longer than this is
/// treated as failed for the triggering handshake.
const AUTHORITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("authority request failed: {0}")]
    Authority(String),

    #[error("authority rejected the request: {0}")]
    Rejected(String),
}

/// Template for every certificate requested from the authority.
///
/// Built once at startup; each issuance generates a fresh key and CSR
/// from it.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub common_name: String,
    pub dns_sans: Vec<String>,
    pub ip_sans: Vec<IpAddr>,
}

impl CertificateRequest {
    /// Template for a server reached as `host`, always including localhost
    /// and the loopback addresses.
    pub fn for_host(host: &str) -> Self {
        let mut dns_sans = vec![host.to_string()];
        if host != "localhost" {
            dns_sans.push("localhost".to_string());
        }

        Self {
            common_name: host.to_string(),
            dns_sans,
            ip_sans: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        }
    }
}

/// Capability interface to a certificate authority: sign a CSR, return the
/// PEM-encoded certificate chain.
#[async_trait::async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(
        &self,
        csr_pem: &str,
        request: &CertificateRequest,
    ) -> Result<String, IssueError>;
}

/// Issuer backed by a Vault-style PKI endpoint.
pub struct VaultIssuer {
    endpoint: String,
    role: String,
    token: String,
    http: reqwest::Client,
}

impl VaultIssuer {
    /// Build an issuer talking to `endpoint` (e.g. `https://localhost:8200`)
    /// using `role` and a bearer `token`. The connection to the authority is
    /// trust-anchored on the supplied CA bundle, not on system roots.
    pub fn new(
        endpoint: &str,
        role: &str,
        token: &str,
        ca_bundle_pem: &[u8],
    ) -> Result<Self, CredentialError> {
        let ca = reqwest::Certificate::from_pem(ca_bundle_pem)
            .map_err(|_| CredentialError::MalformedPem("authority CA bundle".to_string()))?;

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(ca)
            .timeout(AUTHORITY_TIMEOUT)
            .build()
            .map_err(|e| CredentialError::Rejected(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            role: role.to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn sign_url(&self) -> String {
        format!("{}/v1/pki/sign/{}", self.endpoint, self.role)
    }
}

#[derive(Debug, Deserialize)]
struct VaultSignResponse {
    data: VaultSignData,
}

#[derive(Debug, Deserialize)]
struct VaultSignData {
    certificate: String,
    #[serde(default)]
    ca_chain: Vec<String>,
}

#[async_trait::async_trait]
impl CertificateIssuer for VaultIssuer {
    async fn issue(
        &self,
        csr_pem: &str,
        request: &CertificateRequest,
    ) -> Result<String, IssueError> {
        let url = self.sign_url();
        debug!("requesting certificate for {} from {}", request.common_name, url);

        let body = serde_json::json!({
            "csr": csr_pem,
            "common_name": request.common_name,
            "alt_names": request.dns_sans.join(","),
            "ip_sans": request
                .ip_sans
                .iter()
                .map(|ip| ip.to_string())
                .collect::<Vec<_>>()
                .join(","),
        });

        let response = self
            .http
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| IssueError::Authority(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(IssueError::Rejected(format!("{status}: {detail}")));
        }

        let signed: VaultSignResponse = response
            .json()
            .await
            .map_err(|e| IssueError::Authority(format!("unreadable response: {e}")))?;

        let mut chain = signed.data.certificate;
        for ca in &signed.data.ca_chain {
            chain.push('\n');
            chain.push_str(ca);
        }
        Ok(chain)
    }
}
