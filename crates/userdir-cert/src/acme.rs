//! Automatic domain-validated certificate provisioning
//!
//! Wires configuration into the ACME protocol client: terms are accepted,
//! issuance is restricted to the configured domain, and issued material is
//! cached on local disk so restarts do not re-order. The validation
//! protocol itself is consumed, not re-implemented; the serving layer only
//! has to answer `/.well-known/acme-challenge/` lookups with the proofs
//! stored here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::renewal::RenewalError;
use crate::{certified_key_from_pem, CertificateSupplier};

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory, for testing.
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Where issued material and account credentials live by default.
pub const DEFAULT_CACHE_DIR: &str = "userdir-autocert";

/// Maximum time to wait for validation and issuance to complete.
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Reissue this long before expiry.
const RENEW_BEFORE_DAYS: i64 = 30;

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("order creation failed: {0}")]
    OrderCreationFailed(String),

    #[error("challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("certificate finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("timeout waiting for domain validation")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("issued material unusable: {0}")]
    BadMaterial(String),
}

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// The one domain this manager will obtain certificates for.
    pub domain: String,
    /// Directory for issued material and account credentials.
    pub cache_dir: PathBuf,
    /// Contact email registered with the issuance account.
    pub contact_email: Option<String>,
    /// ACME directory URL.
    pub directory_url: String,
    /// Renewal margin before expiry.
    pub renew_before: chrono::Duration,
}

impl AcmeConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            contact_email: None,
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            renew_before: chrono::Duration::days(RENEW_BEFORE_DAYS),
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_contact_email(mut self, email: impl Into<String>) -> Self {
        self.contact_email = Some(email.into());
        self
    }

    /// Switch to the staging environment.
    pub fn with_staging(mut self) -> Self {
        self.directory_url = LETS_ENCRYPT_STAGING.to_string();
        self
    }
}

struct ActiveCertificate {
    certified_key: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
}

/// Certificate manager for one domain-validated identity.
pub struct AcmeManager {
    config: AcmeConfig,
    current: RwLock<Option<ActiveCertificate>>,
    /// Outstanding HTTP-01 proofs: token -> key authorization.
    challenges: RwLock<HashMap<String, String>>,
    order_gate: Mutex<()>,
}

impl AcmeManager {
    pub fn new(config: AcmeConfig) -> Result<Self, AcmeError> {
        validate_domain(&config.domain)?;
        Ok(Self {
            config,
            current: RwLock::new(None),
            challenges: RwLock::new(HashMap::new()),
            order_gate: Mutex::new(()),
        })
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    /// Proof body for an outstanding HTTP-01 challenge token, if any.
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges
            .read()
            .expect("challenge lock poisoned")
            .get(token)
            .cloned()
    }

    /// The certificate a handshake should present right now.
    ///
    /// Material is fetched on demand: nothing is ordered until the first
    /// handshake arrives, restarts reuse the disk cache, and concurrent
    /// handshakes share one in-flight order.
    pub async fn certified_key(&self) -> Result<Arc<CertifiedKey>, AcmeError> {
        if let Some(key) = self.fresh_key(Utc::now()) {
            return Ok(key);
        }

        let _gate = self.order_gate.lock().await;

        if let Some(key) = self.fresh_key(Utc::now()) {
            return Ok(key);
        }
        if let Some(key) = self.try_disk_cache() {
            return Ok(key);
        }

        match self.order_certificate().await {
            Ok((cert_pem, key_pem)) => {
                self.persist(&cert_pem, &key_pem);
                self.install(&cert_pem, &key_pem)
            }
            Err(e) => {
                let current = self.current.read().expect("certificate lock poisoned");
                match current.as_ref() {
                    Some(cert) if Utc::now() < cert.not_after => {
                        warn!("certificate renewal failed, serving unexpired cached certificate: {e}");
                        Ok(cert.certified_key.clone())
                    }
                    _ => Err(e),
                }
            }
        }
    }

    fn fresh_key(&self, now: DateTime<Utc>) -> Option<Arc<CertifiedKey>> {
        let current = self.current.read().expect("certificate lock poisoned");
        current
            .as_ref()
            .filter(|cert| now < cert.not_after - self.config.renew_before)
            .map(|cert| cert.certified_key.clone())
    }

    fn cert_path(&self) -> PathBuf {
        self.config.cache_dir.join(format!("{}.crt", self.config.domain))
    }

    fn key_path(&self) -> PathBuf {
        self.config.cache_dir.join(format!("{}.key", self.config.domain))
    }

    /// Pick up material a previous run left in the cache directory.
    fn try_disk_cache(&self) -> Option<Arc<CertifiedKey>> {
        let cert_pem = std::fs::read(self.cert_path()).ok()?;
        let key_pem = std::fs::read(self.key_path()).ok()?;
        let (certified_key, not_after) = certified_key_from_pem(&cert_pem, &key_pem).ok()?;

        if Utc::now() >= not_after - self.config.renew_before {
            debug!("cached certificate for {} is due for renewal", self.config.domain);
            return None;
        }

        info!(
            "reusing cached certificate for {} from {}",
            self.config.domain,
            self.config.cache_dir.display()
        );
        let mut current = self.current.write().expect("certificate lock poisoned");
        *current = Some(ActiveCertificate {
            certified_key: certified_key.clone(),
            not_after,
        });
        Some(certified_key)
    }

    fn persist(&self, cert_pem: &str, key_pem: &str) {
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.config.cache_dir)?;
            std::fs::write(self.cert_path(), cert_pem)?;
            std::fs::write(self.key_path(), key_pem)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!("could not cache issued certificate on disk: {e}");
        }
    }

    fn install(&self, cert_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        let (certified_key, not_after) =
            certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
                .map_err(|e| AcmeError::BadMaterial(e.to_string()))?;

        let mut current = self.current.write().expect("certificate lock poisoned");
        *current = Some(ActiveCertificate {
            certified_key: certified_key.clone(),
            not_after,
        });
        Ok(certified_key)
    }

    /// Restore or register the issuance account. Terms of service are
    /// accepted here; credentials persist next to the certificates.
    async fn account(&self) -> Result<Account, AcmeError> {
        let path = self.config.cache_dir.join("account.json");

        if let Ok(bytes) = std::fs::read(&path) {
            if let Ok(credentials) = serde_json::from_slice::<AccountCredentials>(&bytes) {
                match Account::from_credentials(credentials).await {
                    Ok(account) => {
                        debug!("restored issuance account from {}", path.display());
                        return Ok(account);
                    }
                    Err(e) => warn!("saved issuance account unusable, registering a new one: {e}"),
                }
            }
        }

        let contact: Vec<String> = self
            .config
            .contact_email
            .iter()
            .map(|email| format!("mailto:{email}"))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) =
            Account::create(&new_account, &self.config.directory_url, None)
                .await
                .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;

        std::fs::create_dir_all(&self.config.cache_dir)?;
        let json = serde_json::to_vec(&credentials)
            .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
        std::fs::write(&path, json)?;
        info!("registered issuance account for {}", self.config.domain);

        Ok(account)
    }

    /// Run one full order: authorize via HTTP-01, finalize with a fresh
    /// CSR, download the chain.
    async fn order_certificate(&self) -> Result<(String, String), AcmeError> {
        let domain = self.config.domain.clone();
        info!("requesting certificate for {domain} via domain validation");

        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.clone())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::OrderCreationFailed(e.to_string()))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AcmeError::OrderCreationFailed(e.to_string()))?;

        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    AcmeError::ChallengeFailed(format!("no HTTP-01 challenge offered for {domain}"))
                })?;

            let key_auth = order.key_authorization(challenge);
            self.challenges
                .write()
                .expect("challenge lock poisoned")
                .insert(challenge.token.clone(), key_auth.as_str().to_string());
            debug!("stored validation proof for token {}", challenge.token);

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
        }

        let deadline = Instant::now() + VALIDATION_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                self.clear_challenges();
                return Err(AcmeError::Timeout);
            }

            order
                .refresh()
                .await
                .map_err(|e| AcmeError::OrderCreationFailed(e.to_string()))?;

            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    self.clear_challenges();
                    return Err(AcmeError::ChallengeFailed(format!(
                        "order for {domain} became invalid; is the domain reachable over plain HTTP?"
                    )));
                }
                _ => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }

        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| AcmeError::BadMaterial(e.to_string()))?;
        let params = rcgen::CertificateParams::new(vec![domain.clone()])
            .map_err(|e| AcmeError::BadMaterial(e.to_string()))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AcmeError::BadMaterial(e.to_string()))?;

        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| AcmeError::FinalizationFailed(e.to_string()))?;
        }

        let cert_chain = loop {
            if Instant::now() > deadline {
                self.clear_challenges();
                return Err(AcmeError::Timeout);
            }

            match order.certificate().await {
                Ok(Some(cert)) => break cert,
                Ok(None) => tokio::time::sleep(Duration::from_secs(1)).await,
                Err(e) => {
                    self.clear_challenges();
                    return Err(AcmeError::FinalizationFailed(e.to_string()));
                }
            }
        };

        self.clear_challenges();
        info!("certificate for {domain} issued");

        Ok((cert_chain, key_pair.serialize_pem()))
    }

    fn clear_challenges(&self) {
        self.challenges
            .write()
            .expect("challenge lock poisoned")
            .clear();
    }
}

#[async_trait::async_trait]
impl CertificateSupplier for AcmeManager {
    async fn certified_key(&self) -> Result<Arc<CertifiedKey>, RenewalError> {
        AcmeManager::certified_key(self)
            .await
            .map_err(|e| RenewalError::IssuanceFailed(e.to_string()))
    }
}

fn validate_domain(domain: &str) -> Result<(), AcmeError> {
    if domain.is_empty() {
        return Err(AcmeError::InvalidDomain("domain cannot be empty".to_string()));
    }
    if domain.contains(' ') {
        return Err(AcmeError::InvalidDomain(
            "domain cannot contain spaces".to_string(),
        ));
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(AcmeError::InvalidDomain(
            "domain cannot start or end with a dot".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_signed::generate_self_signed_cert;

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("sub.example.com").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("invalid domain.com").is_err());
        assert!(validate_domain(".example.com").is_err());
        assert!(validate_domain("example.com.").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = AcmeConfig::new("example.com");
        assert_eq!(config.directory_url, LETS_ENCRYPT_PRODUCTION);
        assert_eq!(config.cache_dir, PathBuf::from(DEFAULT_CACHE_DIR));

        let staging = AcmeConfig::new("example.com").with_staging();
        assert_eq!(staging.directory_url, LETS_ENCRYPT_STAGING);
    }

    #[test]
    fn test_manager_rejects_invalid_domain() {
        let result = AcmeManager::new(AcmeConfig::new("bad domain"));
        assert!(matches!(result, Err(AcmeError::InvalidDomain(_))));
    }

    #[test]
    fn test_challenge_store() {
        let manager = AcmeManager::new(AcmeConfig::new("example.com")).unwrap();
        assert!(manager.challenge_response("token").is_none());

        manager
            .challenges
            .write()
            .unwrap()
            .insert("token".to_string(), "token.thumbprint".to_string());
        assert_eq!(
            manager.challenge_response("token").as_deref(),
            Some("token.thumbprint")
        );

        manager.clear_challenges();
        assert!(manager.challenge_response("token").is_none());
    }

    #[tokio::test]
    async fn test_disk_cache_reused_without_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let cert = generate_self_signed_cert().unwrap();
        std::fs::write(dir.path().join("example.com.crt"), &cert.pem_cert).unwrap();
        std::fs::write(dir.path().join("example.com.key"), &cert.pem_key).unwrap();

        let manager = AcmeManager::new(
            AcmeConfig::new("example.com").with_cache_dir(dir.path()),
        )
        .unwrap();

        // 90 days of validity is outside the 30 day renewal margin, so the
        // cached files satisfy the handshake with no network interaction.
        let key = manager.certified_key().await.unwrap();
        assert_eq!(key.cert.len(), 1);
    }

    #[tokio::test]
    async fn test_install_makes_fast_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AcmeManager::new(
            AcmeConfig::new("example.com").with_cache_dir(dir.path()),
        )
        .unwrap();

        let cert = generate_self_signed_cert().unwrap();
        manager.install(&cert.pem_cert, &cert.pem_key).unwrap();

        let key = manager.certified_key().await.unwrap();
        assert_eq!(key.cert.len(), 1);
    }
}
