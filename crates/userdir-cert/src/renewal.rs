//! Renewing certificate cache
//!
//! Holds the identity obtained from the managed authority and reissues it
//! before expiry. Every TLS accept asks the cache for the current key:
//! outside the renewal window that is a lock-free-ish read; inside the
//! window the asking handshake blocks on one coalesced reissuance.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::managed::{CertificateIssuer, CertificateRequest};
use crate::{certified_key_from_pem, CertificateSupplier};

/// Reissue this long before `not_after`.
const DEFAULT_RENEW_BEFORE_HOURS: i64 = 24;

/// Upper bound on one issuance round trip, CSR generation included.
const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RenewalError {
    #[error("certificate issuance failed: {0}")]
    IssuanceFailed(String),

    #[error("certificate issuance timed out after {0:?}")]
    Timeout(Duration),

    #[error("no valid certificate available: {0}")]
    NoValidCertificate(String),

    #[error("issued material unusable: {0}")]
    BadMaterial(String),
}

/// The currently active managed identity.
struct ManagedCertificate {
    certified_key: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
}

/// Cache for one authority-issued identity.
///
/// Single-identity by design: there is no eviction, only replacement by a
/// successful reissuance. Concurrent handshakes inside the renewal window
/// share one in-flight authority request.
pub struct RenewingCertificateCache {
    issuer: Arc<dyn CertificateIssuer>,
    request: CertificateRequest,
    renew_before: chrono::Duration,
    issue_timeout: Duration,
    current: RwLock<Option<ManagedCertificate>>,
    issue_gate: Mutex<()>,
}

impl RenewingCertificateCache {
    pub fn new(issuer: Arc<dyn CertificateIssuer>, request: CertificateRequest) -> Self {
        Self {
            issuer,
            request,
            renew_before: chrono::Duration::hours(DEFAULT_RENEW_BEFORE_HOURS),
            issue_timeout: DEFAULT_ISSUE_TIMEOUT,
            current: RwLock::new(None),
            issue_gate: Mutex::new(()),
        }
    }

    /// Override the renewal margin.
    pub fn with_renew_before(mut self, renew_before: chrono::Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    /// Override the issuance deadline.
    pub fn with_issue_timeout(mut self, timeout: Duration) -> Self {
        self.issue_timeout = timeout;
        self
    }

    /// The certificate a handshake should present right now.
    ///
    /// Fast path: the cached certificate is outside the renewal window and
    /// is returned without any network interaction. Otherwise one caller
    /// performs a synchronous reissuance while concurrent callers wait on
    /// the same gate and then pick up the fresh result.
    pub async fn certified_key(&self) -> Result<Arc<CertifiedKey>, RenewalError> {
        if let Some(key) = self.fresh_key(Utc::now()) {
            return Ok(key);
        }

        let _gate = self.issue_gate.lock().await;

        // Someone else may have renewed while we waited for the gate.
        if let Some(key) = self.fresh_key(Utc::now()) {
            return Ok(key);
        }

        match self.reissue().await {
            Ok(key) => Ok(key),
            Err(e) => {
                // Prefer availability: a stale-but-unexpired certificate
                // still serves handshakes while the authority is down.
                let current = self.current.read().expect("certificate lock poisoned");
                match current.as_ref() {
                    Some(cert) if Utc::now() < cert.not_after => {
                        warn!("certificate reissuance failed, serving unexpired cached certificate: {e}");
                        Ok(cert.certified_key.clone())
                    }
                    Some(_) => Err(RenewalError::NoValidCertificate(e.to_string())),
                    None => Err(e),
                }
            }
        }
    }

    /// Expiry of the cached certificate, if any. Diagnostic only.
    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.current
            .read()
            .expect("certificate lock poisoned")
            .as_ref()
            .map(|c| c.not_after)
    }

    fn fresh_key(&self, now: DateTime<Utc>) -> Option<Arc<CertifiedKey>> {
        let current = self.current.read().expect("certificate lock poisoned");
        current
            .as_ref()
            .filter(|cert| now < cert.not_after - self.renew_before)
            .map(|cert| cert.certified_key.clone())
    }

    async fn reissue(&self) -> Result<Arc<CertifiedKey>, RenewalError> {
        let key_pair = generate_key_pair()?;
        let csr_pem = request_csr(&self.request, &key_pair)?;

        let issued = tokio::time::timeout(self.issue_timeout, self.issuer.issue(&csr_pem, &self.request))
            .await
            .map_err(|_| RenewalError::Timeout(self.issue_timeout))?
            .map_err(|e| RenewalError::IssuanceFailed(e.to_string()))?;

        let key_pem = key_pair.serialize_pem();
        let (certified_key, not_after) = certified_key_from_pem(issued.as_bytes(), key_pem.as_bytes())
            .map_err(|e| RenewalError::BadMaterial(e.to_string()))?;

        info!(
            "obtained certificate for {}, valid until {}",
            self.request.common_name, not_after
        );

        let mut current = self.current.write().expect("certificate lock poisoned");
        *current = Some(ManagedCertificate {
            certified_key: certified_key.clone(),
            not_after,
        });

        Ok(certified_key)
    }
}

#[async_trait::async_trait]
impl CertificateSupplier for RenewingCertificateCache {
    async fn certified_key(&self) -> Result<Arc<CertifiedKey>, RenewalError> {
        RenewingCertificateCache::certified_key(self).await
    }
}

/// Generate a key pair for a certificate request, preferring RSA-2048 and
/// falling back to ECDSA when the crypto backend cannot generate RSA keys.
fn generate_key_pair() -> Result<KeyPair, RenewalError> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|_| KeyPair::generate())
        .map_err(|e| RenewalError::BadMaterial(e.to_string()))
}

/// Build a PEM-encoded CSR from the request template.
fn request_csr(request: &CertificateRequest, key_pair: &KeyPair) -> Result<String, RenewalError> {
    let mut params = CertificateParams::new(request.dns_sans.clone())
        .map_err(|e| RenewalError::BadMaterial(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, request.common_name.clone());
    params.distinguished_name = dn;

    for ip in &request.ip_sans {
        params.subject_alt_names.push(rcgen::SanType::IpAddress(*ip));
    }

    let csr = params
        .serialize_request(key_pair)
        .map_err(|e| RenewalError::BadMaterial(e.to_string()))?;
    csr.pem().map_err(|e| RenewalError::BadMaterial(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::IssueError;
    use crate::self_signed::generate_self_signed_cert_valid_for;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    enum Step {
        Issue(Duration),
        Fail,
    }

    /// Issuer returning certificates with scripted validity windows. Ignores
    /// the CSR; the cache pairs whatever comes back with its own key, which
    /// rustls does not cross-check.
    struct ScriptedIssuer {
        calls: AtomicUsize,
        plan: std::sync::Mutex<VecDeque<Step>>,
    }

    impl ScriptedIssuer {
        fn new(plan: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                plan: std::sync::Mutex::new(plan.into()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CertificateIssuer for ScriptedIssuer {
        async fn issue(
            &self,
            _csr_pem: &str,
            _request: &CertificateRequest,
        ) -> Result<String, IssueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Small delay so concurrent callers really overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;

            let step = self
                .plan
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Issue(90 * DAY));
            match step {
                Step::Issue(valid_for) => Ok(generate_self_signed_cert_valid_for(valid_for)
                    .map_err(|e| IssueError::Authority(e.to_string()))?
                    .pem_cert),
                Step::Fail => Err(IssueError::Authority("simulated authority outage".to_string())),
            }
        }
    }

    fn cache_with(issuer: Arc<ScriptedIssuer>) -> RenewingCertificateCache {
        RenewingCertificateCache::new(issuer, CertificateRequest::for_host("localhost"))
    }

    #[tokio::test]
    async fn test_fetch_outside_window_hits_cache() {
        let issuer = ScriptedIssuer::new(vec![Step::Issue(90 * DAY)]);
        let cache = cache_with(issuer.clone());

        let first = cache.certified_key().await.unwrap();
        let second = cache.certified_key().await.unwrap();
        let third = cache.certified_key().await.unwrap();

        assert_eq!(issuer.calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn test_initial_issuance_failure_fails_handshake() {
        let issuer = ScriptedIssuer::new(vec![Step::Fail]);
        let cache = cache_with(issuer.clone());

        let result = cache.certified_key().await;
        assert!(matches!(result, Err(RenewalError::IssuanceFailed(_))));
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_renewal_is_single_flight() {
        // First certificate lands inside the renewal window (12h < 24h
        // margin); the replacement is long-lived.
        let issuer = ScriptedIssuer::new(vec![
            Step::Issue(Duration::from_secs(12 * 60 * 60)),
            Step::Issue(90 * DAY),
        ]);
        let cache = Arc::new(cache_with(issuer.clone()));

        // Prime the cache with the short-lived certificate.
        cache.certified_key().await.unwrap();
        assert_eq!(issuer.calls(), 1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.certified_key().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        // Exactly one coalesced reissuance on top of the initial one.
        assert_eq!(issuer.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_but_valid_served_on_failure() {
        let issuer = ScriptedIssuer::new(vec![
            Step::Issue(Duration::from_secs(12 * 60 * 60)),
            Step::Fail,
        ]);
        let cache = cache_with(issuer.clone());

        let first = cache.certified_key().await.unwrap();

        // Inside the window, reissuance fails, the unexpired certificate
        // is served anyway.
        let second = cache.certified_key().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(issuer.calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_cache_with_failing_authority_errors() {
        let issuer = ScriptedIssuer::new(vec![Step::Issue(Duration::from_secs(1)), Step::Fail]);
        let cache = cache_with(issuer.clone());

        cache.certified_key().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let result = cache.certified_key().await;
        assert!(matches!(result, Err(RenewalError::NoValidCertificate(_))));
    }

    #[test]
    fn test_csr_generation() {
        let request = CertificateRequest::for_host("userd.internal");
        let key_pair = generate_key_pair().unwrap();
        let csr = request_csr(&request, &key_pair).unwrap();
        assert!(csr.contains("BEGIN CERTIFICATE REQUEST"));
    }
}
