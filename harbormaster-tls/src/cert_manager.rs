//! Certificate Manager: owns the ACME client, the account key, the parsed
//! TLS certificate cache, and the challenge token table.

use crate::acme::{AcmeClient, AcmeError};
use crate::challenge::ChallengeTable;
use crate::fsutil::write_private_file;
use harbormaster_core::state::{CertStatusKind, StateStore};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Dedup window: a second acquisition attempt within this many seconds of the
/// last one is skipped rather than racing the in-flight attempt.
const DEDUP_WINDOW_SECS: i64 = 30;
/// Order creation must complete within this deadline.
const ORDER_DEADLINE: Duration = Duration::from_secs(30);
/// Backoff applied to every failed acquisition attempt.
const RETRY_BACKOFF_SECS: i64 = 600;
/// A certificate is due for renewal once it is within this many days of expiry.
const RENEWAL_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum CertManagerError {
    #[error("no host record for {0}")]
    UnknownHost(String),

    #[error("certificate for {0} is not active")]
    NotActive(String),

    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    State(#[from] harbormaster_core::Error),

    #[error("certificate conversion failed: {0}")]
    Conversion(String),

    #[error("acquisition for {0} skipped: {1}")]
    Skipped(String, &'static str),
}

pub struct CertificateManager {
    store: Arc<StateStore>,
    certs_dir: PathBuf,
    client: parking_lot::RwLock<Arc<AcmeClient>>,
    challenges: Arc<ChallengeTable>,
    cache: parking_lot::RwLock<HashMap<String, Arc<CertifiedKey>>>,
    acquisition_lock: AsyncMutex<()>,
}

impl CertificateManager {
    pub fn new(store: Arc<StateStore>, certs_dir: impl Into<PathBuf>) -> Arc<Self> {
        let certs_dir = certs_dir.into();
        let config = store.lets_encrypt_config();
        let client = AcmeClient::new(config.directory_url.clone(), config.email.clone());

        Arc::new(Self {
            store,
            certs_dir,
            client: parking_lot::RwLock::new(Arc::new(client)),
            challenges: Arc::new(ChallengeTable::new()),
            cache: parking_lot::RwLock::new(HashMap::new()),
            acquisition_lock: AsyncMutex::new(()),
        })
    }

    /// Returns the stored key authorization for an ACME HTTP-01 token, if any.
    pub fn serve_http_challenge(&self, token: &str) -> Option<String> {
        self.challenges.get(token)
    }

    fn account_key_path(&self) -> PathBuf {
        self.certs_dir.join("account.key")
    }

    fn host_dir(&self, hostname: &str) -> PathBuf {
        self.certs_dir.join(hostname)
    }

    /// Called during the TLS handshake. Returns the cached certificate, or
    /// loads it from disk on first use. Fails if the host has no record or
    /// its certificate is not active.
    pub fn get_certificate(&self, hostname: &str) -> Result<Arc<CertifiedKey>, CertManagerError> {
        if let Some(cached) = self.cache.read().get(hostname).cloned() {
            return Ok(cached);
        }

        let host = self
            .store
            .get_host(hostname)
            .ok_or_else(|| CertManagerError::UnknownHost(hostname.to_string()))?;

        let cert = host
            .certificate
            .as_ref()
            .filter(|c| c.status == CertStatusKind::Active)
            .ok_or_else(|| CertManagerError::NotActive(hostname.to_string()))?;

        let cert_path = cert
            .cert_path
            .as_ref()
            .ok_or_else(|| CertManagerError::NotActive(hostname.to_string()))?;
        let key_path = cert
            .key_path
            .as_ref()
            .ok_or_else(|| CertManagerError::NotActive(hostname.to_string()))?;

        let cert_pem = std::fs::read_to_string(cert_path)
            .map_err(|e| CertManagerError::Conversion(format!("read {cert_path}: {e}")))?;
        let key_pem = std::fs::read_to_string(key_path)
            .map_err(|e| CertManagerError::Conversion(format!("read {key_path}: {e}")))?;

        let key = Arc::new(pem_to_certified_key(&cert_pem, &key_pem)?);
        self.cache.write().insert(hostname.to_string(), key.clone());
        Ok(key)
    }

    /// Rebuilds the ACME client after a staging toggle. Re-registration
    /// happens lazily on the next acquisition via `ensure_account`; an
    /// already-registered account for the new directory is not an error.
    pub fn update_acme_client(&self) {
        let config = self.store.lets_encrypt_config();
        let new_client = AcmeClient::new(config.directory_url, config.email);
        *self.client.write() = Arc::new(new_client);
        tracing::info!("ACME client rebuilt after staging toggle");
    }

    /// Serialized by a process-wide mutex; skips hosts that are already
    /// active or were attempted within the dedup window.
    pub async fn acquire_certificate(&self, hostname: &str) -> Result<(), CertManagerError> {
        let _guard = self.acquisition_lock.lock().await;

        let host = self
            .store
            .get_host(hostname)
            .ok_or_else(|| CertManagerError::UnknownHost(hostname.to_string()))?;

        if let Some(cert) = &host.certificate {
            if cert.status == CertStatusKind::Active {
                return Err(CertManagerError::Skipped(hostname.to_string(), "already active"));
            }
            if let Some(last_attempt) = cert.last_attempt_at {
                let now = now_unix();
                if now - last_attempt < DEDUP_WINDOW_SECS {
                    return Err(CertManagerError::Skipped(hostname.to_string(), "attempted recently"));
                }
            }
        }

        self.run_acquisition(hostname).await
    }

    /// Marks the host as renewing and re-runs acquisition. On failure the
    /// certificate status is restored to active so the existing cert stays
    /// usable until it actually expires.
    pub async fn renew_certificate(&self, hostname: &str) -> Result<(), CertManagerError> {
        self.store
            .update_certificate_status(hostname, |c| c.status = CertStatusKind::Renewing)?;

        match self.acquire_certificate(hostname).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self
                    .store
                    .update_certificate_status(hostname, |c| c.status = CertStatusKind::Active);
                Err(e)
            }
        }
    }

    async fn run_acquisition(&self, hostname: &str) -> Result<(), CertManagerError> {
        let now = now_unix();
        self.store.update_certificate_status(hostname, |c| {
            c.status = CertStatusKind::Acquiring;
            if c.first_attempt_at.is_none() {
                c.first_attempt_at = Some(now);
            }
            c.last_attempt_at = Some(now);
            c.attempt_count += 1;
        })?;

        let client = self.client.read().clone();
        let account_key_path = self.account_key_path();

        let outcome = tokio::time::timeout(
            ORDER_DEADLINE,
            client.obtain_certificate(hostname, self.challenges.as_ref(), &account_key_path),
        )
        .await;

        let issued = match outcome {
            Ok(Ok(issued)) => issued,
            Ok(Err(e)) => {
                self.record_failure(hostname)?;
                return Err(e.into());
            }
            Err(_) => {
                self.record_failure(hostname)?;
                return Err(AcmeError::OrderFailed("order creation deadline exceeded".into()).into());
            }
        };

        let host_dir = self.host_dir(hostname);
        let cert_path = host_dir.join("cert.pem");
        let key_path = host_dir.join("key.pem");

        write_private_file(&cert_path, issued.cert_pem.as_bytes())
            .map_err(|e| CertManagerError::Conversion(format!("write cert.pem: {e}")))?;
        write_private_file(&key_path, issued.key_pem.as_bytes())
            .map_err(|e| CertManagerError::Conversion(format!("write key.pem: {e}")))?;

        let expires_at = issued.expires_at;
        let cert_path_str = cert_path.display().to_string();
        let key_path_str = key_path.display().to_string();

        self.store.update_certificate_status(hostname, |c| {
            c.status = CertStatusKind::Active;
            c.acquired_at = Some(now);
            c.expires_at = Some(expires_at);
            c.cert_path = Some(cert_path_str);
            c.key_path = Some(key_path_str);
        })?;

        self.cache.write().remove(hostname);
        tracing::info!(%hostname, "certificate acquired and cached entry cleared");
        Ok(())
    }

    fn record_failure(&self, hostname: &str) -> Result<(), CertManagerError> {
        let now = now_unix();
        self.store.update_certificate_status(hostname, |c| {
            c.next_attempt_at = Some(now + RETRY_BACKOFF_SECS);
            if c.attempt_count >= c.max_attempts {
                c.status = CertStatusKind::Failed;
            }
        })?;
        Ok(())
    }

    /// Every 60s: pending hosts attempt immediately, acquiring hosts attempt
    /// once their next-attempt time has passed, failed/active/renewing hosts
    /// are left alone.
    pub async fn run_acquisition_sweep(&self) {
        let now = now_unix();
        for host in self.store.get_all_hosts() {
            if !host.ssl_enabled {
                continue;
            }
            let Some(cert) = &host.certificate else { continue };
            let due = match cert.status {
                CertStatusKind::Pending => true,
                CertStatusKind::Acquiring => cert.next_attempt_at.map(|t| t <= now).unwrap_or(true),
                CertStatusKind::Failed | CertStatusKind::Active | CertStatusKind::Renewing => false,
            };
            if !due {
                continue;
            }
            if let Err(e) = self.acquire_certificate(&host.hostname).await {
                tracing::debug!(hostname = %host.hostname, error = %e, "acquisition sweep skipped host");
            }
        }
    }

    /// Every 12h: renews every active certificate within the renewal window.
    pub async fn run_renewal_sweep(&self) {
        for host in self.store.hosts_with_status(CertStatusKind::Active) {
            let due = host
                .certificate
                .as_ref()
                .map(|c| c.expires_within_days(RENEWAL_WINDOW_DAYS))
                .unwrap_or(false);
            if !due {
                continue;
            }
            if let Err(e) = self.renew_certificate(&host.hostname).await {
                tracing::warn!(hostname = %host.hostname, error = %e, "renewal attempt failed");
            }
        }
    }
}

fn pem_to_certified_key(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, CertManagerError> {
    let mut cert_reader = std::io::Cursor::new(cert_pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(CertManagerError::Conversion("no certificates in PEM".to_string()));
    }

    let mut key_reader = std::io::Cursor::new(key_pem.as_bytes());
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| CertManagerError::Conversion(format!("parse key: {e}")))?
        .ok_or_else(|| CertManagerError::Conversion("no private key in PEM".to_string()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|_| CertManagerError::Conversion("unsupported key type".to_string()))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_window_constant_matches_contract() {
        assert_eq!(DEDUP_WINDOW_SECS, 30);
    }

    #[test]
    fn retry_backoff_is_ten_minutes() {
        assert_eq!(RETRY_BACKOFF_SECS, 600);
    }
}
