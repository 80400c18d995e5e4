//! ACME protocol client (RFC 8555), restricted to HTTP-01.
//!
//! Encapsulates account registration, order creation, HTTP-01 challenge
//! publication, and finalization/download for a single hostname.

use futures::StreamExt;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType as AcmeChallengeType,
    Identifier, NewAccount, NewOrder, OrderStatus,
};
use std::path::Path;
use thiserror::Error;

/// ACME directory URLs for Let's Encrypt.
pub mod directory {
    pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
    pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
}

/// Errors that can occur during ACME operations.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("challenge verification failed: {0}")]
    ChallengeFailed(String),

    #[error("order processing failed: {0}")]
    OrderFailed(String),

    #[error("certificate generation failed: {0}")]
    CertGeneration(String),

    #[error("account management error: {0}")]
    Account(String),
}

/// Data required to solve the HTTP-01 challenge for one authorization.
#[derive(Debug, Clone)]
pub struct ChallengeResponse {
    pub domain: String,
    pub token: String,
    pub key_authorization: String,
}

/// A fully issued certificate bundle for a single hostname.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Full certificate chain in PEM format.
    pub cert_pem: String,
    /// Private key in PEM format.
    pub key_pem: String,
    /// The hostname this certificate was issued for.
    pub domain: String,
    /// Expiration, parsed from the leaf certificate's NotAfter field.
    pub expires_at: i64,
}

/// Handles deploying and retrieving the key authorization for an HTTP-01
/// challenge token. Implemented by [`crate::challenge::ChallengeTable`].
pub trait ChallengeHandler: Send + Sync {
    fn publish(&self, token: &str, key_authorization: &str);
    fn retire(&self, token: &str);
}

/// Thin wrapper around `instant-acme` that only ever speaks HTTP-01.
pub struct AcmeClient {
    directory_url: String,
    email: Option<String>,
}

impl AcmeClient {
    pub fn new(directory_url: impl Into<String>, email: Option<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            email,
        }
    }

    /// Runs the full ACME workflow for one hostname: account, order,
    /// HTTP-01 challenge, finalize, download. Each authorization is solved
    /// by the HTTP-01 challenge type only — an order that only offers
    /// DNS-01 or TLS-ALPN-01 is rejected.
    pub async fn obtain_certificate<H: ChallengeHandler + ?Sized>(
        &self,
        hostname: &str,
        handler: &H,
        account_key_path: &Path,
    ) -> Result<IssuedCertificate, AcmeError> {
        tracing::info!(%hostname, directory = %self.directory_url, "starting ACME order");

        let account = self.ensure_account(account_key_path).await?;

        let identifiers = vec![Identifier::Dns(hostname.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderFailed(format!("create order: {e}")))?;

        let mut auths_stream = order.authorizations();
        let mut published_tokens = Vec::new();

        while let Some(auth_result) = auths_stream.next().await {
            let mut auth = auth_result
                .map_err(|e| AcmeError::OrderFailed(format!("fetch authorization: {e}")))?;

            if auth.status == AuthorizationStatus::Valid {
                continue;
            }

            let mut challenge = auth
                .challenge(AcmeChallengeType::Http01)
                .ok_or_else(|| {
                    AcmeError::ChallengeFailed(format!(
                        "{hostname} did not offer an http-01 challenge"
                    ))
                })?;

            let token = challenge.token.clone();
            let key_authorization = challenge.key_authorization().as_str().to_string();

            handler.publish(&token, &key_authorization);
            published_tokens.push(token);

            challenge
                .set_ready()
                .await
                .map_err(|e| AcmeError::ChallengeFailed(format!("set ready: {e}")))?;
        }

        let retry_policy = instant_acme::RetryPolicy::default();
        let state = order
            .poll_ready(&retry_policy)
            .await
            .map_err(|e| AcmeError::OrderFailed(format!("poll ready: {e}")));

        for token in &published_tokens {
            handler.retire(token);
        }

        let state = state?;
        if state != OrderStatus::Ready && state != OrderStatus::Valid {
            return Err(AcmeError::OrderFailed(format!("order ended in state {state:?}")));
        }

        // instant-acme generates a fresh EC key for the order and returns it
        // alongside the CSR it submits on our behalf; CommonName/SAN are
        // both set to `hostname` since the order only carries one identifier.
        let key_pem = order
            .finalize()
            .await
            .map_err(|e| AcmeError::CertGeneration(format!("finalize: {e}")))?;

        let cert_pem = order
            .poll_certificate(&retry_policy)
            .await
            .map_err(|e| AcmeError::CertGeneration(format!("download: {e}")))?;

        let expires_at = crate::x509::parse_not_after(&cert_pem)
            .map_err(|e| AcmeError::CertGeneration(format!("parse issued certificate: {e}")))?;

        tracing::info!(%hostname, %expires_at, "certificate issued");

        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            domain: hostname.to_string(),
            expires_at,
        })
    }

    /// Loads the persisted account from `account_key_path` if one exists;
    /// otherwise registers a new account and persists its credentials so
    /// later calls reuse the same account key rather than registering again.
    async fn ensure_account(&self, account_key_path: &Path) -> Result<Account, AcmeError> {
        if let Ok(existing) = std::fs::read_to_string(account_key_path) {
            if let Ok(credentials) = serde_json::from_str::<AccountCredentials>(&existing) {
                return Account::from_credentials(credentials)
                    .await
                    .map_err(|e| AcmeError::Account(format!("restore account: {e}")));
            }
            tracing::warn!(
                path = %account_key_path.display(),
                "account key file present but unreadable, registering a new account"
            );
        }

        let contact: Vec<String> = self
            .email
            .as_ref()
            .map(|e| vec![format!("mailto:{e}")])
            .unwrap_or_default();
        let contact_refs: Vec<&str> = contact.iter().map(|s| s.as_str()).collect();

        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let builder = Account::builder()
            .map_err(|e| AcmeError::Account(format!("builder init: {e}")))?;

        let (account, credentials) = builder
            .create(&new_account, self.directory_url.clone(), None)
            .await
            .map_err(|e| AcmeError::Account(format!("registration: {e}")))?;

        let json = serde_json::to_string(&credentials)
            .map_err(|e| AcmeError::Account(format!("serialize account credentials: {e}")))?;
        if let Err(e) = crate::fsutil::write_private_file(account_key_path, json.as_bytes()) {
            tracing::warn!(error = %e, "failed to persist account credentials, will re-register next time");
        }

        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_urls_match_lets_encrypt() {
        assert!(directory::LETS_ENCRYPT_PRODUCTION.ends_with("/directory"));
        assert!(directory::LETS_ENCRYPT_STAGING.contains("staging"));
    }
}
