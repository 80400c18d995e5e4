//! Persisted data model: projects, hosts, and certificate status.
//!
//! Mirrors the on-disk schema described for the state document: a map of
//! project name to project, each holding a map of hostname to host record.
//! Runtime-only fields (`healthy`, `last_probe_at`) are `#[serde(skip)]` so a
//! document loaded from disk never resurrects a stale health verdict.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of acquisition attempts budgeted for 24h of 10-minute retries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 144;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Lifecycle status of a host's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatusKind {
    Pending,
    Acquiring,
    Active,
    Renewing,
    Failed,
}

/// Certificate status embedded in a host record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub status: CertStatusKind,
    pub acquired_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub first_attempt_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub renewal_attempts: u32,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

impl CertificateStatus {
    /// A freshly-pending status for a host that just had SSL enabled.
    pub fn pending() -> Self {
        Self {
            status: CertStatusKind::Pending,
            acquired_at: None,
            expires_at: None,
            first_attempt_at: None,
            last_attempt_at: None,
            next_attempt_at: None,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            renewal_attempts: 0,
            cert_path: None,
            key_path: None,
        }
    }

    /// True iff expiry is within `days` days of now (used for the renewal
    /// sweep's 30-day window).
    pub fn expires_within_days(&self, days: i64) -> bool {
        match self.expires_at {
            Some(expires) => expires - now_unix() < days * 24 * 60 * 60,
            None => false,
        }
    }
}

/// A single virtual host: hostname, backend target, and embedded cert status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    pub target: String,
    pub app: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    pub created_at: i64,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default)]
    pub ssl_redirect: bool,
    #[serde(default)]
    pub forward_headers: bool,
    #[serde(default)]
    pub response_timeout: Option<String>,
    #[serde(default)]
    pub certificate: Option<CertificateStatus>,

    /// Runtime-only: last health probe verdict. Never persisted.
    #[serde(skip)]
    pub healthy: bool,
    /// Runtime-only: timestamp of the last probe. Never persisted.
    #[serde(skip)]
    pub last_probe_at: Option<i64>,
}

fn default_health_path() -> String {
    "/up".to_string()
}

impl Host {
    pub fn new(hostname: impl Into<String>, target: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            target: target.into(),
            app: app.into(),
            health_path: default_health_path(),
            created_at: now_unix(),
            ssl_enabled: false,
            ssl_redirect: false,
            forward_headers: false,
            response_timeout: None,
            certificate: None,
            healthy: false,
            last_probe_at: None,
        }
    }
}

/// A named container of host records. Garbage-collected when empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    pub hosts: HashMap<String, Host>,
}

/// ACME account configuration embedded in the state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LetsEncryptConfig {
    pub account_key_file: String,
    pub directory_url: String,
    pub email: Option<String>,
    #[serde(default)]
    pub staging: bool,
}

impl Default for LetsEncryptConfig {
    fn default() -> Self {
        Self {
            account_key_file: "account.key".to_string(),
            directory_url: crate::runtime_config::LETS_ENCRYPT_PRODUCTION.to_string(),
            email: None,
            staging: false,
        }
    }
}

/// Document metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,
    pub last_updated: i64,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            version: 1,
            last_updated: now_unix(),
        }
    }
}

/// The root persisted document: `{projects, lets_encrypt, metadata}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub projects: HashMap<String, Project>,
    #[serde(default)]
    pub lets_encrypt: LetsEncryptConfig,
    #[serde(default)]
    pub metadata: Metadata,
}

pub(crate) fn unix_now() -> i64 {
    now_unix()
}
