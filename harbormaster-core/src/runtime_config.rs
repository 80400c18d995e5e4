//! Runtime configuration for the core: state/cert paths and bind addresses.
//!
//! Manifest/config-file parsing is out of scope for the core (it belongs to
//! the deployment CLI collaborator); this crate only needs a handful of
//! environment-derived settings to know where to persist state and which
//! sockets to own.

use std::path::PathBuf;

/// Let's Encrypt production directory URL.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL.
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Resolved settings for a single proxy instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the persisted state document.
    pub state_path: PathBuf,
    /// Root directory for certificate/account-key storage.
    pub certs_dir: PathBuf,
    /// Loopback bind address for the control plane API.
    pub control_plane_addr: std::net::SocketAddr,
    /// Bind address for the plain-HTTP listener (ACME challenges + redirects).
    pub http_addr: std::net::SocketAddr,
    /// Bind address for the TLS listener.
    pub https_addr: std::net::SocketAddr,
    /// Contact email used for ACME account registration.
    pub acme_email: Option<String>,
}

impl RuntimeConfig {
    /// Builds configuration from environment variables, falling back to
    /// sensible system defaults. Mirrors the "default path, with a per-user
    /// fallback when unwritable and unprivileged" rule from the interface
    /// spec.
    pub fn from_env() -> Self {
        let state_path = std::env::var("HARBORMASTER_STATE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_state_path);

        let certs_dir = std::env::var("HARBORMASTER_CERTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_certs_dir);

        let control_plane_addr = std::env::var("HARBORMASTER_CONTROL_PLANE_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| "127.0.0.1:9090".parse().unwrap());

        let http_addr = std::env::var("HARBORMASTER_HTTP_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:80".parse().unwrap());

        let https_addr = std::env::var("HARBORMASTER_HTTPS_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:443".parse().unwrap());

        let acme_email = std::env::var("HARBORMASTER_ACME_EMAIL").ok();

        Self {
            state_path,
            certs_dir,
            control_plane_addr,
            http_addr,
            https_addr,
            acme_email,
        }
    }

    /// A path under `/var/lib/harbormaster` is usable if the directory
    /// already exists and we can write to it, or it can be created (which
    /// only succeeds with sufficient privilege). Anything else falls back
    /// to a per-user directory.
    fn system_dir_usable(dir: &std::path::Path) -> bool {
        if dir.exists() {
            is_dir_writable(dir)
        } else {
            std::fs::create_dir_all(dir).is_ok()
        }
    }

    fn default_state_path() -> PathBuf {
        let system_dir = PathBuf::from("/var/lib/harbormaster");
        if Self::system_dir_usable(&system_dir) {
            system_dir.join("state.json")
        } else {
            Self::user_fallback_dir().join("state.json")
        }
    }

    fn default_certs_dir() -> PathBuf {
        let system_dir = PathBuf::from("/var/lib/harbormaster/certs");
        if Self::system_dir_usable(&system_dir) {
            system_dir
        } else {
            Self::user_fallback_dir().join("certs")
        }
    }

    fn user_fallback_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("harbormaster")
    }
}

fn is_dir_writable(dir: &std::path::Path) -> bool {
    let probe = dir.join(".harbormaster-write-check");
    let writable = std::fs::write(&probe, b"").is_ok();
    let _ = std::fs::remove_file(&probe);
    writable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_match_spec() {
        // Safe in isolation: clears any leaked HARBORMASTER_* env from other tests.
        for var in [
            "HARBORMASTER_STATE_PATH",
            "HARBORMASTER_CERTS_DIR",
            "HARBORMASTER_CONTROL_PLANE_ADDR",
            "HARBORMASTER_HTTP_ADDR",
            "HARBORMASTER_HTTPS_ADDR",
        ] {
            unsafe { std::env::remove_var(var) };
        }
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.http_addr.port(), 80);
        assert_eq!(cfg.https_addr.port(), 443);
        assert_eq!(cfg.control_plane_addr.port(), 9090);
    }
}
