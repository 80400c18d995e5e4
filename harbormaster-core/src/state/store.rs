//! Persistent state store: the authoritative project/host document.
//!
//! Guarded by a single `parking_lot::RwLock`, flushed to disk via
//! write-to-temp-then-rename whenever a dirty flag is set. Health updates
//! never mark the document dirty — they are runtime-only.

use crate::error::{Error, Result};
use crate::state::types::{CertStatusKind, CertificateStatus, Document, Host, Project};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The authoritative persisted state for a single proxy instance.
pub struct StateStore {
    path: PathBuf,
    document: RwLock<Document>,
    dirty: AtomicBool,
}

impl StateStore {
    /// Loads the document from `path`, or starts from a fresh default if the
    /// file is missing. Malformed JSON is fatal (returned as `Error::Corrupt`)
    /// since a partially-trusted document could silently drop routes.
    pub fn load(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let document = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Corrupt(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Arc::new(Self {
            path,
            document: RwLock::new(document),
            dirty: AtomicBool::new(false),
        }))
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Idempotently creates or updates a host. Preserves any existing
    /// certificate status verbatim; initializes a pending status if SSL is
    /// newly enabled and no certificate exists yet.
    pub fn deploy_host(
        &self,
        hostname: &str,
        target: &str,
        project: &str,
        app: &str,
        health_path: Option<&str>,
        ssl_enabled: bool,
    ) -> Result<Host> {
        if hostname.is_empty() {
            return Err(Error::Invalid("hostname cannot be empty".to_string()));
        }

        let mut doc = self.document.write();
        let existing_certificate = doc
            .projects
            .values()
            .find_map(|p| p.hosts.get(hostname).and_then(|h| h.certificate.clone()));

        let proj = doc.projects.entry(project.to_string()).or_default();
        let mut host = proj
            .hosts
            .get(hostname)
            .cloned()
            .unwrap_or_else(|| Host::new(hostname, target, app));

        host.target = target.to_string();
        host.app = app.to_string();
        if let Some(path) = health_path {
            host.health_path = path.to_string();
        }
        host.ssl_enabled = ssl_enabled;

        host.certificate = match existing_certificate {
            Some(cert) => Some(cert),
            None if ssl_enabled => Some(CertificateStatus::pending()),
            None => None,
        };

        proj.hosts.insert(hostname.to_string(), host.clone());
        self.mark_dirty();
        Ok(host)
    }

    /// Removes a host, garbage-collecting its project if it becomes empty.
    pub fn remove_host(&self, hostname: &str) -> Result<()> {
        let mut doc = self.document.write();
        let mut emptied_project = None;
        for (name, project) in doc.projects.iter_mut() {
            if project.hosts.remove(hostname).is_some() {
                if project.hosts.is_empty() {
                    emptied_project = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied_project {
            doc.projects.remove(&name);
        }
        self.mark_dirty();
        Ok(())
    }

    /// Snapshot read of a single host.
    pub fn get_host(&self, hostname: &str) -> Option<Host> {
        let doc = self.document.read();
        doc.projects
            .values()
            .find_map(|p| p.hosts.get(hostname).cloned())
    }

    /// Snapshot read of every host across every project.
    pub fn get_all_hosts(&self) -> Vec<Host> {
        let doc = self.document.read();
        doc.projects
            .values()
            .flat_map(|p| p.hosts.values().cloned())
            .collect()
    }

    /// Targeted mutation of certificate status. Marks the document dirty:
    /// certificate status is persisted state, unlike runtime health.
    pub fn update_certificate_status<F>(&self, hostname: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut CertificateStatus),
    {
        let mut doc = self.document.write();
        for project in doc.projects.values_mut() {
            if let Some(host) = project.hosts.get_mut(hostname) {
                let cert = host
                    .certificate
                    .get_or_insert_with(CertificateStatus::pending);
                mutate(cert);
                self.mark_dirty();
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("host {hostname}")))
    }

    /// Runtime-only health mutation. Does NOT mark the document dirty.
    pub fn update_health_status(&self, hostname: &str, healthy: bool, probed_at: i64) -> Result<()> {
        let mut doc = self.document.write();
        for project in doc.projects.values_mut() {
            if let Some(host) = project.hosts.get_mut(hostname) {
                host.healthy = healthy;
                host.last_probe_at = Some(probed_at);
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("host {hostname}")))
    }

    /// Targeted mutation of the routing flags `DeployHost` doesn't cover
    /// (ssl_redirect, forward_headers, response_timeout). `None` leaves a
    /// field untouched, letting the control plane patch a single flag at a
    /// time.
    pub fn set_host_options(
        &self,
        hostname: &str,
        ssl_redirect: Option<bool>,
        forward_headers: Option<bool>,
        response_timeout: Option<String>,
    ) -> Result<()> {
        let mut doc = self.document.write();
        for project in doc.projects.values_mut() {
            if let Some(host) = project.hosts.get_mut(hostname) {
                if let Some(v) = ssl_redirect {
                    host.ssl_redirect = v;
                }
                if let Some(v) = forward_headers {
                    host.forward_headers = v;
                }
                if response_timeout.is_some() {
                    host.response_timeout = response_timeout;
                }
                self.mark_dirty();
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("host {hostname}")))
    }

    /// Blue-green pivot: updates the host's current backend target.
    pub fn switch_target(&self, hostname: &str, new_target: &str) -> Result<()> {
        let mut doc = self.document.write();
        for project in doc.projects.values_mut() {
            if let Some(host) = project.hosts.get_mut(hostname) {
                host.target = new_target.to_string();
                self.mark_dirty();
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("host {hostname}")))
    }

    /// Toggles the ACME directory between production and staging.
    pub fn set_lets_encrypt_staging(&self, staging: bool) {
        let mut doc = self.document.write();
        doc.lets_encrypt.staging = staging;
        doc.lets_encrypt.directory_url = if staging {
            crate::runtime_config::LETS_ENCRYPT_STAGING.to_string()
        } else {
            crate::runtime_config::LETS_ENCRYPT_PRODUCTION.to_string()
        };
        self.mark_dirty();
    }

    /// Snapshot of the current Let's Encrypt configuration.
    pub fn lets_encrypt_config(&self) -> crate::state::types::LetsEncryptConfig {
        self.document.read().lets_encrypt.clone()
    }

    /// Lists hosts whose certificate is past `max_attempts` without being
    /// marked `failed` yet — used only for invariant checks in tests; the
    /// certificate manager itself drives this transition directly.
    pub fn hosts_with_status(&self, status: CertStatusKind) -> Vec<Host> {
        self.get_all_hosts()
            .into_iter()
            .filter(|h| {
                h.certificate
                    .as_ref()
                    .map(|c| c.status == status)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Flushes the document to disk if dirty, via write-to-temp-then-rename.
    /// Returns `Ok(false)` without touching disk if nothing changed.
    pub fn flush_if_dirty(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        self.flush().map(|_| true)
    }

    /// Unconditionally flushes to disk (used by callers that need immediate
    /// on-disk visibility and by graceful shutdown).
    pub fn flush(&self) -> Result<()> {
        let mut doc = self.document.read().clone();
        doc.metadata.last_updated = crate::state::types::unix_now();
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| Error::Internal(format!("failed to serialize state: {e}")))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_sibling(&self.path);
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Spawns the 60s persistence worker. Exits when `shutdown` resolves.
    pub fn spawn_persistence_worker(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = store.flush_if_dirty() {
                            tracing::warn!("state flush failed, will retry next tick: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(e) = store.flush() {
                            tracing::error!("final state flush on shutdown failed: {e}");
                        }
                        break;
                    }
                }
            }
        })
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| format!(".{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| ".state.tmp".to_string());
    match path.parent() {
        Some(parent) => parent.join(file_name),
        None => PathBuf::from(file_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("harbormaster_test_{name}_{}.json", std::process::id()))
    }

    #[test]
    fn deploy_then_redeploy_preserves_certificate() {
        let path = temp_path("deploy_preserve");
        let _ = std::fs::remove_file(&path);
        let store = StateStore::load(&path).unwrap();

        store
            .deploy_host("a.com", "blue:3000", "proj", "app", None, true)
            .unwrap();
        store
            .update_certificate_status("a.com", |c| {
                c.status = CertStatusKind::Active;
                c.expires_at = Some(9_999_999_999);
            })
            .unwrap();

        store
            .deploy_host("a.com", "green:3000", "proj", "app", None, true)
            .unwrap();

        let host = store.get_host("a.com").unwrap();
        assert_eq!(host.target, "green:3000");
        assert_eq!(host.certificate.unwrap().status, CertStatusKind::Active);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn remove_host_garbage_collects_empty_project() {
        let path = temp_path("gc_project");
        let _ = std::fs::remove_file(&path);
        let store = StateStore::load(&path).unwrap();

        store
            .deploy_host("a.com", "blue:3000", "proj", "app", None, false)
            .unwrap();
        store.remove_host("a.com").unwrap();

        assert!(store.get_host("a.com").is_none());
        assert!(store.document.read().projects.get("proj").is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn health_update_does_not_mark_dirty() {
        let path = temp_path("health_not_dirty");
        let _ = std::fs::remove_file(&path);
        let store = StateStore::load(&path).unwrap();
        store
            .deploy_host("a.com", "blue:3000", "proj", "app", None, false)
            .unwrap();
        store.dirty.store(false, Ordering::Release);

        store.update_health_status("a.com", true, 123).unwrap();
        assert!(!store.dirty.load(Ordering::Acquire));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn save_then_load_round_trips_modulo_runtime_fields() {
        let path = temp_path("round_trip");
        let _ = std::fs::remove_file(&path);
        let store = StateStore::load(&path).unwrap();
        store
            .deploy_host("a.com", "blue:3000", "proj", "app", None, true)
            .unwrap();
        store.update_health_status("a.com", true, 42).unwrap();
        store.flush().unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        let host = reloaded.get_host("a.com").unwrap();
        assert_eq!(host.target, "blue:3000");
        assert!(!host.healthy, "runtime health flag must not be persisted");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn set_host_options_patches_only_given_fields() {
        let path = temp_path("host_options");
        let _ = std::fs::remove_file(&path);
        let store = StateStore::load(&path).unwrap();
        store
            .deploy_host("a.com", "blue:3000", "proj", "app", None, false)
            .unwrap();

        store
            .set_host_options("a.com", Some(true), None, None)
            .unwrap();
        let host = store.get_host("a.com").unwrap();
        assert!(host.ssl_redirect);
        assert!(!host.forward_headers);

        store
            .set_host_options("a.com", None, Some(true), Some("30s".to_string()))
            .unwrap();
        let host = store.get_host("a.com").unwrap();
        assert!(host.ssl_redirect, "untouched field must survive a later patch");
        assert!(host.forward_headers);
        assert_eq!(host.response_timeout.as_deref(), Some("30s"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn empty_hostname_rejected() {
        let path = temp_path("empty_hostname");
        let _ = std::fs::remove_file(&path);
        let store = StateStore::load(&path).unwrap();
        let err = store
            .deploy_host("", "blue:3000", "proj", "app", None, false)
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        let _ = std::fs::remove_file(&path);
    }
}
