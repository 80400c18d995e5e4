//! The Router's authoritative runtime view: hostname -> { target, healthy }.
//!
//! Eventually consistent with the State Store; every mutation here is
//! atomic per key. This is the only thing the hot path reads per request.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Runtime routing entry for one hostname.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub target: String,
    pub healthy: bool,
    pub health_path: String,
    pub ssl_enabled: bool,
    pub ssl_redirect: bool,
    pub forward_headers: bool,
}

#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, RouteEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, hostname: impl Into<String>, entry: RouteEntry) {
        self.routes.write().insert(hostname.into(), entry);
    }

    pub fn remove(&self, hostname: &str) {
        self.routes.write().remove(hostname);
    }

    pub fn get(&self, hostname: &str) -> Option<RouteEntry> {
        self.routes.read().get(hostname).cloned()
    }

    /// Blue-green pivot: replaces the target for an existing route, marking
    /// it healthy (the deployment controller only switches after a
    /// successful probe).
    pub fn switch_target(&self, hostname: &str, new_target: impl Into<String>) {
        if let Some(entry) = self.routes.write().get_mut(hostname) {
            entry.target = new_target.into();
            entry.healthy = true;
        }
    }

    pub fn set_healthy(&self, hostname: &str, healthy: bool) {
        if let Some(entry) = self.routes.write().get_mut(hostname) {
            entry.healthy = healthy;
        }
    }

    pub fn all(&self) -> Vec<(String, RouteEntry)> {
        self.routes
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(target: &str) -> RouteEntry {
        RouteEntry {
            target: target.to_string(),
            healthy: true,
            health_path: "/up".to_string(),
            ssl_enabled: false,
            ssl_redirect: false,
            forward_headers: false,
        }
    }

    #[test]
    fn switch_target_replaces_and_marks_healthy() {
        let table = RouteTable::new();
        table.upsert("a.com", entry("blue:3000"));
        table.set_healthy("a.com", false);
        table.switch_target("a.com", "green:3000");
        let e = table.get("a.com").unwrap();
        assert_eq!(e.target, "green:3000");
        assert!(e.healthy);
    }

    #[test]
    fn remove_clears_entry() {
        let table = RouteTable::new();
        table.upsert("a.com", entry("blue:3000"));
        table.remove("a.com");
        assert!(table.get("a.com").is_none());
    }
}
