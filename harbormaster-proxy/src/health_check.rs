//! Health Checker: periodic and on-demand HTTP probes of backend targets.

use crate::route_table::RouteTable;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Per-request timeout for a single health probe.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
/// Overall budget for one host's probe, including connection setup.
const PER_HOST_TIMEOUT: Duration = Duration::from_secs(5);

/// Issues `GET http://{target}{healthPath}` probes. Healthy iff the response
/// status is in [200, 300). Probes run concurrently across hosts; per-host
/// probes are serialized by a lock held for the duration of the request.
pub struct HealthChecker {
    client: reqwest::Client,
    route_table: Arc<RouteTable>,
    state: Arc<harbormaster_core::state::StateStore>,
    in_flight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl HealthChecker {
    pub fn new(route_table: Arc<RouteTable>, state: Arc<harbormaster_core::state::StateStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builds with static config");

        Self {
            client,
            route_table,
            state,
            in_flight: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn host_lock(&self, hostname: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.in_flight.lock().await;
        locks
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Probes one host immediately, used by the control plane right after a
    /// deploy. Serialized against the periodic sweep's probe of the same host.
    pub async fn check_host(&self, hostname: &str) {
        let Some(entry) = self.route_table.get(hostname) else {
            return;
        };

        let lock = self.host_lock(hostname).await;
        let _guard = lock.lock().await;

        let url = format!("http://{}{}", entry.target, entry.health_path);
        let healthy = tokio::time::timeout(PER_HOST_TIMEOUT, self.probe(&url))
            .await
            .unwrap_or(false);

        self.route_table.set_healthy(hostname, healthy);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if let Err(e) = self.state.update_health_status(hostname, healthy, now) {
            tracing::debug!(hostname, error = %e, "failed to record health status in state store");
        }

        if healthy != entry.healthy {
            tracing::info!(hostname, healthy, "host health changed");
        }
    }

    /// Probes an arbitrary target directly, bypassing the route table. Used
    /// by the deployment controller to check a new container's health before
    /// it has ever been routed to.
    pub async fn probe_target(&self, target: &str, health_path: &str) -> bool {
        let url = format!("http://{target}{health_path}");
        tokio::time::timeout(PER_HOST_TIMEOUT, self.probe(&url))
            .await
            .unwrap_or(false)
    }

    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                (200..300).contains(&status)
            }
            Err(_) => false,
        }
    }

    /// Probes every routed host concurrently. Intended to run on a fixed
    /// interval (30s per the resource model).
    pub async fn run_sweep(&self) {
        let hosts: Vec<String> = self.route_table.all().into_iter().map(|(h, _)| h).collect();
        let checks = hosts.iter().map(|h| self.check_host(h));
        futures::future::join_all(checks).await;
    }
}
