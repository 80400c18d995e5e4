//! Deployment Controller: orchestrates blue-green cutovers per hostname.
//!
//! Deployment work across every hostname is serialized by one controller-
//! wide mutex rather than a lock per hostname: deploys are rare enough that
//! the simpler design costs nothing in practice, and it trivially gives the
//! per-hostname serialization the state machine actually needs.

use crate::events::{Event, EventBus};
use crate::lifecycle::LifecyclePort;
use crate::types::{container_name, container_target, Color, DeployState, DeploymentRecord, HealthState};
use harbormaster_core::state::StateStore;
use harbormaster_proxy::{HealthChecker, RouteEntry, RouteTable};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Probe cadence in production; ~1 minute total at 12 attempts.
const PROD_PROBE_INTERVAL: Duration = Duration::from_secs(5);
const MAX_PROBE_ATTEMPTS: u32 = 12;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("hostname must not be empty")]
    EmptyHostname,

    #[error("image must not be empty")]
    EmptyImage,

    #[error("no host record for {0}")]
    UnknownHost(String),

    #[error("no active deployment for {0}")]
    NoActiveDeployment(String),

    #[error("rollback target is not healthy")]
    RollbackTargetUnavailable,

    #[error("new container failed to become healthy within the probe budget")]
    ProbeFailed,

    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),

    #[error(transparent)]
    State(#[from] harbormaster_core::Error),
}

pub struct DeploymentController {
    records: Mutex<HashMap<String, DeploymentRecord>>,
    state_store: Arc<StateStore>,
    route_table: Arc<RouteTable>,
    health_checker: Arc<HealthChecker>,
    lifecycle: Arc<dyn LifecyclePort>,
    events: Arc<EventBus>,
    probe_interval: Duration,
    max_attempts: u32,
}

impl DeploymentController {
    pub fn new(
        state_store: Arc<StateStore>,
        route_table: Arc<RouteTable>,
        health_checker: Arc<HealthChecker>,
        lifecycle: Arc<dyn LifecyclePort>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            state_store,
            route_table,
            health_checker,
            lifecycle,
            events,
            probe_interval: PROD_PROBE_INTERVAL,
            max_attempts: MAX_PROBE_ATTEMPTS,
        }
    }

    /// Overrides the probe cadence; tests use a short interval so the state
    /// machine doesn't take a full minute to exercise.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Overrides the probe attempt budget; tests use a small budget so a
    /// guaranteed-unreachable target fails quickly.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Runs the full Idle -> Deploy -> Probing -> Switching -> Retiring cycle
    /// (or -> Failed) for one hostname.
    pub async fn deploy(&self, hostname: &str, image: &str) -> Result<(), DeployError> {
        if hostname.is_empty() {
            return Err(DeployError::EmptyHostname);
        }
        if image.is_empty() {
            return Err(DeployError::EmptyImage);
        }

        let health_path = self
            .state_store
            .get_host(hostname)
            .map(|h| h.health_path)
            .unwrap_or_else(|| "/up".to_string());

        let mut records = self.records.lock().await;
        let record = records
            .entry(hostname.to_string())
            .or_insert_with(|| DeploymentRecord::new(hostname, health_path.clone()));

        // First deploy: `active` starts as None (the empty initial color);
        // land on green. Every deploy after that alternates.
        let color = match record.active {
            None => Color::Green,
            Some(active) => active.other(),
        };

        let name = container_name(hostname, color);
        let target = container_target(&name);

        record.state = DeployState::Probing;
        self.events.publish(Event::DeploymentStarted {
            hostname: hostname.to_string(),
            color,
        });

        if let Err(e) = self.lifecycle.start(&name, image).await {
            record.state = DeployState::Failed;
            self.events.publish(Event::DeploymentFailed {
                hostname: hostname.to_string(),
                reason: e.to_string(),
            });
            return Err(e.into());
        }

        {
            let descriptor = record.descriptor_mut(color);
            descriptor.identifier = Some(name.clone());
            descriptor.target = Some(target.clone());
            descriptor.health_path = health_path.clone();
            descriptor.health_state = HealthState::Checking;
            descriptor.started_at = Some(crate::types::now_unix());
        }

        let mut healthy = false;
        for attempt in 1..=self.max_attempts {
            if self.health_checker.probe_target(&target, &health_path).await {
                healthy = true;
                break;
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.probe_interval).await;
            }
        }

        if !healthy {
            record.state = DeployState::Failed;
            record.descriptor_mut(color).health_state = HealthState::Unhealthy;
            let _ = self.lifecycle.stop(&name).await;
            record.descriptor_mut(color).clear();
            self.events.publish(Event::DeploymentFailed {
                hostname: hostname.to_string(),
                reason: "new container did not become healthy".to_string(),
            });
            return Err(DeployError::ProbeFailed);
        }

        self.events.publish(Event::HealthCheckPassed {
            hostname: hostname.to_string(),
            target: target.clone(),
        });

        // Switching: flip route table + persisted target together so the
        // active container's target always matches the host record's.
        record.state = DeployState::Switching;
        record.descriptor_mut(color).health_state = HealthState::Healthy;

        let host = self.state_store.get_host(hostname);
        self.route_table.upsert(
            hostname,
            RouteEntry {
                target: target.clone(),
                healthy: true,
                health_path: health_path.clone(),
                ssl_enabled: host.as_ref().map(|h| h.ssl_enabled).unwrap_or(false),
                ssl_redirect: host.as_ref().map(|h| h.ssl_redirect).unwrap_or(false),
                forward_headers: host.as_ref().map(|h| h.forward_headers).unwrap_or(false),
            },
        );
        self.state_store.switch_target(hostname, &target)?;
        record.active = Some(color);
        self.events.publish(Event::TrafficSwitched {
            hostname: hostname.to_string(),
            target,
        });

        // Retiring: stop and clear the color that just lost traffic.
        record.state = DeployState::Retiring;
        let old_color = color.other();
        if let Some(old_name) = record.descriptor(old_color).identifier.clone() {
            let _ = self.lifecycle.stop(&old_name).await;
        }
        let old_descriptor = record.descriptor_mut(old_color);
        old_descriptor.clear();
        old_descriptor.health_state = HealthState::Stopped;

        self.events.publish(Event::DeploymentCompleted {
            hostname: hostname.to_string(),
        });
        record.state = DeployState::Idle;
        record.updated_at = crate::types::now_unix();

        Ok(())
    }

    /// Flips active to the other color, but only if it's populated and
    /// healthy. Does not touch the lifecycle port.
    pub async fn rollback(&self, hostname: &str) -> Result<(), DeployError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(hostname)
            .ok_or_else(|| DeployError::UnknownHost(hostname.to_string()))?;

        let active = record
            .active
            .ok_or_else(|| DeployError::NoActiveDeployment(hostname.to_string()))?;
        let candidate = active.other();
        let descriptor = record.descriptor(candidate);

        if descriptor.health_state != HealthState::Healthy || descriptor.target.is_none() {
            return Err(DeployError::RollbackTargetUnavailable);
        }
        let target = descriptor.target.clone().unwrap();

        self.route_table.switch_target(hostname, target.clone());
        self.state_store.switch_target(hostname, &target)?;
        record.active = Some(candidate);
        self.events.publish(Event::TrafficSwitched {
            hostname: hostname.to_string(),
            target,
        });
        Ok(())
    }

    pub async fn deployment_state(&self, hostname: &str) -> Option<DeployState> {
        self.records.lock().await.get(hostname).map(|r| r.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLifecycle {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl CountingLifecycle {
        fn new() -> Self {
            Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LifecyclePort for CountingLifecycle {
        async fn start(&self, _name: &str, _image: &str) -> Result<(), crate::lifecycle::LifecycleError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _name: &str) -> Result<(), crate::lifecycle::LifecycleError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn temp_state(name: &str) -> Arc<StateStore> {
        let path = std::env::temp_dir().join(format!(
            "harbormaster_deploy_test_{name}_{}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        StateStore::load(&path).unwrap()
    }

    #[tokio::test]
    async fn deploy_with_unreachable_target_fails_after_exhausting_probes() {
        let state = temp_state("unreachable");
        state
            .deploy_host("a.com", "a-com-blue:3000", "proj", "app", None, false)
            .unwrap();
        let route_table = Arc::new(RouteTable::new());
        let health_checker = Arc::new(HealthChecker::new(route_table.clone(), state.clone()));
        let lifecycle = Arc::new(CountingLifecycle::new());
        let events = Arc::new(EventBus::default());

        let controller = DeploymentController::new(
            state.clone(),
            route_table.clone(),
            health_checker,
            lifecycle.clone(),
            events,
        )
        .with_probe_interval(Duration::from_millis(1))
        .with_max_attempts(2);

        let result = controller.deploy("a.com", "app:latest").await;
        assert!(matches!(result, Err(DeployError::ProbeFailed)));
        assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.stops.load(Ordering::SeqCst), 1);
        assert!(route_table.get("a.com").is_none());
    }

    #[tokio::test]
    async fn rollback_without_prior_deploy_is_rejected() {
        let state = temp_state("rollback_reject");
        let route_table = Arc::new(RouteTable::new());
        let health_checker = Arc::new(HealthChecker::new(route_table.clone(), state.clone()));
        let events = Arc::new(EventBus::default());
        let controller = DeploymentController::new(
            state,
            route_table,
            health_checker,
            Arc::new(CountingLifecycle::new()),
            events,
        );

        let err = controller.rollback("a.com").await.unwrap_err();
        assert!(matches!(err, DeployError::UnknownHost(_)));
    }
}
