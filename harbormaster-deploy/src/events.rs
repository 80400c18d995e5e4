//! Deployment lifecycle events, published over a broadcast channel so the
//! control plane (or future subscribers) can observe a deploy in progress
//! without polling state.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    DeploymentStarted { hostname: String, color: crate::types::Color },
    TrafficSwitched { hostname: String, target: String },
    DeploymentCompleted { hostname: String },
    DeploymentFailed { hostname: String, reason: String },
    HealthCheckPassed { hostname: String, target: String },
}

impl Event {
    fn hostname(&self) -> &str {
        match self {
            Event::DeploymentStarted { hostname, .. }
            | Event::TrafficSwitched { hostname, .. }
            | Event::DeploymentCompleted { hostname }
            | Event::DeploymentFailed { hostname, .. }
            | Event::HealthCheckPassed { hostname, .. } => hostname,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Event::DeploymentStarted { .. } => "started",
            Event::TrafficSwitched { .. } => "traffic_switched",
            Event::DeploymentCompleted { .. } => "completed",
            Event::DeploymentFailed { .. } => "failed",
            Event::HealthCheckPassed { .. } => "health_check_passed",
        }
    }
}

/// Thin wrapper around `broadcast::Sender`. Slow subscribers drop events
/// rather than backpressure the deployment controller; nobody is required
/// to subscribe at all.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes an event. No subscribers is not an error. Also records a
    /// `harbormaster_deployment_transitions_total` metric so deployment
    /// activity is visible without subscribing to the bus.
    pub fn publish(&self, event: Event) {
        harbormaster_proxy::metrics::DEPLOYMENT_TRANSITIONS_TOTAL
            .with_label_values(&[event.hostname(), event.kind()])
            .inc();
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
