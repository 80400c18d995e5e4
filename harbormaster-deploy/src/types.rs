//! Blue-green deployment data model: one record per hostname.

use serde::{Deserialize, Serialize};

/// Which color is currently serving traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub fn other(self) -> Color {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }
}

/// Health of one color's container, as tracked by the deployment controller
/// (distinct from the Router's runtime `healthy` flag on the route table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Checking,
    Healthy,
    Unhealthy,
    Stopped,
}

/// One color slot (blue or green) of a hostname's deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub identifier: Option<String>,
    pub target: Option<String>,
    pub health_path: String,
    pub health_state: HealthState,
    pub started_at: Option<i64>,
}

impl ContainerDescriptor {
    pub fn empty(health_path: impl Into<String>) -> Self {
        Self {
            identifier: None,
            target: None,
            health_path: health_path.into(),
            health_state: HealthState::Unknown,
            started_at: None,
        }
    }

    pub fn clear(&mut self) {
        self.identifier = None;
        self.target = None;
        self.started_at = None;
    }
}

/// Where a hostname's state machine currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    Idle,
    Probing,
    Switching,
    Retiring,
    Failed,
}

/// Per-hostname deployment record: at most one color is active at any
/// instant, and the active container's target always equals the host
/// record's current target (enforced by switching both together).
#[derive(Debug, Clone)]
pub struct DeploymentRecord {
    pub hostname: String,
    pub active: Option<Color>,
    pub blue: ContainerDescriptor,
    pub green: ContainerDescriptor,
    pub state: DeployState,
    pub updated_at: i64,
}

impl DeploymentRecord {
    pub fn new(hostname: impl Into<String>, health_path: impl Into<String>) -> Self {
        let health_path = health_path.into();
        Self {
            hostname: hostname.into(),
            active: None,
            blue: ContainerDescriptor::empty(health_path.clone()),
            green: ContainerDescriptor::empty(health_path),
            state: DeployState::Idle,
            updated_at: now_unix(),
        }
    }

    pub fn descriptor(&self, color: Color) -> &ContainerDescriptor {
        match color {
            Color::Blue => &self.blue,
            Color::Green => &self.green,
        }
    }

    pub fn descriptor_mut(&mut self, color: Color) -> &mut ContainerDescriptor {
        match color {
            Color::Blue => &mut self.blue,
            Color::Green => &mut self.green,
        }
    }
}

/// Container name for a hostname/color pair: `{host-with-dots-to-dashes}-{color}`.
pub fn container_name(hostname: &str, color: Color) -> String {
    format!("{}-{}", hostname.replace('.', "-"), color.as_str())
}

/// Backend target address for a freshly started container.
pub fn container_target(container_name: &str) -> String {
    format!("{container_name}:3000")
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_replaces_dots() {
        assert_eq!(container_name("app.example.com", Color::Green), "app-example-com-green");
    }

    #[test]
    fn color_other_round_trips() {
        assert_eq!(Color::Blue.other(), Color::Green);
        assert_eq!(Color::Green.other(), Color::Blue);
    }
}
