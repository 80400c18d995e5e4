//! The lifecycle port: the collaborator boundary between the deployment
//! controller and whatever actually runs containers. The controller depends
//! only on this trait, never on a specific container runtime.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to start container {name}: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("failed to stop container {name}: {reason}")]
    StopFailed { name: String, reason: String },
}

#[async_trait]
pub trait LifecyclePort: Send + Sync {
    /// Starts a container named `name` running `image`. Implementations pick
    /// the target port convention (`{name}:3000`) and wire it up however
    /// their runtime requires.
    async fn start(&self, name: &str, image: &str) -> Result<(), LifecycleError>;

    /// Stops and removes the container named `name`.
    async fn stop(&self, name: &str) -> Result<(), LifecycleError>;
}

/// A lifecycle port that only logs: useful for tests and for running the
/// proxy standalone without a container runtime wired in.
pub struct LoggingLifecycle;

#[async_trait]
impl LifecyclePort for LoggingLifecycle {
    async fn start(&self, name: &str, image: &str) -> Result<(), LifecycleError> {
        tracing::info!(name, image, "lifecycle: start (no-op runtime)");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), LifecycleError> {
        tracing::info!(name, "lifecycle: stop (no-op runtime)");
        Ok(())
    }
}
