//! Deployment Controller: blue-green container lifecycle per hostname.

pub mod controller;
pub mod events;
pub mod lifecycle;
pub mod types;

pub use controller::{DeployError, DeploymentController};
pub use events::{Event, EventBus};
pub use lifecycle::{LifecycleError, LifecyclePort, LoggingLifecycle};
pub use types::{Color, ContainerDescriptor, DeployState, DeploymentRecord, HealthState};
