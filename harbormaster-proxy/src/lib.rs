//! Router component: host-routed reverse proxy and health checker.

pub mod health_check;
pub mod metrics;
pub mod route_table;
pub mod server;

pub use health_check::HealthChecker;
pub use route_table::{RouteEntry, RouteTable};
pub use server::Router;
