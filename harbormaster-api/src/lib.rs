//! Control plane: a loopback-only HTTP surface for deploying hosts, forcing
//! health probes, pivoting traffic, renewing certificates, and toggling ACME
//! staging. JSON only, no authentication — the port is meant to stay behind
//! loopback.

mod handlers;
pub mod server;

pub use server::{run_control_plane, ApiState};
