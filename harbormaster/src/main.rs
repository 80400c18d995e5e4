//! harbormaster — a TLS-terminating reverse proxy with ACME certificate
//! management, health-checked routing, and blue-green deployments.

use clap::Parser;
use harbormaster_api::{run_control_plane, ApiState};
use harbormaster_core::state::StateStore;
use harbormaster_core::RuntimeConfig;
use harbormaster_deploy::{DeploymentController, EventBus, LoggingLifecycle};
use harbormaster_proxy::{HealthChecker, RouteEntry, RouteTable, Router};
use harbormaster_tls::CertificateManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Event bus capacity: enough to absorb a burst of deploys without a
/// slow-subscriber lag before anyone reads them.
const EVENT_BUS_CAPACITY: usize = 256;
/// Deadline for listeners to unwind after shutdown is signaled.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "harbormaster")]
#[command(author, version, about = "Zero-downtime deployment proxy", long_about = None)]
struct Cli {
    /// Enable verbose (debug) logging regardless of RUST_LOG.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    // rustls 0.23 needs exactly one process-level CryptoProvider; install it
    // up front rather than leaving the HTTPS listener to discover at bind
    // time whether one was picked automatically.
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("no CryptoProvider installed yet");

    harbormaster_proxy::metrics::init();
    let config = RuntimeConfig::from_env();

    let state_store = StateStore::load(&config.state_path).unwrap_or_else(|e| {
        tracing::error!("[PROXY] failed to load state store: {e}");
        std::process::exit(1);
    });

    let cert_manager = CertificateManager::new(state_store.clone(), &config.certs_dir);

    let route_table = Arc::new(RouteTable::new());
    for host in state_store.get_all_hosts() {
        route_table.upsert(
            host.hostname.clone(),
            RouteEntry {
                target: host.target,
                healthy: false,
                health_path: host.health_path,
                ssl_enabled: host.ssl_enabled,
                ssl_redirect: host.ssl_redirect,
                forward_headers: host.forward_headers,
            },
        );
    }

    let health_checker = Arc::new(HealthChecker::new(route_table.clone(), state_store.clone()));
    let event_bus = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));
    let lifecycle = Arc::new(LoggingLifecycle);
    let controller = Arc::new(DeploymentController::new(
        state_store.clone(),
        route_table.clone(),
        health_checker.clone(),
        lifecycle,
        event_bus.clone(),
    ));

    let router = Router::new(route_table.clone(), cert_manager.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (http_ready_tx, http_ready_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    {
        let mut events = event_bus.subscribe();
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => tracing::info!(?event, "[DEPLOY] lifecycle event"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "[DEPLOY] event log fell behind, dropped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    {
        let router = router.clone();
        let addr = config.http_addr;
        let shutdown_rx = shutdown_rx.clone();
        let http_ready_tx = http_ready_tx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = router.serve_http(addr, shutdown_rx, Some(http_ready_tx)).await {
                tracing::error!("[PROXY] HTTP listener failed: {e}");
            }
        }));
    }

    {
        let router = router.clone();
        let addr = config.https_addr;
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = router.serve_https(addr, shutdown_rx).await {
                tracing::error!("[PROXY] HTTPS listener failed: {e}");
            }
        }));
    }

    let api_state = Arc::new(ApiState {
        state_store: state_store.clone(),
        cert_manager: cert_manager.clone(),
        route_table: route_table.clone(),
        health_checker: health_checker.clone(),
        controller: controller.clone(),
        http_ready: http_ready_rx,
    });

    {
        let state = api_state.clone();
        let addr = config.control_plane_addr;
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_control_plane(addr, state, shutdown_rx).await {
                tracing::error!("[PROXY] control plane failed: {e}");
            }
        }));
    }

    tasks.push(state_store.spawn_persistence_worker(shutdown_rx.clone()));

    {
        let cert_manager = cert_manager.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => cert_manager.run_acquisition_sweep().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    {
        let cert_manager = cert_manager.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(12 * 60 * 60));
            loop {
                tokio::select! {
                    _ = interval.tick() => cert_manager.run_renewal_sweep().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    {
        let health_checker = health_checker.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = interval.tick() => health_checker.run_sweep().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    tracing::info!(
        http = %config.http_addr,
        https = %config.https_addr,
        control_plane = %config.control_plane_addr,
        "harbormaster running"
    );

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, winding down");
    let _ = shutdown_tx.send(true);

    let joined = tokio::time::timeout(SHUTDOWN_DEADLINE, futures::future::join_all(tasks)).await;
    if joined.is_err() {
        tracing::warn!("shutdown deadline elapsed before all listeners stopped");
    }

    if let Err(e) = state_store.flush() {
        tracing::error!("[PROXY] final state flush failed: {e}");
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
