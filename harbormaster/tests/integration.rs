//! End-to-end scenarios assembled from the real components, wired together
//! the same way `main.rs` wires them, minus the container runtime (a
//! `LoggingLifecycle` stands in — nothing in these scenarios depends on a
//! real container actually starting).

use harbormaster_core::state::StateStore;
use harbormaster_deploy::{DeployError, DeploymentController, EventBus, LoggingLifecycle};
use harbormaster_proxy::{HealthChecker, RouteEntry, RouteTable, Router};
use harbormaster_tls::CertificateManager;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

fn temp_state(name: &str) -> Arc<StateStore> {
    let path = std::env::temp_dir().join(format!(
        "harbormaster_bin_test_{name}_{}_{}.json",
        std::process::id(),
        name.len()
    ));
    let _ = std::fs::remove_file(&path);
    StateStore::load(&path).unwrap()
}

fn temp_certs_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "harbormaster_bin_test_certs_{name}_{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A minimal backend that answers every request with a fixed body, standing
/// in for a real upstream container during router-level tests.
async fn spawn_backend(body: &'static str) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let io = hyper_util::rt::TokioIo::new(stream);
                let service = hyper::service::service_fn(move |_req| async move {
                    Ok::<_, Infallible>(hyper::Response::new(http_body_util::Full::new(
                        bytes::Bytes::from(body),
                    )))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });
    addr
}

async fn wait_port_open(addr: std::net::SocketAddr) {
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("port {addr} never opened");
}

/// Scenario: blue-green happy path. The router serves the active color's
/// body and a manual pivot flips it atomically with no 5xx in between.
#[tokio::test]
async fn blue_green_switch_changes_served_body() {
    let state = temp_state("blue_green");
    let certs_dir = temp_certs_dir("blue_green");
    let cert_manager = CertificateManager::new(state.clone(), certs_dir);
    let route_table = Arc::new(RouteTable::new());

    state
        .deploy_host("test.com", "placeholder:1", "proj", "web", None, false)
        .unwrap();

    let blue_addr = spawn_backend("blue").await;
    wait_port_open(blue_addr).await;
    route_table.upsert(
        "test.com",
        RouteEntry {
            target: blue_addr.to_string(),
            healthy: true,
            health_path: "/up".to_string(),
            ssl_enabled: false,
            ssl_redirect: false,
            forward_headers: false,
        },
    );

    let router = Router::new(route_table.clone(), cert_manager);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let router_addr: std::net::SocketAddr = "127.0.0.1:18191".parse().unwrap();
    tokio::spawn(router.clone().serve_http(router_addr, shutdown_rx, None));
    wait_port_open(router_addr).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{router_addr}"))
        .header("Host", "test.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "blue");

    let green_addr = spawn_backend("green").await;
    wait_port_open(green_addr).await;
    route_table.switch_target("test.com", green_addr.to_string());
    state.switch_target("test.com", &green_addr.to_string()).unwrap();

    let resp = client
        .get(format!("http://{router_addr}"))
        .header("Host", "test.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "green");
}

/// Scenario: unhealthy new version never reaches the route table, so the
/// host stays unreachable (404) instead of ever serving a broken backend.
#[tokio::test]
async fn deploy_to_unreachable_target_never_populates_routing() {
    let state = temp_state("unreachable");
    state
        .deploy_host("failing.com", "placeholder:1", "proj", "web", None, false)
        .unwrap();

    let route_table = Arc::new(RouteTable::new());
    let health_checker = Arc::new(HealthChecker::new(route_table.clone(), state.clone()));
    let events = Arc::new(EventBus::default());
    let lifecycle = Arc::new(LoggingLifecycle);

    let controller = DeploymentController::new(
        state.clone(),
        route_table.clone(),
        health_checker,
        lifecycle,
        events,
    )
    .with_probe_interval(Duration::from_millis(1))
    .with_max_attempts(2);

    let result = controller.deploy("failing.com", "app:v1").await;
    assert!(matches!(result, Err(DeployError::ProbeFailed)));
    assert!(route_table.get("failing.com").is_none());

    let certs_dir = temp_certs_dir("unreachable");
    let cert_manager = CertificateManager::new(state.clone(), certs_dir);
    let router = Router::new(route_table, cert_manager);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let router_addr: std::net::SocketAddr = "127.0.0.1:18192".parse().unwrap();
    tokio::spawn(router.clone().serve_http(router_addr, shutdown_rx, None));
    wait_port_open(router_addr).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{router_addr}"))
        .header("Host", "failing.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

/// Scenario: an unknown `Host` header returns 404, never a panic.
#[tokio::test]
async fn unknown_host_returns_404() {
    let state = temp_state("unknown_host");
    let certs_dir = temp_certs_dir("unknown_host");
    let cert_manager = CertificateManager::new(state, certs_dir);
    let route_table = Arc::new(RouteTable::new());
    let router = Router::new(route_table, cert_manager);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let router_addr: std::net::SocketAddr = "127.0.0.1:18193".parse().unwrap();
    tokio::spawn(router.clone().serve_http(router_addr, shutdown_rx, None));
    wait_port_open(router_addr).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{router_addr}"))
        .header("Host", "nope.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

/// Scenario: a host marked unhealthy returns 503, not a proxied 5xx.
#[tokio::test]
async fn unhealthy_host_returns_503() {
    let state = temp_state("unhealthy_503");
    let certs_dir = temp_certs_dir("unhealthy_503");
    let cert_manager = CertificateManager::new(state.clone(), certs_dir);
    let route_table = Arc::new(RouteTable::new());
    route_table.upsert(
        "down.com",
        RouteEntry {
            target: "127.0.0.1:1".to_string(),
            healthy: false,
            health_path: "/up".to_string(),
            ssl_enabled: false,
            ssl_redirect: false,
            forward_headers: false,
        },
    );

    let router = Router::new(route_table, cert_manager);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let router_addr: std::net::SocketAddr = "127.0.0.1:18194".parse().unwrap();
    tokio::spawn(router.clone().serve_http(router_addr, shutdown_rx, None));
    wait_port_open(router_addr).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{router_addr}"))
        .header("Host", "down.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
}
