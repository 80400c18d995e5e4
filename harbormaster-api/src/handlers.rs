//! Control plane request handlers, one function per `§4.6` operation.

use crate::server::ApiState;
use bytes::Bytes;
use harbormaster_core::state::Host;
use harbormaster_deploy::types::{container_name, container_target, Color};
use http::StatusCode;
use http_body_util::Full;
use hyper::Response;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub type ApiBody = Full<Bytes>;

fn envelope(status: StatusCode, success: bool, message: impl Into<String>, data: Option<Value>) -> Response<ApiBody> {
    let body = json!({
        "success": success,
        "message": message.into(),
        "data": data,
    });
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("envelope response always builds")
}

fn ok(message: impl Into<String>, data: Option<Value>) -> Response<ApiBody> {
    envelope(StatusCode::OK, true, message, data)
}

fn bad_request(message: impl Into<String>) -> Response<ApiBody> {
    envelope(StatusCode::BAD_REQUEST, false, message, None)
}

fn not_found_msg(message: impl Into<String>) -> Response<ApiBody> {
    envelope(StatusCode::NOT_FOUND, false, message, None)
}

fn internal_error(message: impl Into<String>) -> Response<ApiBody> {
    envelope(StatusCode::INTERNAL_SERVER_ERROR, false, message, None)
}

pub fn not_found() -> Response<ApiBody> {
    not_found_msg("no such route")
}

pub fn method_not_allowed() -> Response<ApiBody> {
    envelope(StatusCode::METHOD_NOT_ALLOWED, false, "method not allowed", None)
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn host_to_json(host: &Host, route_table: &harbormaster_proxy::RouteTable) -> Value {
    let mut value = serde_json::to_value(host).unwrap_or_else(|_| json!({}));
    if let Some(obj) = value.as_object_mut() {
        let healthy = route_table.get(&host.hostname).map(|e| e.healthy).unwrap_or(false);
        obj.insert("healthy".to_string(), json!(healthy));
    }
    value
}

#[derive(Deserialize)]
struct DeployRequest {
    hostname: String,
    image: String,
    project: String,
    app: String,
    #[serde(default)]
    health_path: Option<String>,
    #[serde(default)]
    ssl_enabled: bool,
    #[serde(default)]
    ssl_redirect: bool,
    #[serde(default)]
    forward_headers: bool,
    #[serde(default)]
    response_timeout: Option<String>,
}

/// `POST /api/deploy` — writes the host record, runs the blue-green cycle to
/// completion, triggers an immediate health probe, and — if SSL is enabled —
/// waits for the HTTP listener to become ready (10s cap) before kicking off
/// certificate acquisition in the background, so HTTP-01 challenges can
/// actually be served once the ACME client starts polling.
pub async fn deploy(state: &Arc<ApiState>, body: &[u8]) -> Response<ApiBody> {
    let req: DeployRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("invalid deploy request: {e}")),
    };

    if req.hostname.is_empty() {
        return bad_request("hostname must not be empty");
    }
    if req.image.is_empty() {
        return bad_request("image tag cannot be empty");
    }
    if req.project.is_empty() || req.app.is_empty() {
        return bad_request("project and app are both required");
    }

    // Placeholder target for the host record; DeploymentController picks the
    // real color and overwrites it via SwitchTarget once the new container
    // probes healthy.
    let placeholder_target = container_target(&container_name(&req.hostname, Color::Blue));
    if let Err(e) = state.state_store.deploy_host(
        &req.hostname,
        &placeholder_target,
        &req.project,
        &req.app,
        req.health_path.as_deref(),
        req.ssl_enabled,
    ) {
        return internal_error(format!("failed to persist host record: {e}"));
    }

    if let Err(e) = state.state_store.set_host_options(
        &req.hostname,
        Some(req.ssl_redirect),
        Some(req.forward_headers),
        req.response_timeout.clone(),
    ) {
        tracing::warn!(hostname = %req.hostname, error = %e, "failed to persist routing flags");
    }

    if let Err(e) = state.controller.deploy(&req.hostname, &req.image).await {
        return internal_error(format!("deployment failed: {e}"));
    }

    state.health_checker.check_host(&req.hostname).await;

    if req.ssl_enabled {
        let hostname = req.hostname.clone();
        let cert_manager = state.cert_manager.clone();
        let mut http_ready = state.http_ready.clone();
        tokio::spawn(async move {
            let _ = tokio::time::timeout(Duration::from_secs(10), http_ready.wait_for(|ready| *ready)).await;
            if let Err(e) = cert_manager.acquire_certificate(&hostname).await {
                tracing::debug!(%hostname, error = %e, "post-deploy certificate acquisition skipped or failed");
            }
        });
    }

    ok("deployment completed", Some(json!({"hostname": req.hostname})))
}

/// `GET /api/hosts` — a snapshot of every host across every project, with the
/// Router's live `healthy` flag merged in.
pub fn list_hosts(state: &Arc<ApiState>) -> Response<ApiBody> {
    let hosts: Vec<Value> = state
        .state_store
        .get_all_hosts()
        .iter()
        .map(|h| host_to_json(h, &state.route_table))
        .collect();
    ok("hosts listed", Some(json!(hosts)))
}

/// `DELETE /api/hosts/{host}`.
pub fn remove_host(state: &Arc<ApiState>, hostname: &str) -> Response<ApiBody> {
    if state.state_store.get_host(hostname).is_none() {
        return not_found_msg(format!("no such host: {hostname}"));
    }
    if let Err(e) = state.state_store.remove_host(hostname) {
        return internal_error(format!("failed to remove host: {e}"));
    }
    state.route_table.remove(hostname);
    ok(format!("host {hostname} removed"), None)
}

#[derive(Deserialize)]
struct HealthRequest {
    healthy: bool,
}

/// `PUT /api/hosts/{host}/health` — sets the runtime health flag directly,
/// bypassing the periodic sweep.
pub fn set_health(state: &Arc<ApiState>, hostname: &str, body: &[u8]) -> Response<ApiBody> {
    let req: HealthRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("invalid health request: {e}")),
    };
    if state.state_store.get_host(hostname).is_none() {
        return not_found_msg(format!("no such host: {hostname}"));
    }

    state.route_table.set_healthy(hostname, req.healthy);
    if let Err(e) = state.state_store.update_health_status(hostname, req.healthy, now_unix()) {
        return internal_error(format!("failed to update health: {e}"));
    }
    ok(format!("host {hostname} health set to {}", req.healthy), None)
}

#[derive(Deserialize)]
struct SwitchTargetRequest {
    target: String,
}

/// `PATCH /api/hosts/{host}` — a manual blue-green pivot, bypassing the
/// probe-then-switch cycle `DeploymentController::deploy` runs.
pub fn switch_target(state: &Arc<ApiState>, hostname: &str, body: &[u8]) -> Response<ApiBody> {
    let req: SwitchTargetRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("invalid switch-target request: {e}")),
    };
    if req.target.is_empty() {
        return bad_request("target must not be empty");
    }
    if state.state_store.get_host(hostname).is_none() {
        return not_found_msg(format!("no such host: {hostname}"));
    }

    if let Err(e) = state.state_store.switch_target(hostname, &req.target) {
        return internal_error(format!("failed to switch target: {e}"));
    }
    state.route_table.switch_target(hostname, req.target.clone());
    ok(format!("host {hostname} switched to {}", req.target), None)
}

/// `POST /api/cert/renew/{host}` — forces renewal regardless of the 30-day window.
pub async fn renew_cert(state: &Arc<ApiState>, hostname: &str) -> Response<ApiBody> {
    if state.state_store.get_host(hostname).is_none() {
        return not_found_msg(format!("no such host: {hostname}"));
    }
    match state.cert_manager.renew_certificate(hostname).await {
        Ok(()) => ok(format!("certificate renewed for {hostname}"), None),
        Err(e) => internal_error(format!("renewal failed: {e}")),
    }
}

#[derive(Deserialize)]
struct StagingRequest {
    staging: bool,
}

/// `PUT /api/staging` — toggles the ACME directory and rebuilds the client.
pub fn set_staging(state: &Arc<ApiState>, body: &[u8]) -> Response<ApiBody> {
    let req: StagingRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("invalid staging request: {e}")),
    };
    state.state_store.set_lets_encrypt_staging(req.staging);
    state.cert_manager.update_acme_client();
    ok(format!("ACME staging set to {}", req.staging), None)
}

/// `GET /api/metrics` — Prometheus text-format exposition of request and
/// deployment-transition counters.
pub fn metrics() -> Response<ApiBody> {
    let body = harbormaster_proxy::metrics::gather();
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(body)))
        .expect("metrics response always builds")
}

/// `GET /api/status[?host=]` — certificate status for one host, or all hosts.
pub fn status(state: &Arc<ApiState>, host: Option<String>) -> Response<ApiBody> {
    match host {
        Some(hostname) => match state.state_store.get_host(&hostname) {
            Some(host) => ok(
                "certificate status",
                Some(json!({"hostname": host.hostname, "certificate": host.certificate})),
            ),
            None => not_found_msg(format!("no such host: {hostname}")),
        },
        None => {
            let statuses: Vec<Value> = state
                .state_store
                .get_all_hosts()
                .iter()
                .map(|h| json!({"hostname": h.hostname, "certificate": h.certificate}))
                .collect();
            ok("certificate status", Some(json!(statuses)))
        }
    }
}
