//! Control plane listener: a plain `hyper` HTTP/1.1 loop on loopback, the
//! same hand-rolled-listener shape the teacher's admin API used, routing a
//! handful of fixed paths instead of hot-reloading a config file.

use crate::handlers::{self, ApiBody};
use harbormaster_core::state::StateStore;
use harbormaster_deploy::DeploymentController;
use harbormaster_proxy::{HealthChecker, RouteTable};
use harbormaster_tls::CertificateManager;
use http::{Method, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Everything a control-plane request needs to act on.
pub struct ApiState {
    pub state_store: Arc<StateStore>,
    pub cert_manager: Arc<CertificateManager>,
    pub route_table: Arc<RouteTable>,
    pub health_checker: Arc<HealthChecker>,
    pub controller: Arc<DeploymentController>,
    /// Flips to `true` once the HTTP (port 80) listener has bound and is
    /// accepting; `POST /api/deploy` waits on this (10s cap) before kicking
    /// off certificate acquisition, so ACME HTTP-01 validation can actually
    /// reach the challenge path.
    pub http_ready: watch::Receiver<bool>,
}

pub async fn run_control_plane(
    addr: SocketAddr,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control plane listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { route(req, state).await }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(%peer, error = %e, "control plane connection ended with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                tracing::info!("control plane shutting down");
                return Ok(());
            }
        }
    }
}

async fn route(req: Request<Incoming>, state: Arc<ApiState>) -> Result<Response<ApiBody>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => bytes::Bytes::new(),
    };

    let response = match segments.as_slice() {
        ["api", "deploy"] => match method {
            Method::POST => handlers::deploy(&state, &body).await,
            _ => handlers::method_not_allowed(),
        },
        ["api", "hosts"] => match method {
            Method::GET => handlers::list_hosts(&state),
            _ => handlers::method_not_allowed(),
        },
        ["api", "hosts", host] => match method {
            Method::DELETE => handlers::remove_host(&state, host),
            Method::PATCH => handlers::switch_target(&state, host, &body),
            _ => handlers::method_not_allowed(),
        },
        ["api", "hosts", host, "health"] => match method {
            Method::PUT => handlers::set_health(&state, host, &body),
            _ => handlers::method_not_allowed(),
        },
        ["api", "cert", "renew", host] => match method {
            Method::POST => handlers::renew_cert(&state, host).await,
            _ => handlers::method_not_allowed(),
        },
        ["api", "staging"] => match method {
            Method::PUT => handlers::set_staging(&state, &body),
            _ => handlers::method_not_allowed(),
        },
        ["api", "status"] => match method {
            Method::GET => handlers::status(&state, query_param(&uri, "host")),
            _ => handlers::method_not_allowed(),
        },
        ["api", "metrics"] => match method {
            Method::GET => handlers::metrics(),
            _ => handlers::method_not_allowed(),
        },
        _ => handlers::not_found(),
    };

    Ok(response)
}

fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_finds_named_value() {
        let uri: Uri = "/api/status?host=a.com&x=1".parse().unwrap();
        assert_eq!(query_param(&uri, "host"), Some("a.com".to_string()));
        assert_eq!(query_param(&uri, "missing"), None);
    }
}
