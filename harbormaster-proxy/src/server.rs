//! The Router component: terminates TLS on one listener (HTTPS) and
//! redirects on another (HTTP), routing every request by `Host` header
//! against the route table.
//!
//! WebSocket upgrades are relayed by hand: the backend connection is dialed
//! directly over raw TCP, the original request line and headers are written
//! to it verbatim, and once the backend answers the handshake the client
//! connection is hijacked via `hyper::upgrade` so both directions copy bytes
//! until either side closes. Everything else is proxied through a pooled
//! `hyper-util` client, the same hand-rolled-listener idiom the control
//! plane's admin server already uses.

use crate::route_table::RouteTable;
use bytes::Bytes;
use harbormaster_tls::{CertificateManager, TlsCertResolver};
use http::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Transport defaults per backend (spec §4.4). `pool_max_idle_per_host`
/// covers the per-host half of "idle pool max 100/host 10" directly; the
/// hyper-util legacy client pools per-host only and has no separate knob for
/// a cross-host total, so the "100" half is an accepted simplification
/// rather than a fabricated API call. Likewise there is no client-level
/// 100-continue wait configurable on this connector, so "expect-continue 1s"
/// has no direct equivalent here; the TLS handshake timeout applies to the
/// router's own HTTPS listener (see `serve_https`), since backend targets are
/// always dialed over plain HTTP and never perform a TLS handshake of
/// their own.
const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const BACKEND_KEEPALIVE: Duration = Duration::from_secs(30);
const BACKEND_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const BACKEND_POOL_MAX_IDLE_PER_HOST: usize = 10;
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never: std::convert::Infallible| match never {}).boxed()
}

fn text_body(body: String) -> ProxyBody {
    Full::new(Bytes::from(body)).map_err(|never: std::convert::Infallible| match never {}).boxed()
}

/// Host-routed reverse proxy shared by the HTTP (port 80) and HTTPS
/// (port 443) listeners; `is_tls` only changes ssl-redirect and
/// X-Forwarded-Proto decisions, the routing logic is identical.
pub struct Router {
    route_table: Arc<RouteTable>,
    cert_manager: Arc<CertificateManager>,
    client: LegacyClient<HttpConnector, Full<Bytes>>,
}

impl Router {
    pub fn new(route_table: Arc<RouteTable>, cert_manager: Arc<CertificateManager>) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(BACKEND_DIAL_TIMEOUT));
        connector.set_keepalive(Some(BACKEND_KEEPALIVE));

        let client = LegacyClient::builder(hyper_util::rt::TokioExecutor::new())
            .pool_idle_timeout(BACKEND_POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(BACKEND_POOL_MAX_IDLE_PER_HOST)
            .build(connector);

        Arc::new(Self {
            route_table,
            cert_manager,
            client,
        })
    }

    /// Runs the plain-HTTP listener: ACME challenges, ssl-redirects, and
    /// ordinary proxying for hosts without `ssl_redirect` set. `ready`, if
    /// given, is flipped to `true` once the socket is bound and accepting —
    /// the control plane waits on it before its first ACME attempt so HTTP-01
    /// validation has somewhere to land.
    pub async fn serve_http(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
        ready: Option<watch::Sender<bool>>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "HTTP listener ready");
        if let Some(ready) = ready {
            let _ = ready.send(true);
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let router = self.clone();
                    tokio::spawn(async move {
                        router.serve_hyper_connection(stream, peer, false).await;
                    });
                }
                _ = shutdown.changed() => {
                    tracing::info!("HTTP listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Runs the TLS listener. Certificate resolution is SNI-driven and
    /// delegated entirely to the Certificate Manager; a handshake for a
    /// hostname with no usable certificate simply fails, which is the
    /// expected behavior while acquisition is still in flight.
    pub async fn serve_https(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let resolver = Arc::new(TlsCertResolver::new(self.cert_manager.clone()));
        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "HTTPS listener ready");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let router = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                            Ok(Ok(tls_stream)) => router.serve_hyper_connection(tls_stream, peer, true).await,
                            Ok(Err(e)) => tracing::debug!(%peer, error = %e, "TLS handshake failed (no certificate yet?)"),
                            Err(_) => tracing::debug!(%peer, "TLS handshake timed out"),
                        }
                    });
                }
                _ = shutdown.changed() => {
                    tracing::info!("HTTPS listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_hyper_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr, is_tls: bool)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let router = self.clone();
        let service = service_fn(move |req| {
            let router = router.clone();
            async move { router.handle(req, peer, is_tls).await }
        });

        crate::metrics::ACTIVE_CONNECTIONS
            .with_label_values(&[if is_tls { "https" } else { "http" }])
            .inc();

        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!(%peer, error = %e, "connection ended with error");
        }
    }

    async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let method = req.method().as_str().to_string();
        let started = std::time::Instant::now();
        let host_for_metrics = request_host(&req);
        let response = self.handle_inner(req, peer, is_tls).await;
        if let Ok(resp) = &response {
            let host = if host_for_metrics.is_empty() { "-" } else { &host_for_metrics };
            crate::metrics::record_request(
                &method,
                resp.status().as_u16(),
                host,
                started.elapsed().as_secs_f64(),
            );
        }
        response
    }

    async fn handle_inner(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let path = req.uri().path().to_string();

        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            return Ok(self.serve_acme_challenge(token));
        }

        let host = request_host(&req);

        if host.is_empty() {
            return Ok(respond_plain(StatusCode::NOT_FOUND, "host not found"));
        }

        let Some(entry) = self.route_table.get(&host) else {
            tracing::info!(%host, "host not found");
            return Ok(respond_plain(StatusCode::NOT_FOUND, "host not found"));
        };

        if !entry.healthy {
            return Ok(respond_plain(StatusCode::SERVICE_UNAVAILABLE, "backend unhealthy"));
        }

        if entry.ssl_redirect && !is_tls {
            let uri = req.uri().to_string();
            return Ok(redirect_to_https(&host, &uri));
        }

        if is_websocket_upgrade(&req) {
            return Ok(self.proxy_websocket(req, &entry.target).await);
        }

        Ok(self
            .proxy_http(req, &entry.target, &host, peer, is_tls, entry.forward_headers)
            .await)
    }

    fn serve_acme_challenge(&self, token: &str) -> Response<ProxyBody> {
        match self.cert_manager.serve_http_challenge(token) {
            Some(key_authorization) => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain")
                .body(text_body(key_authorization))
                .expect("static response builds"),
            None => respond_plain(StatusCode::NOT_FOUND, "challenge not found"),
        }
    }

    async fn proxy_http(
        &self,
        req: Request<Incoming>,
        target: &str,
        host: &str,
        peer: SocketAddr,
        is_tls: bool,
        forward_headers: bool,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read request body");
                return respond_plain(StatusCode::BAD_GATEWAY, "bad request body");
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = match format!("http://{target}{path_and_query}").parse() {
            Ok(uri) => uri,
            Err(_) => return respond_plain(StatusCode::BAD_GATEWAY, "invalid upstream target"),
        };
        parts.uri = uri;

        if forward_headers {
            let proto = if is_tls { "https" } else { "http" };
            let client_ip = peer.ip().to_string();
            insert_header(&mut parts.headers, "x-real-ip", &client_ip);
            insert_header(&mut parts.headers, "x-forwarded-for", &client_ip);
            insert_header(&mut parts.headers, "x-forwarded-proto", proto);
            insert_header(&mut parts.headers, "x-forwarded-host", host);
        }

        let upstream_req = Request::from_parts(parts, Full::new(body_bytes));

        match self.client.request(upstream_req).await {
            Ok(resp) => {
                let (parts, body) = resp.into_parts();
                Response::from_parts(parts, body.map_err(|e| e.into()).boxed())
            }
            Err(e) => {
                tracing::warn!(%target, error = %e, "upstream proxy error");
                respond_plain(StatusCode::BAD_GATEWAY, "upstream connection failed")
            }
        }
    }

    /// Dials the backend directly, writes the original request line and
    /// headers verbatim, relays the backend's handshake response back to
    /// the client, then hijacks the client connection and copies bytes
    /// bidirectionally until either side closes.
    async fn proxy_websocket(&self, mut req: Request<Incoming>, target: &str) -> Response<ProxyBody> {
        let mut backend = match TcpStream::connect(target).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%target, error = %e, "websocket backend dial failed");
                return respond_plain(StatusCode::BAD_GATEWAY, "upstream connection failed");
            }
        };

        let head = serialize_request_head(&req);
        if let Err(e) = backend.write_all(&head).await {
            tracing::warn!(%target, error = %e, "failed writing websocket handshake upstream");
            return respond_plain(StatusCode::BAD_GATEWAY, "upstream connection failed");
        }

        let (status, headers) = match read_response_head(&mut backend).await {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(%target, error = %e, "failed reading websocket handshake response");
                return respond_plain(StatusCode::BAD_GATEWAY, "upstream handshake failed");
            }
        };

        let upgrade_confirmed = status == StatusCode::SWITCHING_PROTOCOLS;
        let on_upgrade = hyper::upgrade::on(&mut req);

        if upgrade_confirmed {
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let mut client_io = TokioIo::new(upgraded);
                        if let Err(e) =
                            tokio::io::copy_bidirectional(&mut client_io, &mut backend).await
                        {
                            tracing::debug!(error = %e, "websocket relay ended");
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "client upgrade negotiation failed"),
                }
            });
        }

        let mut builder = Response::builder().status(status);
        if let Some(builder_headers) = builder.headers_mut() {
            *builder_headers = headers;
        }
        builder.body(empty_body()).unwrap_or_else(|_| {
            respond_plain(StatusCode::BAD_GATEWAY, "failed to relay handshake response")
        })
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn respond_plain(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(text_body(message.to_string()))
        .expect("static response builds")
}

fn redirect_to_https(host: &str, request_uri: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, format!("https://{host}{request_uri}"))
        .body(empty_body())
        .expect("static response builds")
}

fn request_host(req: &Request<Incoming>) -> String {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_lowercase()
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let has_connection_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let is_websocket = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_connection_upgrade && is_websocket
}

fn serialize_request_head(req: &Request<Incoming>) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path).as_bytes());
    for (name, value) in req.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(StatusCode, HeaderMap)> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "backend closed before handshake"));
        }
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(502);
    let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
    }
    Ok((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_builds_https_location() {
        let resp = redirect_to_https("a.com", "/path?x=1");
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get(hyper::header::LOCATION).unwrap(),
            "https://a.com/path?x=1"
        );
    }
}
