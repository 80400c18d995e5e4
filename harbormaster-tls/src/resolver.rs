//! SNI-driven certificate resolution for the TLS listener.

use crate::cert_manager::CertificateManager;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;

/// Bridges rustls's synchronous `ResolvesServerCert` callback to the
/// certificate manager's cache. A miss here means the certificate was never
/// acquired, is mid-acquisition, or failed — the handshake simply fails, the
/// ordinary behavior while a certificate is pending.
pub struct TlsCertResolver {
    manager: Arc<CertificateManager>,
}

impl TlsCertResolver {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self { manager }
    }
}

impl ResolvesServerCert for TlsCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let hostname = client_hello.server_name()?;
        match self.manager.get_certificate(hostname) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::debug!(%hostname, error = %e, "TLS handshake has no usable certificate yet");
                None
            }
        }
    }
}
