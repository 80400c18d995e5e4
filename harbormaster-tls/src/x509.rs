//! Leaf-certificate expiry parsing.
//!
//! The ACME client trusts the CA's own NotAfter rather than assuming a fixed
//! validity window, since Let's Encrypt has shipped certificates shorter than
//! 90 days before and a hardcoded assumption would silently under- or
//! over-estimate renewal timing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum X509Error {
    #[error("no PEM block found in certificate chain")]
    NoPemBlock,

    #[error("failed to decode PEM: {0}")]
    PemDecode(String),

    #[error("failed to parse certificate: {0}")]
    Parse(String),
}

/// Parses the first certificate in a PEM chain and returns its NotAfter as a
/// Unix timestamp.
pub fn parse_not_after(cert_chain_pem: &str) -> Result<i64, X509Error> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_chain_pem.as_bytes())
        .map_err(|e| X509Error::PemDecode(e.to_string()))?;

    let cert = pem.parse_x509().map_err(|e| X509Error::Parse(e.to_string()))?;

    Ok(cert.validity().not_after.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_input() {
        let err = parse_not_after("not a certificate").unwrap_err();
        assert!(matches!(err, X509Error::PemDecode(_)));
    }
}
