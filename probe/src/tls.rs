//! Certificate expiry peek.
//!
//! A lightweight handshake against the probed host that reads the leaf
//! certificate's notAfter. Strictly best-effort: every failure is
//! reported upward as an error the caller logs and ignores.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use x509_parser::prelude::FromDer;

#[derive(Debug, Error)]
pub enum TlsProbeError {
    #[error("target is not a parsable https url: {0}")]
    BadTarget(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("no peer certificate presented")]
    NoCertificate,
    #[error("certificate parse failed: {0}")]
    Parse(String),
    #[error("deadline exceeded")]
    Timeout,
}

fn host_and_port(target: &str) -> Result<(String, u16), TlsProbeError> {
    let rest = target
        .strip_prefix("https://")
        .ok_or_else(|| TlsProbeError::BadTarget(target.to_string()))?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            let port = port
                .parse()
                .map_err(|_| TlsProbeError::BadTarget(target.to_string()))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((authority.to_string(), 443)),
    }
}

/// Days until the leaf certificate expires; negative when already expired.
pub(crate) async fn expiry_days(target: &str, deadline: Duration) -> Result<i64, TlsProbeError> {
    let (host, port) = host_and_port(target)?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.clone())
        .map_err(|_| TlsProbeError::BadTarget(target.to_string()))?;

    let handshake = async {
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| TlsProbeError::Handshake(e.to_string()))?;
        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsProbeError::Handshake(e.to_string()))
    };
    let tls_stream = tokio::time::timeout(deadline, handshake)
        .await
        .map_err(|_| TlsProbeError::Timeout)??;

    let (_, connection) = tls_stream.get_ref();
    let leaf = connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or(TlsProbeError::NoCertificate)?;

    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| TlsProbeError::Parse(e.to_string()))?;
    let not_after = cert.validity().not_after.timestamp();
    let now = chrono::Utc::now().timestamp();
    Ok((not_after - now) / 86_400)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        assert_eq!(
            host_and_port("https://example.com/path").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            host_and_port("https://example.com:8443/x?y").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert!(host_and_port("http://example.com").is_err());
    }
}
