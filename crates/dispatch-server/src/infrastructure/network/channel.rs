//! TLS acceptance for agent connections.
//!
//! When TLS is enabled in config, the listener wraps every accepted TCP
//! stream in a server-side TLS session before any frame is read.  The
//! framing and message layers above are written against a generic async
//! stream, so [`SecureStream`] erases the plain/TLS difference for them.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::infrastructure::storage::config::TlsConfig;

/// Errors while setting up TLS or completing a handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to read TLS material from {path}: {source}")]
    ReadPem {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no private key found in {0}")]
    NoPrivateKey(std::path::PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("TLS handshake failed: {0}")]
    Accept(#[source] io::Error),
}

/// Builds the TLS acceptor from the configured certificate and key, or
/// `None` when TLS is disabled.
///
/// # Errors
///
/// Returns [`HandshakeError`] when the PEM files cannot be read or do not
/// contain usable certificate/key material.
pub fn build_acceptor(config: &TlsConfig) -> Result<Option<TlsAcceptor>, HandshakeError> {
    if !config.enabled {
        return Ok(None);
    }

    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let tls_config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, HandshakeError> {
    let pem = std::fs::read(path).map_err(|source| HandshakeError::ReadPem {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| HandshakeError::ReadPem {
            path: path.to_path_buf(),
            source,
        })
}

fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, HandshakeError> {
    let pem = std::fs::read(path).map_err(|source| HandshakeError::ReadPem {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|source| HandshakeError::ReadPem {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| HandshakeError::NoPrivateKey(path.to_path_buf()))
}

/// Completes the server-side handshake when an acceptor is configured,
/// otherwise passes the TCP stream through untouched.
///
/// # Errors
///
/// Returns [`HandshakeError::Accept`] if the TLS handshake fails.
pub async fn secure_accept(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
) -> Result<SecureStream, HandshakeError> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .map_err(HandshakeError::Accept)?;
            Ok(SecureStream::Tls(Box::new(tls)))
        }
        None => Ok(SecureStream::Plain(stream)),
    }
}

/// An accepted agent connection, plaintext or TLS.
pub enum SecureStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SecureStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SecureStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SecureStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SecureStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::config::TlsConfig;

    #[test]
    fn test_disabled_tls_builds_no_acceptor() {
        let config = TlsConfig::default();
        let acceptor = build_acceptor(&config).expect("disabled TLS must succeed");
        assert!(acceptor.is_none());
    }

    #[test]
    fn test_missing_cert_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TlsConfig {
            enabled: true,
            cert_path: dir.path().join("absent.crt"),
            key_path: dir.path().join("absent.key"),
        };
        assert!(matches!(
            build_acceptor(&config),
            Err(HandshakeError::ReadPem { .. })
        ));
    }

    #[test]
    fn test_pem_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        // Syntactically valid PEM file containing no private key block.
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        let config = TlsConfig {
            enabled: true,
            cert_path,
            key_path: key_path.clone(),
        };
        assert!(matches!(
            build_acceptor(&config),
            Err(HandshakeError::NoPrivateKey(path)) if path == key_path
        ));
    }
}
