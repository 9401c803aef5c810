//! Outbound connection to the dispatch server.
//!
//! The agent dials the configured server, optionally wraps the stream in
//! client-side TLS against a configured trust root, registers itself, and
//! then serves the command loop: wait for a command frame, execute it,
//! send exactly one result frame back.  Commands are served strictly in
//! arrival order; there is no local queue beyond the socket.
//!
//! Connection failures retry with exponential backoff (doubling from the
//! configured initial delay) up to the configured attempt budget.  A
//! server that closes the connection cleanly triggers a fresh connect
//! cycle with the backoff reset.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use dispatch_core::protocol::messages::{RegistrationMessage, WireMessage};
use dispatch_core::transport::{FramedStream, TransportError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig as RustlsClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::application::execute::run_shell_command;
use crate::infrastructure::config::{AgentConfig, ClientTlsConfig};

/// Errors that terminate the agent (as opposed to triggering a reconnect).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("could not reach server after {attempts} attempts: {last}")]
    ConnectExhausted { attempts: u32, last: io::Error },

    #[error("failed to read TLS trust root from {path}: {source}")]
    ReadTrustRoot {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("invalid TLS server name {0:?}")]
    ServerName(String),

    #[error("server rejected registration: {0}")]
    Rejected(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// How one connected session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed the connection; reconnect is appropriate.
    Disconnected,
}

/// The dialled connection, plaintext or TLS.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Builds the client-side TLS connector from the configured trust root, or
/// `None` when TLS is disabled.
///
/// # Errors
///
/// Returns [`AgentError`] when the CA file cannot be read or contains no
/// usable certificates.
pub fn build_connector(config: &ClientTlsConfig) -> Result<Option<TlsConnector>, AgentError> {
    if !config.enabled {
        return Ok(None);
    }

    let pem = std::fs::read(&config.ca_path).map_err(|source| AgentError::ReadTrustRoot {
        path: config.ca_path.clone(),
        source,
    })?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|source| AgentError::ReadTrustRoot {
            path: config.ca_path.clone(),
            source,
        })?;
        roots.add(cert)?;
    }

    let tls_config = RustlsClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Some(TlsConnector::from(Arc::new(tls_config))))
}

/// Dials the server, retrying with exponential backoff.
///
/// # Errors
///
/// Returns [`AgentError::ConnectExhausted`] once the attempt budget
/// (one initial attempt plus `max_retries` retries) is spent.
pub async fn connect_with_retry(config: &AgentConfig) -> Result<TcpStream, AgentError> {
    let addr = config.server_addr();
    let mut delay = Duration::from_secs(config.retry.initial_delay_secs);
    let attempts = config.retry.max_retries + 1;

    for attempt in 1..=attempts {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(%addr, "connected to server");
                return Ok(stream);
            }
            Err(e) if attempt < attempts => {
                warn!(%addr, attempt, error = %e, "connect failed, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                return Err(AgentError::ConnectExhausted { attempts, last: e });
            }
        }
    }
    unreachable!("loop returns on the final attempt")
}

/// Wraps the TCP stream in TLS when a connector is configured.
///
/// # Errors
///
/// Returns [`AgentError::ServerName`] for an unusable server name and
/// [`AgentError::Transport`] for handshake I/O failures.
pub async fn secure_connect(
    stream: TcpStream,
    connector: Option<&TlsConnector>,
    config: &AgentConfig,
) -> Result<ClientStream, AgentError> {
    match connector {
        Some(connector) => {
            let name = if config.tls.server_name.is_empty() {
                config.server.host.clone()
            } else {
                config.tls.server_name.clone()
            };
            let server_name = ServerName::try_from(name.clone())
                .map_err(|_| AgentError::ServerName(name))?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(TransportError::Io)?;
            Ok(ClientStream::Tls(Box::new(tls)))
        }
        None => Ok(ClientStream::Plain(stream)),
    }
}

/// Registers on an established connection, then serves commands until the
/// server goes away.
///
/// # Errors
///
/// Returns [`AgentError::Rejected`] when the server answers registration
/// with an error frame, and [`AgentError::Transport`] for I/O failures.
pub async fn run_session(
    config: &AgentConfig,
    stream: ClientStream,
) -> Result<SessionEnd, AgentError> {
    let mut framed = FramedStream::new(stream, config.limits.max_message_size);
    let label = config.client_label();

    framed
        .send(&WireMessage::Registration(RegistrationMessage {
            client_id: label.clone(),
            timestamp: Utc::now(),
            auth_token: config.identity.auth_token.clone(),
        }))
        .await?;
    info!(%label, "registered with server");

    let mut served_any = false;
    loop {
        match framed.recv().await? {
            Some(WireMessage::Command(command)) => {
                served_any = true;
                let result = run_shell_command(&command.command, config.command_timeout()).await;
                framed.send(&WireMessage::Result(result)).await?;
            }
            Some(WireMessage::Error(e)) if !served_any => {
                // An error straight after registration means we were
                // turned away (bad token, at capacity).
                return Err(AgentError::Rejected(e.message));
            }
            Some(WireMessage::Error(e)) => {
                warn!(message = %e.message, "server reported an error");
            }
            Some(other) => {
                warn!(kind = other.type_name(), "ignoring unexpected frame");
            }
            None => {
                info!("server closed the connection");
                return Ok(SessionEnd::Disconnected);
            }
        }
    }
}

/// Full agent lifecycle: connect, serve, reconnect on disconnect.
///
/// Returns only on an error that makes reconnecting pointless.
///
/// # Errors
///
/// See [`AgentError`].
pub async fn run_agent(config: &AgentConfig) -> Result<(), AgentError> {
    let connector = build_connector(&config.tls)?;

    loop {
        let tcp = connect_with_retry(config).await?;
        let stream = secure_connect(tcp, connector.as_ref(), config).await?;

        match run_session(config, stream).await {
            Ok(SessionEnd::Disconnected) => {
                let delay = Duration::from_secs(config.retry.initial_delay_secs);
                info!("reconnecting in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(AgentError::Transport(e)) => {
                warn!(error = %e, "session failed, reconnecting");
                tokio::time::sleep(Duration::from_secs(config.retry.initial_delay_secs)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::protocol::messages::{CommandMessage, ErrorMessage};
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.server.port = port;
        config.identity.label = "test-agent".to_string();
        config.retry.max_retries = 0;
        config.retry.initial_delay_secs = 0;
        config
    }

    #[tokio::test]
    async fn test_connect_exhausts_against_closed_port() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = test_config(port);
        match connect_with_retry(&config).await {
            Err(AgentError::ConnectExhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected ConnectExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_registers_executes_and_reports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = test_config(port);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = FramedStream::new(stream, 1024 * 1024);

            let registration = match framed.recv().await.unwrap() {
                Some(WireMessage::Registration(r)) => r,
                other => panic!("expected registration, got {other:?}"),
            };
            assert!(registration.client_id.starts_with("test-agent-"));

            framed
                .send(&WireMessage::Command(CommandMessage {
                    command: "echo from-test".to_string(),
                }))
                .await
                .unwrap();

            let result = match framed.recv().await.unwrap() {
                Some(WireMessage::Result(r)) => r,
                other => panic!("expected result, got {other:?}"),
            };
            assert_eq!(result.command, "echo from-test");
            assert_eq!(result.return_code, 0);
            assert_eq!(result.stdout.trim(), "from-test");

            framed.shutdown().await.unwrap();
        });

        let tcp = connect_with_retry(&config).await.unwrap();
        let stream = secure_connect(tcp, None, &config).await.unwrap();
        let end = run_session(&config, stream).await.unwrap();
        assert_eq!(end, SessionEnd::Disconnected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_before_first_command_is_a_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = test_config(port);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = FramedStream::new(stream, 1024 * 1024);
            let _ = framed.recv().await.unwrap();
            framed
                .send(&WireMessage::Error(ErrorMessage {
                    message: "authentication failed".to_string(),
                }))
                .await
                .unwrap();
            framed.shutdown().await.unwrap();
        });

        let tcp = connect_with_retry(&config).await.unwrap();
        let stream = secure_connect(tcp, None, &config).await.unwrap();
        match run_session(&config, stream).await {
            Err(AgentError::Rejected(message)) => {
                assert_eq!(message, "authentication failed");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_trust_root_fails_to_build_connector() {
        let dir = tempfile::tempdir().unwrap();
        let tls = ClientTlsConfig {
            enabled: true,
            ca_path: dir.path().join("absent.crt"),
            server_name: String::new(),
        };
        assert!(matches!(
            build_connector(&tls),
            Err(AgentError::ReadTrustRoot { .. })
        ));
    }

    #[test]
    fn test_disabled_tls_builds_no_connector() {
        let tls = ClientTlsConfig::default();
        assert!(build_connector(&tls).unwrap().is_none());
    }
}
