//! Connection handlers a route can point at.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::ServerConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::net::connection::{Connection, TlsInfo};
use crate::rules::metadata::canonical_server_name;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fatal `handshake_failure` alert record (TLS 1.2 framing).
const HANDSHAKE_FAILURE_ALERT: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28];

/// Something that takes ownership of a routed connection.
#[async_trait]
pub trait TcpHandler: Send + Sync {
    async fn serve(&self, conn: Connection);
}

pub type Handler = Arc<dyn TcpHandler>;

/// Dials a backend and copies bytes both ways until either side closes.
#[derive(Debug, Clone)]
pub struct TcpProxy {
    name: String,
    address: String,
    connect_timeout: Duration,
}

impl TcpProxy {
    pub fn new(name: impl Into<String>, address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl TcpHandler for TcpProxy {
    async fn serve(&self, mut conn: Connection) {
        let upstream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;
        let mut upstream = match upstream {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(service = %self.name, address = %self.address, error = %e, "Backend connection failed");
                return;
            }
            Err(_) => {
                tracing::warn!(
                    service = %self.name,
                    address = %self.address,
                    timeout_secs = self.connect_timeout.as_secs(),
                    "Backend connection timed out"
                );
                return;
            }
        };
        let _ = upstream.set_nodelay(true);

        match tokio::io::copy_bidirectional(&mut conn.stream, &mut upstream).await {
            Ok((to_backend, to_client)) => tracing::debug!(
                service = %self.name,
                to_backend,
                to_client,
                "Proxy stream closed"
            ),
            Err(e) => tracing::debug!(service = %self.name, error = %e, "Proxy stream ended with error"),
        }
    }
}

/// Terminates TLS, records the session identity, then hands the plaintext
/// stream to `next`.
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
    next: Handler,
    handshake_timeout: Duration,
}

impl TlsTerminator {
    pub fn new(config: Arc<ServerConfig>, next: Handler) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            next,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[async_trait]
impl TcpHandler for TlsTerminator {
    async fn serve(&self, conn: Connection) {
        let Connection {
            stream, peer_addr, ..
        } = conn;

        let tls = match tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::debug!("TLS handshake timed out");
                return;
            }
        };

        let (_, session) = tls.get_ref();
        let info = TlsInfo {
            server_name: session.server_name().map(canonical_server_name),
            alpn: session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        };
        tracing::trace!(server_name = ?info.server_name, alpn = ?info.alpn, "TLS terminated");

        let conn = Connection {
            stream: Box::new(tls),
            peer_addr,
            tls: Some(info),
        };
        self.next.serve(conn).await;
    }
}

/// Installed where TLS options could not be built: every handshake fails.
#[derive(Debug, Clone)]
pub struct BrokenTls {
    reason: String,
}

impl BrokenTls {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl TcpHandler for BrokenTls {
    async fn serve(&self, mut conn: Connection) {
        tracing::debug!(reason = %self.reason, "Refusing TLS handshake");
        let _ = conn.stream.write_all(&HANDSHAKE_FAILURE_ALERT).await;
        let _ = conn.stream.shutdown().await;
    }
}
