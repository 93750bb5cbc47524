//! Entry point listener with backpressure.
//!
//! # Responsibilities
//! - Bind the entry point address
//! - Enforce `max_connections` via semaphore before accepting
//! - Hand each connection to the currently published router
//! - Stop accepting on shutdown; in-flight connections are tracked for drain

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::Instrument;

use super::connection::{Connection, ConnectionTracker};
use crate::config::schema::EntryPointConfig;
use crate::routing::Router;

/// Pause after a failed accept (e.g. EMFILE) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind entry point {name:?} to {address}: {source}")]
    Bind {
        name: String,
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// A bound entry point.
///
/// The router is read through an [`ArcSwap`] on every accept, so a reload
/// takes effect for the next connection while earlier ones keep theirs.
pub struct EntryPoint {
    name: String,
    inner: TcpListener,
    router: Arc<ArcSwap<Router>>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    tracker: ConnectionTracker,
}

impl EntryPoint {
    pub async fn bind(
        name: &str,
        config: &EntryPointConfig,
        router: Arc<ArcSwap<Router>>,
        tracker: ConnectionTracker,
    ) -> Result<Self, ListenerError> {
        let inner = TcpListener::bind(&config.address)
            .await
            .map_err(|source| ListenerError::Bind {
                name: name.to_string(),
                address: config.address.clone(),
                source,
            })?;

        if let Ok(local_addr) = inner.local_addr() {
            tracing::info!(
                entry_point = name,
                address = %local_addr,
                max_connections = config.max_connections,
                starttls = ?config.starttls,
                "Entry point bound"
            );
        }

        Ok(Self {
            name: name.to_string(),
            inner,
            router,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            tracker,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Handle used to publish a new router.
    pub fn router(&self) -> Arc<ArcSwap<Router>> {
        Arc::clone(&self.router)
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Accept until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            // Acquire permit first (backpressure)
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.inner.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(entry_point = %self.name, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);

            let router = self.router.load_full();
            let guard = self.tracker.track();
            let span = tracing::info_span!(
                "connection",
                id = %guard.id(),
                peer = %peer_addr,
                entry_point = %self.name,
            );
            tracing::trace!(
                parent: &span,
                available_permits = self.connection_limit.available_permits(),
                "Connection accepted"
            );

            tokio::spawn(
                async move {
                    let _permit = permit;
                    let _guard = guard;
                    router.serve(Connection::new(Box::new(stream), peer_addr)).await;
                }
                .instrument(span),
            );
        }

        tracing::info!(entry_point = %self.name, "Entry point stopped accepting");
    }
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("name", &self.name)
            .field("local_addr", &self.inner.local_addr().ok())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::sniff::Sniffer;
    use crate::routing::TcpHandler;
    use crate::rules::RuleSyntax;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Greeter(&'static [u8]);

    #[async_trait]
    impl TcpHandler for Greeter {
        async fn serve(&self, mut conn: Connection) {
            let _ = conn.stream.write_all(self.0).await;
            let _ = conn.stream.shutdown().await;
        }
    }

    fn router(greeting: &'static [u8]) -> Router {
        let router = Router::new(Sniffer::default());
        router
            .add_route("HostSNI(`*`)", RuleSyntax::Extended, 0, Arc::new(Greeter(greeting)))
            .unwrap();
        router
    }

    async fn read_all(addr: SocketAddr) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn serves_and_swaps_routers() {
        let config = EntryPointConfig {
            address: "127.0.0.1:0".into(),
            ..EntryPointConfig::default()
        };
        let shared = Arc::new(ArcSwap::from_pointee(router(b"first")));
        let tracker = ConnectionTracker::new();
        let entry_point = EntryPoint::bind("test", &config, Arc::clone(&shared), tracker.clone())
            .await
            .unwrap();
        let addr = entry_point.local_addr().unwrap();

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(entry_point.run(rx));

        assert_eq!(read_all(addr).await, b"first");
        shared.store(Arc::new(router(b"second")));
        assert_eq!(read_all(addr).await, b"second");

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(tracker.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn bind_errors_name_the_entry_point() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = EntryPointConfig {
            address: taken.local_addr().unwrap().to_string(),
            ..EntryPointConfig::default()
        };
        let shared = Arc::new(ArcSwap::from_pointee(Router::new(Sniffer::default())));
        let err = EntryPoint::bind("web", &config, shared, ConnectionTracker::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("\"web\""));
    }
}
