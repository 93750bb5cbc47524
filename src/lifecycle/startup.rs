//! Startup orchestration and reload.
//!
//! # Responsibilities
//! - Load TLS material, then build routers, then bind entry points
//! - Spawn one accept loop per entry point
//! - Apply new configurations by rebuilding and swapping routers
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when routers are ready)
//! - Entry point addresses are fixed for the life of the process; a reload
//!   that adds or removes entry points only logs it

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::shutdown::Shutdown;
use crate::config::schema::ProxyConfig;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{EntryPoint, ListenerError};
use crate::net::starttls::UpgraderRegistry;
use crate::routing::{Router, RouterManager};
use crate::tls::{TlsError, TlsManager};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// The running proxy: TLS material, published routers and bound entry points.
pub struct EdgeRouter {
    config: ArcSwap<ProxyConfig>,
    tls: Arc<TlsManager>,
    upgraders: UpgraderRegistry,
    routers: HashMap<String, Arc<ArcSwap<Router>>>,
    local_addrs: HashMap<String, SocketAddr>,
    entry_points: Vec<EntryPoint>,
    tracker: ConnectionTracker,
}

impl EdgeRouter {
    /// Build everything and bind every entry point. Nothing accepts until
    /// [`Self::serve`].
    pub async fn start(config: ProxyConfig, upgraders: UpgraderRegistry) -> Result<Self, StartupError> {
        let tls = Arc::new(TlsManager::new()?);
        tls.update(&config.tls)?;

        let config = Arc::new(config);
        let built = build_routers(&config, &tls, &upgraders);
        let tracker = ConnectionTracker::new();

        let mut routers = HashMap::new();
        let mut local_addrs = HashMap::new();
        let mut entry_points = Vec::new();
        for (name, router) in built {
            let Some(ep_config) = config.entry_points.get(&name) else {
                continue;
            };
            let shared = Arc::new(ArcSwap::new(router));
            let entry_point = EntryPoint::bind(&name, ep_config, Arc::clone(&shared), tracker.clone()).await?;
            if let Ok(addr) = entry_point.local_addr() {
                local_addrs.insert(name.clone(), addr);
            }
            routers.insert(name, shared);
            entry_points.push(entry_point);
        }

        tracing::info!(entry_points = entry_points.len(), "Edge router started");

        Ok(Self {
            config: ArcSwap::new(config),
            tls,
            upgraders,
            routers,
            local_addrs,
            entry_points,
            tracker,
        })
    }

    /// Spawn the accept loops. Calling it again spawns nothing.
    pub fn serve(&mut self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.entry_points)
            .into_iter()
            .map(|entry_point| tokio::spawn(entry_point.run(shutdown.subscribe())))
            .collect()
    }

    /// Apply `config`. Returns `Ok(false)` when it equals the running one.
    ///
    /// On a TLS error nothing is swapped and the running routers stay.
    pub fn reload(&self, config: ProxyConfig) -> Result<bool, TlsError> {
        if *self.config.load_full() == config {
            tracing::debug!("Configuration unchanged, skipping reload");
            return Ok(false);
        }

        let config = Arc::new(config);
        for name in config.entry_points.keys() {
            if !self.routers.contains_key(name) {
                tracing::warn!(entry_point = %name, "New entry point ignored until restart");
            }
        }

        self.tls.update(&config.tls)?;
        let built = build_routers(&config, &self.tls, &self.upgraders);
        for (name, shared) in &self.routers {
            match built.get(name) {
                Some(router) => shared.store(Arc::clone(router)),
                None => {
                    tracing::warn!(entry_point = %name, "Entry point removed from configuration, routing nothing");
                    shared.store(Arc::new(Router::new(Default::default())));
                }
            }
        }

        self.config.store(config);
        tracing::info!("Configuration reloaded");
        Ok(true)
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config.load_full()
    }

    pub fn local_addr(&self, entry_point: &str) -> Option<SocketAddr> {
        self.local_addrs.get(entry_point).copied()
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }
}

impl std::fmt::Debug for EdgeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeRouter")
            .field("local_addrs", &self.local_addrs)
            .field("tls", &self.tls)
            .field("active_connections", &self.tracker.active_count())
            .finish()
    }
}

fn build_routers(
    config: &Arc<ProxyConfig>,
    tls: &Arc<TlsManager>,
    upgraders: &UpgraderRegistry,
) -> HashMap<String, Arc<Router>> {
    let manager = RouterManager::new(Arc::clone(config), Arc::clone(tls), upgraders.clone());
    let names: Vec<String> = config.entry_points.keys().cloned().collect();
    let routers = manager.build_handlers(&names);

    for (router, issues) in manager.issues() {
        tracing::warn!(router = %router, issues = ?issues, "Router built with issues");
    }
    routers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn config(backend: SocketAddr) -> ProxyConfig {
        parse_config(&format!(
            r#"
            [entry_points.tcp]
            address = "127.0.0.1:0"

            [[tcp.routers]]
            name = "echo"
            rule = "HostSNI(`*`)"
            service = "echo"

            [[tcp.services]]
            name = "echo"
            address = "{backend}"
            "#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn starts_serves_and_drains() {
        let backend = echo_backend().await;
        let mut edge = EdgeRouter::start(config(backend), UpgraderRegistry::with_defaults())
            .await
            .unwrap();
        let shutdown = Shutdown::new();
        let handles = edge.serve(&shutdown);
        assert_eq!(handles.len(), 1);
        assert!(edge.serve(&shutdown).is_empty());

        let addr = edge.local_addr("tcp").unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(client);

        assert!(shutdown.drain(edge.tracker(), std::time::Duration::from_secs(2)).await);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn unchanged_config_is_not_reloaded() {
        let backend = echo_backend().await;
        let edge = EdgeRouter::start(config(backend), UpgraderRegistry::with_defaults())
            .await
            .unwrap();

        assert!(!edge.reload(config(backend)).unwrap());

        let mut changed = config(backend);
        changed.timeouts.connect_secs = 1;
        assert!(edge.reload(changed).unwrap());
        assert_eq!(edge.config().timeouts.connect_secs, 1);
    }
}
