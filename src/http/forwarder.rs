//! Serves routed connections as HTTP.
//!
//! # Responsibilities
//! - Run HTTP/1.1 and HTTP/2 (auto-detected) over a routed stream
//! - Attach the connection's peer address and TLS identity to every request
//! - Build the request pipeline (trace, request id, timeout, fronting guard)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{middleware, routing::any, Extension, Router};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
    service::TowerToHyperService,
};
use tower::Layer;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::domain_fronting::{domain_fronting_guard, TlsOptionsForHost};
use super::proxy::{proxy_handler, HostRoutes, ProxyState};
use crate::net::connection::{Connection, TlsInfo};
use crate::routing::handler::TcpHandler;

/// Per-connection facts handlers read from request extensions.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer_addr: SocketAddr,
    /// Set when TLS was terminated in front of this forwarder.
    pub tls: Option<TlsInfo>,
}

/// Build the request pipeline for one forwarder.
///
/// `fronting` enables the SNI/Host consistency check; only HTTPS forwarders
/// pass it.
#[allow(deprecated)]
pub fn build_app(
    routes: Arc<HostRoutes>,
    request_timeout: Duration,
    fronting: Option<Arc<TlsOptionsForHost>>,
) -> Router {
    let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    let state = ProxyState { routes, client };

    let mut app = Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .with_state(state);

    if let Some(options) = fronting {
        app = app.layer(middleware::from_fn_with_state(options, domain_fronting_guard));
    }

    app.layer(TimeoutLayer::new(request_timeout))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// [`TcpHandler`] that speaks HTTP on the connection it is given.
#[derive(Clone)]
pub struct HttpForwarder {
    name: &'static str,
    app: Router,
}

impl HttpForwarder {
    pub fn new(name: &'static str, app: Router) -> Self {
        Self { name, app }
    }
}

impl std::fmt::Debug for HttpForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpForwarder").field("name", &self.name).finish()
    }
}

#[async_trait]
impl TcpHandler for HttpForwarder {
    async fn serve(&self, conn: Connection) {
        let info = ConnectionInfo {
            peer_addr: conn.peer_addr,
            tls: conn.tls.clone(),
        };
        let service = TowerToHyperService::new(Extension(info).layer(self.app.clone()));

        let builder = Builder::new(TokioExecutor::new());
        if let Err(e) = builder
            .serve_connection_with_upgrades(TokioIo::new(conn.stream), service)
            .await
        {
            tracing::debug!(forwarder = self.name, error = %e, "HTTP connection ended with error");
        }
    }
}
