//! Per-connection dispatch.
//!
//! # Responsibilities
//! - Run the entry point's STARTTLS preamble, if any, bounded by the hello timeout
//! - Sniff the ClientHello and build connection metadata
//! - Pick exactly one path: plain TCP, HTTP forward, TLS route (passthrough
//!   or terminate), HTTPS host, TLS catch-all, default HTTPS, or close
//! - Replay the sniffed bytes to whichever handler wins
//!
//! ```text
//! accept → [STARTTLS] → SNIFFING ─┬─ NON_TLS ──────→ tcp route | http forwarder | close
//!                                 └─ TLS_DETECTED ─→ tls route (not catch-all)
//!                                                    | https host
//!                                                    | tls catch-all
//!                                                    | default https
//!                                                    | close
//! ```
//!
//! # Design Decisions
//! - A router is built once per configuration and never mutated after it is
//!   published; reloads build a new one
//! - Routers without any TLS path skip sniffing when a plain route matches,
//!   so server-first protocols do not wait for the hello timeout

use std::sync::Arc;

use rustls::ServerConfig;

use super::handler::{BrokenTls, Handler, TlsTerminator};
use super::muxer::Muxer;
use crate::net::connection::Connection;
use crate::net::peeked::PeekedStream;
use crate::net::sniff::{ClientHello, Sniffer};
use crate::net::starttls::StartTlsUpgrader;
use crate::rules::metadata::canonical_server_name;
use crate::rules::{ConnData, RuleError, RuleSyntax};

/// Which branch of the state machine served a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPath {
    Plain,
    HttpForward,
    TlsRoute,
    HttpsHost,
    TlsCatchAll,
    HttpsDefault,
    Closed,
}

#[derive(Clone)]
enum HttpsTarget {
    Terminate(Arc<ServerConfig>),
    Broken(Arc<str>),
}

pub struct Router {
    muxer_tcp: Muxer<Handler>,
    muxer_tcp_tls: Muxer<Handler>,
    muxer_https: Muxer<HttpsTarget>,
    http_forwarder: Option<Handler>,
    https_forwarder: Option<Handler>,
    https_default: Option<Arc<ServerConfig>>,
    sniffer: Sniffer,
    starttls: Option<Arc<dyn StartTlsUpgrader>>,
}

impl Router {
    pub fn new(sniffer: Sniffer) -> Self {
        Self {
            muxer_tcp: Muxer::new(),
            muxer_tcp_tls: Muxer::new(),
            muxer_https: Muxer::new(),
            http_forwarder: None,
            https_forwarder: None,
            https_default: None,
            sniffer,
            starttls: None,
        }
    }

    /// Route for connections that are not TLS.
    pub fn add_route(
        &self,
        rule: &str,
        syntax: RuleSyntax,
        priority: i64,
        handler: Handler,
    ) -> Result<(), RuleError> {
        self.muxer_tcp.add_route(rule, syntax, priority, handler)
    }

    /// TLS route whose connections are terminated with `config` before `handler` sees them.
    pub fn add_tls_route(
        &self,
        rule: &str,
        syntax: RuleSyntax,
        priority: i64,
        config: Arc<ServerConfig>,
        handler: Handler,
    ) -> Result<(), RuleError> {
        let terminator: Handler = Arc::new(TlsTerminator::new(config, handler));
        self.muxer_tcp_tls.add_route(rule, syntax, priority, terminator)
    }

    /// TLS route that forwards the encrypted stream untouched.
    pub fn add_passthrough_route(
        &self,
        rule: &str,
        syntax: RuleSyntax,
        priority: i64,
        handler: Handler,
    ) -> Result<(), RuleError> {
        self.muxer_tcp_tls.add_route(rule, syntax, priority, handler)
    }

    /// TLS route whose options could not be built.
    pub fn add_broken_tls_route(
        &self,
        rule: &str,
        syntax: RuleSyntax,
        priority: i64,
        reason: &str,
    ) -> Result<(), RuleError> {
        let broken: Handler = Arc::new(BrokenTls::new(reason));
        self.muxer_tcp_tls.add_route(rule, syntax, priority, broken)
    }

    /// Terminate TLS for `host` with `config` and hand requests to the HTTPS forwarder.
    pub fn add_https_host(&self, host: &str, config: Arc<ServerConfig>) -> Result<(), RuleError> {
        self.muxer_https.add_route(
            &host_rule(host),
            RuleSyntax::Extended,
            0,
            HttpsTarget::Terminate(config),
        )
    }

    /// `host` resolved to TLS options that could not be built.
    pub fn add_broken_https_host(&self, host: &str, reason: &str) -> Result<(), RuleError> {
        self.muxer_https.add_route(
            &host_rule(host),
            RuleSyntax::Extended,
            0,
            HttpsTarget::Broken(Arc::from(reason)),
        )
    }

    /// Configuration used for TLS connections no host or route claims.
    pub fn set_default_tls_config(&mut self, config: Arc<ServerConfig>) {
        self.https_default = Some(config);
    }

    pub fn set_http_forwarder(&mut self, handler: Handler) {
        self.http_forwarder = Some(handler);
    }

    pub fn set_https_forwarder(&mut self, handler: Handler) {
        self.https_forwarder = Some(handler);
    }

    pub fn set_starttls(&mut self, upgrader: Arc<dyn StartTlsUpgrader>) {
        self.starttls = Some(upgrader);
    }

    /// Whether any path could want the ClientHello.
    pub fn has_tls_paths(&self) -> bool {
        self.muxer_tcp_tls.has_routes()
            || self.muxer_https.has_routes()
            || self.https_forwarder.is_some()
    }

    /// Drive one connection to its handler, or drop it.
    pub async fn serve(&self, mut conn: Connection) {
        if let Some(upgrader) = &self.starttls {
            let deadline = self.sniffer.timeout();
            match tokio::time::timeout(deadline, upgrader.upgrade(conn.stream)).await {
                Ok(Ok(stream)) => conn.stream = stream,
                Ok(Err(e)) => {
                    tracing::debug!(starttls = upgrader.name(), error = %e, "STARTTLS preamble failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(
                        starttls = upgrader.name(),
                        timeout_ms = deadline.as_millis() as u64,
                        "STARTTLS preamble timed out"
                    );
                    return;
                }
            }
        }

        if !self.has_tls_paths() {
            if let (Some(handler), _) = self.muxer_tcp.find(&ConnData::plain(conn.peer_addr)) {
                tracing::debug!("Dispatching without sniffing");
                handler.serve(conn).await;
                return;
            }
        }

        let mut hello = self.sniffer.sniff(&mut conn.stream).await;
        let peeked = std::mem::take(&mut hello.peeked);
        let (path, handler) = self.decide(&hello, &conn);

        let Some(handler) = handler else {
            tracing::debug!(
                is_tls = hello.is_tls,
                server_name = %hello.server_name,
                "No route matched, closing connection"
            );
            return;
        };

        tracing::debug!(path = ?path, server_name = %hello.server_name, "Connection routed");
        let stream = Box::new(PeekedStream::new(peeked, conn.stream));
        let conn = Connection {
            stream,
            peer_addr: conn.peer_addr,
            tls: conn.tls,
        };
        handler.serve(conn).await;
    }

    /// Pick the path and handler for a sniffed connection.
    pub fn decide(&self, hello: &ClientHello, conn: &Connection) -> (DispatchPath, Option<Handler>) {
        if !hello.is_tls {
            let meta = ConnData::plain(conn.peer_addr);
            if let (Some(handler), _) = self.muxer_tcp.find(&meta) {
                return (DispatchPath::Plain, Some(handler));
            }
            if let Some(forwarder) = &self.http_forwarder {
                return (DispatchPath::HttpForward, Some(Arc::clone(forwarder)));
            }
            return (DispatchPath::Closed, None);
        }

        let meta = ConnData::new(
            canonical_server_name(&hello.server_name),
            conn.peer_addr,
            hello.alpn_protocols.clone(),
        );

        let (tls_route, catch_all) = self.muxer_tcp_tls.find(&meta);
        if let Some(handler) = &tls_route {
            if !catch_all {
                return (DispatchPath::TlsRoute, Some(Arc::clone(handler)));
            }
        }

        if let Some(forwarder) = &self.https_forwarder {
            if let (Some(target), _) = self.muxer_https.find(&meta) {
                let handler: Handler = match target {
                    HttpsTarget::Terminate(config) => {
                        Arc::new(TlsTerminator::new(config, Arc::clone(forwarder)))
                    }
                    HttpsTarget::Broken(reason) => Arc::new(BrokenTls::new(&*reason)),
                };
                return (DispatchPath::HttpsHost, Some(handler));
            }
        }

        if let Some(handler) = tls_route {
            return (DispatchPath::TlsCatchAll, Some(handler));
        }

        if let (Some(forwarder), Some(config)) = (&self.https_forwarder, &self.https_default) {
            let handler: Handler = Arc::new(TlsTerminator::new(Arc::clone(config), Arc::clone(forwarder)));
            return (DispatchPath::HttpsDefault, Some(handler));
        }

        (DispatchPath::Closed, None)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("tcp_routes", &self.muxer_tcp.len())
            .field("tls_routes", &self.muxer_tcp_tls.len())
            .field("https_hosts", &self.muxer_https.len())
            .field("http_forwarder", &self.http_forwarder.is_some())
            .field("https_forwarder", &self.https_forwarder.is_some())
            .field("starttls", &self.starttls.as_ref().map(|u| u.name()))
            .finish()
    }
}

/// SNI rule for an HTTPS domain; `*.x` becomes a one-label template.
fn host_rule(host: &str) -> String {
    match host.strip_prefix("*.") {
        Some(parent) => format!("HostSNIRegexp(`{{sub}}.{parent}`)"),
        None => format!("HostSNI(`{host}`)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::starttls::PostgresStartTls;
    use crate::routing::handler::TcpHandler;
    use crate::tls::TlsManager;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    /// Reports its label and everything it reads.
    struct Recorder {
        label: &'static str,
        tx: mpsc::UnboundedSender<(&'static str, Vec<u8>)>,
    }

    #[async_trait]
    impl TcpHandler for Recorder {
        async fn serve(&self, mut conn: Connection) {
            let mut buf = Vec::new();
            let _ = conn.stream.read_to_end(&mut buf).await;
            let _ = self.tx.send((self.label, buf));
        }
    }

    struct Labelled(&'static str);

    #[async_trait]
    impl TcpHandler for Labelled {
        async fn serve(&self, _conn: Connection) {}
    }

    fn label(name: &'static str) -> Handler {
        Arc::new(Labelled(name))
    }

    fn conn() -> Connection {
        let (_client, server) = duplex(8);
        Connection::new(Box::new(server), "10.0.0.1:5000".parse().unwrap())
    }

    fn tls_hello(name: &str) -> ClientHello {
        ClientHello {
            server_name: name.to_string(),
            is_tls: true,
            ..ClientHello::default()
        }
    }

    fn server_config() -> Arc<ServerConfig> {
        TlsManager::new().unwrap().get("default", "default").unwrap()
    }

    #[test]
    fn host_rules() {
        assert_eq!(host_rule("a.com"), "HostSNI(`a.com`)");
        assert_eq!(host_rule("*.a.com"), "HostSNIRegexp(`{sub}.a.com`)");
    }

    #[test]
    fn plain_connections() {
        let mut router = Router::new(Sniffer::default());
        let plain = ClientHello::default();
        assert_eq!(router.decide(&plain, &conn()).0, DispatchPath::Closed);

        router.set_http_forwarder(label("http"));
        assert_eq!(router.decide(&plain, &conn()).0, DispatchPath::HttpForward);

        router
            .add_route("ClientIP(`10.0.0.0/8`)", RuleSyntax::Extended, 0, label("tcp"))
            .unwrap();
        assert_eq!(router.decide(&plain, &conn()).0, DispatchPath::Plain);
    }

    #[test]
    fn tls_precedence() {
        let mut router = Router::new(Sniffer::default());
        router.set_https_forwarder(label("https"));
        router
            .add_passthrough_route("HostSNI(`*`)", RuleSyntax::Extended, 0, label("catch-all"))
            .unwrap();
        router
            .add_passthrough_route("HostSNI(`db.test`)", RuleSyntax::Extended, 0, label("db"))
            .unwrap();
        router.add_https_host("web.test", server_config()).unwrap();
        router.add_https_host("db.test", server_config()).unwrap();

        // non-catch-all TLS route beats an HTTPS host with the same name
        assert_eq!(router.decide(&tls_hello("db.test"), &conn()).0, DispatchPath::TlsRoute);
        // SNI is canonicalised before matching
        assert_eq!(router.decide(&tls_hello("WEB.test."), &conn()).0, DispatchPath::HttpsHost);
        assert_eq!(router.decide(&tls_hello("other.test"), &conn()).0, DispatchPath::TlsCatchAll);
        assert_eq!(router.decide(&tls_hello(""), &conn()).0, DispatchPath::TlsCatchAll);
    }

    #[test]
    fn tls_fallbacks() {
        let mut router = Router::new(Sniffer::default());
        assert!(!router.has_tls_paths());
        assert_eq!(router.decide(&tls_hello("x.test"), &conn()).0, DispatchPath::Closed);

        router.set_https_forwarder(label("https"));
        assert!(router.has_tls_paths());
        assert_eq!(router.decide(&tls_hello("x.test"), &conn()).0, DispatchPath::Closed);

        router.set_default_tls_config(server_config());
        assert_eq!(router.decide(&tls_hello("x.test"), &conn()).0, DispatchPath::HttpsDefault);
    }

    #[test]
    fn https_hosts_need_a_forwarder() {
        let router = Router::new(Sniffer::default());
        router.add_https_host("web.test", server_config()).unwrap();
        router.add_broken_https_host("bad.test", "unknown options").unwrap();
        assert_eq!(router.decide(&tls_hello("web.test"), &conn()).0, DispatchPath::Closed);
    }

    #[tokio::test]
    async fn plain_route_skips_sniffing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = Router::new(Sniffer::new(Duration::from_secs(30)));
        router
            .add_route(
                "HostSNI(`*`)",
                RuleSyntax::Extended,
                0,
                Arc::new(Recorder { label: "smtp", tx }),
            )
            .unwrap();

        // server-first protocol: the client sends nothing before closing
        let (client, server) = duplex(64);
        drop(client);
        let serve = router.serve(Connection::new(Box::new(server), "10.0.0.1:25".parse().unwrap()));
        tokio::time::timeout(Duration::from_secs(1), serve).await.unwrap();

        let (got, bytes) = rx.recv().await.unwrap();
        assert_eq!(got, "smtp");
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn silent_starttls_client_is_dropped_after_hello_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = Router::new(Sniffer::new(Duration::from_millis(50)));
        router.set_starttls(Arc::new(PostgresStartTls));
        router
            .add_route(
                "HostSNI(`*`)",
                RuleSyntax::Extended,
                0,
                Arc::new(Recorder { label: "pg", tx }),
            )
            .unwrap();

        // connected but never sends the SSLRequest
        let (_client, server) = duplex(64);
        let serve = router.serve(Connection::new(Box::new(server), "10.0.0.1:5432".parse().unwrap()));
        tokio::time::timeout(Duration::from_secs(1), serve).await.unwrap();

        drop(router);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn http_forwarder_sees_replayed_bytes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = Router::new(Sniffer::new(Duration::from_millis(200)));
        router.set_http_forwarder(Arc::new(Recorder { label: "http", tx }));

        let (mut client, server) = duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        drop(client);
        router
            .serve(Connection::new(Box::new(server), "10.0.0.1:80".parse().unwrap()))
            .await;

        let (got, bytes) = rx.recv().await.unwrap();
        assert_eq!(got, "http");
        assert_eq!(bytes, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    }
}
