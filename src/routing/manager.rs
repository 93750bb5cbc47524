//! Builds one [`Router`] per entry point from the configuration.
//!
//! # Responsibilities
//! - Attach TCP routers to the TCP, TLS-terminate or passthrough muxers
//! - Split HTTP routers into the HTTP and HTTPS forwarders
//! - Derive the host → TLS options map and the HTTPS host routes from it
//! - Record per-router issues instead of failing the whole build

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use super::handler::{Handler, TcpProxy};
use super::router::Router;
use crate::config::schema::{EntryPointConfig, HttpRouterConfig, ProxyConfig, DEFAULT_TLS_NAME};
use crate::http::{build_app, HostRoutes, HttpForwarder, TlsOptionsForHost};
use crate::net::sniff::Sniffer;
use crate::net::starttls::UpgraderRegistry;
use crate::rules::parse;
use crate::tls::TlsManager;

pub struct RouterManager {
    config: Arc<ProxyConfig>,
    tls: Arc<TlsManager>,
    upgraders: UpgraderRegistry,
    issues: DashMap<String, Vec<String>>,
}

impl RouterManager {
    pub fn new(config: Arc<ProxyConfig>, tls: Arc<TlsManager>, upgraders: UpgraderRegistry) -> Self {
        Self {
            config,
            tls,
            upgraders,
            issues: DashMap::new(),
        }
    }

    /// Problems found during the last build, keyed by router name.
    pub fn issues(&self) -> BTreeMap<String, Vec<String>> {
        self.issues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn record(&self, router: &str, issue: impl Into<String>) {
        let issue = issue.into();
        tracing::warn!(router, issue = %issue, "Router configuration issue");
        self.issues.entry(router.to_string()).or_default().push(issue);
    }

    /// Build the routers of the named entry points.
    ///
    /// Unknown entry point names are skipped.
    pub fn build_handlers(&self, entry_points: &[String]) -> HashMap<String, Arc<Router>> {
        self.issues.clear();

        let mut routers = HashMap::new();
        for name in entry_points {
            let Some(entry_point) = self.config.entry_points.get(name) else {
                tracing::warn!(entry_point = %name, "Unknown entry point");
                continue;
            };
            let router = self.build_router(name, entry_point);
            tracing::debug!(entry_point = %name, router = ?router, "Router built");
            routers.insert(name.clone(), Arc::new(router));
        }
        routers
    }

    fn build_router(&self, name: &str, entry_point: &EntryPointConfig) -> Router {
        let timeouts = &self.config.timeouts;
        let mut router = Router::new(Sniffer::new(Duration::from_millis(timeouts.hello_timeout_ms)));

        if let Some(starttls) = &entry_point.starttls {
            match self.upgraders.get(starttls) {
                Some(upgrader) => router.set_starttls(upgrader),
                None => tracing::warn!(entry_point = name, starttls = %starttls, "Unknown STARTTLS adapter"),
            }
        }

        let local_host = local_host(&entry_point.address);
        self.add_http_routers(&mut router, name, local_host.as_deref());
        self.add_tcp_routers(&router, name, local_host.as_deref());
        router
    }

    fn add_http_routers(&self, router: &mut Router, entry_point: &str, local_host: Option<&str>) {
        let http = &self.config.http;
        let services: HashMap<&str, &str> = http
            .services
            .iter()
            .map(|s| (s.name.as_str(), s.url.as_str()))
            .collect();

        let mut plain = HostRoutes::new();
        let mut secure = HostRoutes::new();
        let mut options_for_host = TlsOptionsForHost::new();
        let mut claimed_by: HashMap<String, Vec<&str>> = HashMap::new();
        let mut has_secure = false;

        for cfg in http.routers.iter().filter(|r| serves(&r.entry_points, entry_point)) {
            let Some(url) = services.get(cfg.service.as_str()) else {
                self.record(&cfg.name, format!("unknown service {:?}", cfg.service));
                continue;
            };
            let routes = if cfg.tls.is_some() { &mut secure } else { &mut plain };
            if let Err(e) = routes.add(&cfg.name, &cfg.rule, cfg.priority, &cfg.service, url) {
                self.record(&cfg.name, e.to_string());
                continue;
            }

            if let Some(tls) = &cfg.tls {
                has_secure = true;
                for host in self.claim_hosts(&mut options_for_host, cfg, tls.options_name()) {
                    claimed_by.entry(host).or_default().push(cfg.name.as_str());
                }
            }
        }

        let request_timeout = Duration::from_secs(self.config.timeouts.request_secs);
        if !plain.is_empty() {
            let app = build_app(Arc::new(plain), request_timeout, None);
            router.set_http_forwarder(Arc::new(HttpForwarder::new("http", app)));
        }
        if !has_secure {
            return;
        }

        let mut hosts: Vec<(&str, &str)> = options_for_host.iter().collect();
        hosts.sort_unstable();
        for (host, options) in hosts {
            let added = match self.tls.get_bound(DEFAULT_TLS_NAME, options, local_host) {
                Ok(config) => router.add_https_host(host, config),
                Err(e) => {
                    for name in claimed_by.get(host).into_iter().flatten() {
                        self.record(name, format!("host {host:?}: TLS options {options:?}: {e}"));
                    }
                    router.add_broken_https_host(host, &e.to_string())
                }
            };
            if let Err(e) = added {
                for name in claimed_by.get(host).into_iter().flatten() {
                    self.record(name, format!("invalid host {host:?}: {e}"));
                }
            }
        }

        match self.tls.get_bound(DEFAULT_TLS_NAME, DEFAULT_TLS_NAME, local_host) {
            Ok(config) => router.set_default_tls_config(config),
            Err(e) => self.record(entry_point, format!("default TLS options: {e}")),
        }

        let app = build_app(Arc::new(secure), request_timeout, Some(Arc::new(options_for_host)));
        router.set_https_forwarder(Arc::new(HttpForwarder::new("https", app)));
    }

    /// Claim the `Host(...)` values of `cfg` for `options`; returns the claimed hosts.
    fn claim_hosts(
        &self,
        options_for_host: &mut TlsOptionsForHost,
        cfg: &HttpRouterConfig,
        options: &str,
    ) -> Vec<String> {
        let hosts = match parse(&cfg.rule) {
            Ok(expr) => expr.values_of("Host"),
            Err(_) => return Vec::new(),
        };
        let mut claimed = Vec::with_capacity(hosts.len());
        for host in hosts {
            let host = host.trim().to_ascii_lowercase();
            if !options_for_host.claim(&host, options) {
                self.record(
                    &cfg.name,
                    format!("host {host:?} is claimed with different TLS options, using {DEFAULT_TLS_NAME:?}"),
                );
            }
            claimed.push(host);
        }
        claimed
    }

    fn add_tcp_routers(&self, router: &Router, entry_point: &str, local_host: Option<&str>) {
        let tcp = &self.config.tcp;
        let services: HashMap<&str, &str> = tcp
            .services
            .iter()
            .map(|s| (s.name.as_str(), s.address.as_str()))
            .collect();
        let connect_timeout = Duration::from_secs(self.config.timeouts.connect_secs);

        for cfg in tcp.routers.iter().filter(|r| serves(&r.entry_points, entry_point)) {
            let Some(address) = services.get(cfg.service.as_str()) else {
                self.record(&cfg.name, format!("unknown service {:?}", cfg.service));
                continue;
            };
            let handler: Handler = Arc::new(TcpProxy::new(cfg.service.as_str(), *address, connect_timeout));

            let added = match &cfg.tls {
                None => router.add_route(&cfg.rule, cfg.rule_syntax, cfg.priority, handler),
                Some(tls) if tls.passthrough => {
                    router.add_passthrough_route(&cfg.rule, cfg.rule_syntax, cfg.priority, handler)
                }
                Some(tls) => {
                    let options = tls.options_name();
                    match self.tls.get_bound(DEFAULT_TLS_NAME, options, local_host) {
                        Ok(config) => {
                            router.add_tls_route(&cfg.rule, cfg.rule_syntax, cfg.priority, config, handler)
                        }
                        Err(e) => {
                            self.record(&cfg.name, format!("TLS options {options:?}: {e}"));
                            router.add_broken_tls_route(&cfg.rule, cfg.rule_syntax, cfg.priority, &e.to_string())
                        }
                    }
                }
            };
            if let Err(e) = added {
                self.record(&cfg.name, format!("invalid rule: {e}"));
            }
        }
    }
}

impl std::fmt::Debug for RouterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterManager")
            .field("entry_points", &self.config.entry_points.keys().collect::<Vec<_>>())
            .field("upgraders", &self.upgraders)
            .field("issues", &self.issues.len())
            .finish()
    }
}

/// A router with no entry points listed serves all of them.
fn serves(entry_points: &[String], name: &str) -> bool {
    entry_points.is_empty() || entry_points.iter().any(|ep| ep == name)
}

/// Host used to pick a certificate when a client sends no SNI: the bound
/// address, unless it is a wildcard.
fn local_host(address: &str) -> Option<String> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        let ip = addr.ip();
        return (!ip.is_unspecified()).then(|| ip.to_string());
    }
    let (host, _) = address.rsplit_once(':')?;
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}
