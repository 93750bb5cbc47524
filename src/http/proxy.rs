//! Host-routed forwarding to HTTP services.
//!
//! # Responsibilities
//! - Map the request host to a service (exact or one-label wildcard)
//! - Rewrite the URI to the service and strip hop-by-hop headers
//! - Set `x-forwarded-*` headers
//! - Answer 404 when no host matches and 502 when the upstream fails

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue},
        uri::{Authority, PathAndQuery, Scheme},
        Request, StatusCode, Uri, Version,
    },
    response::{IntoResponse, Response},
    Extension,
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use thiserror::Error;

use super::forwarder::ConnectionInfo;
use super::request_host;
use crate::routing::muxer::compute_rule_priority;
use crate::rules::{parse, RuleError};
use crate::tls::store::matches_domain;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid rule: {0}")]
    Rule(#[from] RuleError),

    #[error("invalid service URL {url:?}: {reason}")]
    Upstream { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct HostRoute {
    pub router: String,
    pub service: String,
    hosts: Vec<String>,
    scheme: Scheme,
    authority: Authority,
    priority: i64,
}

/// HTTP routers of one forwarder, sorted by descending priority.
#[derive(Debug, Clone, Default)]
pub struct HostRoutes {
    routes: Vec<HostRoute>,
}

impl HostRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a router. Its `Host(...)` values decide which requests it takes;
    /// a rule without any matches every host.
    pub fn add(
        &mut self,
        router: &str,
        rule: &str,
        priority: i64,
        service: &str,
        url: &str,
    ) -> Result<(), RouteError> {
        let hosts = parse(rule)?
            .values_of("Host")
            .into_iter()
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .collect();

        let upstream_error = |reason: &str| RouteError::Upstream {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let uri: Uri = url.parse().map_err(|_| upstream_error("not a URI"))?;
        if uri.scheme() != Some(&Scheme::HTTP) {
            return Err(upstream_error("only http:// services are supported"));
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| upstream_error("missing host"))?;

        self.routes.push(HostRoute {
            router: router.to_string(),
            service: service.to_string(),
            hosts,
            scheme: Scheme::HTTP,
            authority,
            priority: if priority == 0 {
                compute_rule_priority(rule)
            } else {
                priority
            },
        });
        self.routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    pub fn find(&self, host: &str) -> Option<&HostRoute> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.routes.iter().find(|route| {
            route.hosts.is_empty() || route.hosts.iter().any(|h| matches_domain(&host, h))
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Application state injected into the proxy handler.
#[derive(Clone)]
pub struct ProxyState {
    pub routes: Arc<HostRoutes>,
    pub client: Client<HttpConnector, Body>,
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    for name in [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
}

fn set_forwarded_headers(headers: &mut HeaderMap, info: &ConnectionInfo, host: &str) {
    let peer = info.peer_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {peer}"),
        None => peer,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let proto = if info.tls.is_some() { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if !host.is_empty() && !headers.contains_key(X_FORWARDED_HOST) {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }
}

/// Main proxy handler.
/// Looks up the route by host and forwards the request.
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    Extension(info): Extension<ConnectionInfo>,
    request: Request<Body>,
) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let host = request_host(&request).unwrap_or_default();

    let Some(route) = state.routes.find(&host) else {
        tracing::debug!(request_id = %request_id, host = %host, "No route matched");
        return (StatusCode::NOT_FOUND, "No matching route found").into_response();
    };

    let (mut parts, body) = request.into_parts();
    let original_host = parts
        .headers
        .get(header::HOST)
        .cloned()
        .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));

    let mut uri_parts = parts.uri.clone().into_parts();
    uri_parts.scheme = Some(route.scheme.clone());
    uri_parts.authority = Some(route.authority.clone());
    if uri_parts.path_and_query.is_none() {
        uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    let uri = match Uri::from_parts(uri_parts) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Unable to build upstream URI");
            return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
        }
    };

    strip_hop_by_hop(&mut parts.headers);
    set_forwarded_headers(&mut parts.headers, &info, &host);
    if let Some(value) = original_host {
        parts.headers.insert(header::HOST, value);
    }
    parts.uri = uri;
    parts.version = Version::HTTP_11;

    tracing::debug!(
        request_id = %request_id,
        router = %route.router,
        service = %route.service,
        method = %parts.method,
        path = %parts.uri.path(),
        "Proxying request"
    );

    match state.client.request(Request::from_parts(parts, body)).await {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => {
            tracing::warn!(request_id = %request_id, service = %route.service, error = %e, "Upstream error");
            (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
        }
    }
}
