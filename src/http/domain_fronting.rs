//! Domain fronting guard.
//!
//! A client can complete TLS for one name and then ask for another in the
//! `Host` header. When the two names resolve to different TLS options the
//! request is answered with 421 Misdirected Request, so a host guarded by
//! strict options cannot be reached through a laxer one.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::forwarder::ConnectionInfo;
use super::request_host;
use crate::config::schema::DEFAULT_TLS_NAME;

/// Host → TLS options name for one entry point's HTTPS routers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptionsForHost {
    hosts: HashMap<String, String>,
}

impl TlsOptionsForHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `host` is served with `options`.
    ///
    /// Returns `false` when another router already claimed the host with
    /// different options; the host then falls back to the default options.
    pub fn claim(&mut self, host: &str, options: &str) -> bool {
        match self.hosts.get(host) {
            Some(existing) if existing != options => {
                self.hosts
                    .insert(host.to_string(), DEFAULT_TLS_NAME.to_string());
                false
            }
            _ => {
                self.hosts.insert(host.to_string(), options.to_string());
                true
            }
        }
    }

    /// Options name for `host`: exact, trailing dot toggled, lowercased,
    /// then `default`.
    pub fn options_for(&self, host: &str) -> &str {
        self.lookup(host)
            .or_else(|| self.lookup(&host.to_ascii_lowercase()))
            .unwrap_or(DEFAULT_TLS_NAME)
    }

    fn lookup(&self, host: &str) -> Option<&str> {
        if let Some(name) = self.hosts.get(host) {
            return Some(name);
        }
        let toggled = match host.strip_suffix('.') {
            Some(trimmed) => trimmed.to_string(),
            None if !host.is_empty() => format!("{host}."),
            None => return None,
        };
        self.hosts.get(&toggled).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.hosts.iter().map(|(h, o)| (h.as_str(), o.as_str()))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Host names computed upstream of the guard. When present they replace the
/// raw `Host` header; a CNAME-flattened name wins over the canonical one.
#[derive(Debug, Clone, Default)]
pub struct HostHints {
    pub canonical: Option<String>,
    pub cname_flattened: Option<String>,
}

/// Host the guard compares against the SNI.
pub fn effective_host(req: &Request<Body>) -> Option<String> {
    if let Some(hints) = req.extensions().get::<HostHints>() {
        if let Some(host) = hints.cname_flattened.as_ref().or(hints.canonical.as_ref()) {
            return Some(host.clone());
        }
    }
    request_host(req)
}

/// Equal ignoring case and one trailing dot on either side.
fn same_name(a: &str, b: &str) -> bool {
    let a = a.strip_suffix('.').unwrap_or(a);
    let b = b.strip_suffix('.').unwrap_or(b);
    a.eq_ignore_ascii_case(b)
}

pub async fn domain_fronting_guard(
    State(options): State<Arc<TlsOptionsForHost>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // Plaintext requests carry no SNI to compare against.
    let Some(tls) = req
        .extensions()
        .get::<ConnectionInfo>()
        .and_then(|info| info.tls.clone())
    else {
        return next.run(req).await;
    };
    let Some(host) = effective_host(&req) else {
        return next.run(req).await;
    };

    let sni = tls.server_name.unwrap_or_default();
    if same_name(&host, &sni) {
        return next.run(req).await;
    }

    let host_options = options.options_for(&host);
    let sni_options = options.options_for(&sni);
    if host_options != sni_options {
        tracing::debug!(
            host = %host,
            sni = %sni,
            host_options,
            sni_options,
            "Rejecting request: TLS options differ between SNI and Host"
        );
        return (StatusCode::MISDIRECTED_REQUEST, "Misdirected Request").into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::TlsInfo;
    use axum::{middleware, routing::get, Router};
    use tower::ServiceExt;

    fn options() -> Arc<TlsOptionsForHost> {
        let mut options = TlsOptionsForHost::new();
        options.claim("strict.test", "strict");
        options.claim("other-strict.test", "strict");
        options.claim("lax.test", "default");
        Arc::new(options)
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(options(), domain_fronting_guard))
    }

    fn request(host: &str, sni: Option<&str>) -> Request<Body> {
        let info = ConnectionInfo {
            peer_addr: "127.0.0.1:1000".parse().unwrap(),
            tls: sni.map(|name| TlsInfo {
                server_name: Some(name.to_string()),
                alpn: None,
            }),
        };
        Request::builder()
            .uri("/")
            .header("host", host)
            .extension(info)
            .body(Body::empty())
            .unwrap()
    }

    async fn status(req: Request<Body>) -> StatusCode {
        app().oneshot(req).await.unwrap().status()
    }

    #[test]
    fn lookup_order() {
        let options = options();
        assert_eq!(options.options_for("strict.test"), "strict");
        assert_eq!(options.options_for("strict.test."), "strict");
        assert_eq!(options.options_for("STRICT.test"), "strict");
        assert_eq!(options.options_for("unknown.test"), "default");
        assert_eq!(options.options_for(""), "default");
    }

    #[test]
    fn conflicting_claims_fall_back_to_default() {
        let mut options = TlsOptionsForHost::new();
        assert!(options.claim("a.test", "strict"));
        assert!(options.claim("a.test", "strict"));
        assert!(!options.claim("a.test", "lax"));
        assert_eq!(options.options_for("a.test"), "default");
    }

    #[test]
    fn only_one_trailing_dot_is_ignored() {
        assert!(same_name("Strict.test.", "strict.test"));
        assert!(same_name("strict.test", "strict.test."));
        assert!(!same_name("strict.test..", "strict.test"));
    }

    #[tokio::test]
    async fn doubled_trailing_dot_is_another_host() {
        assert_eq!(
            status(request("strict.test..", Some("strict.test"))).await,
            StatusCode::MISDIRECTED_REQUEST
        );
    }

    #[tokio::test]
    async fn fronting_across_options_is_rejected() {
        assert_eq!(
            status(request("strict.test", Some("lax.test"))).await,
            StatusCode::MISDIRECTED_REQUEST
        );
        assert_eq!(
            status(request("lax.test:8443", Some("strict.test"))).await,
            StatusCode::MISDIRECTED_REQUEST
        );
        // no SNI resolves to the default options
        assert_eq!(
            status(request("strict.test", Some(""))).await,
            StatusCode::MISDIRECTED_REQUEST
        );
    }

    #[tokio::test]
    async fn matching_or_equivalent_names_pass() {
        assert_eq!(status(request("strict.test", Some("strict.test"))).await, StatusCode::OK);
        assert_eq!(status(request("STRICT.test.", Some("strict.test"))).await, StatusCode::OK);
        assert_eq!(
            status(request("other-strict.test", Some("strict.test"))).await,
            StatusCode::OK
        );
        assert_eq!(status(request("unknown.test", Some("lax.test"))).await, StatusCode::OK);
        assert_eq!(status(request("strict.test", None)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn host_hints_replace_the_header() {
        let mut req = request("lax.test", Some("strict.test"));
        req.extensions_mut().insert(HostHints {
            canonical: Some("lax.test".into()),
            cname_flattened: Some("strict.test".into()),
        });
        assert_eq!(status(req).await, StatusCode::OK);
    }
}
