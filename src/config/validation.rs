//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routers reference existing entry points)
//! - Validate value ranges (timeouts > 0, connection limits > 0, ports valid)
//! - Detect duplicate router and service names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Rule syntax and TLS material are checked when routers are built, so one
//!   bad router does not reject the whole file

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("entry point {entry_point:?}: invalid address {address:?}")]
    InvalidAddress { entry_point: String, address: String },

    #[error("entry point {entry_point:?}: max_connections must be greater than 0")]
    ZeroConnections { entry_point: String },

    #[error("entry point {entry_point:?}: unknown STARTTLS adapter {name:?}")]
    UnknownStartTls { entry_point: String, name: String },

    #[error("duplicate {kind} name {name:?}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("router {router:?} references unknown entry point {entry_point:?}")]
    UnknownEntryPoint { router: String, entry_point: String },

    #[error("timeouts.{0} must be greater than 0")]
    ZeroTimeout(&'static str),

    #[error("unknown log format {0:?} (expected \"pretty\" or \"json\")")]
    InvalidLogFormat(String),
}

/// Validate `config`. `starttls` lists the adapter names that exist.
pub fn validate_config(config: &ProxyConfig, starttls: &[&str]) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (name, entry_point) in &config.entry_points {
        if !is_valid_address(&entry_point.address) {
            errors.push(ValidationError::InvalidAddress {
                entry_point: name.clone(),
                address: entry_point.address.clone(),
            });
        }
        if entry_point.max_connections == 0 {
            errors.push(ValidationError::ZeroConnections {
                entry_point: name.clone(),
            });
        }
        if let Some(adapter) = &entry_point.starttls {
            if !starttls.contains(&adapter.as_str()) {
                errors.push(ValidationError::UnknownStartTls {
                    entry_point: name.clone(),
                    name: adapter.clone(),
                });
            }
        }
    }

    check_unique("TCP router", config.tcp.routers.iter().map(|r| r.name.as_str()), &mut errors);
    check_unique("TCP service", config.tcp.services.iter().map(|s| s.name.as_str()), &mut errors);
    check_unique("HTTP router", config.http.routers.iter().map(|r| r.name.as_str()), &mut errors);
    check_unique("HTTP service", config.http.services.iter().map(|s| s.name.as_str()), &mut errors);

    let routers = config
        .tcp
        .routers
        .iter()
        .map(|r| (&r.name, &r.entry_points))
        .chain(config.http.routers.iter().map(|r| (&r.name, &r.entry_points)));
    for (router, entry_points) in routers {
        for entry_point in entry_points {
            if !config.entry_points.contains_key(entry_point) {
                errors.push(ValidationError::UnknownEntryPoint {
                    router: router.clone(),
                    entry_point: entry_point.clone(),
                });
            }
        }
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("connect_secs", timeouts.connect_secs),
        ("request_secs", timeouts.request_secs),
        ("hello_timeout_ms", timeouts.hello_timeout_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroTimeout(field));
        }
    }

    let format = config.observability.log_format.as_str();
    if format != "pretty" && format != "json" {
        errors.push(ValidationError::InvalidLogFormat(format.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
    errors: &mut Vec<ValidationError>,
) {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            errors.push(ValidationError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
}

/// `host:port` or `[v6]:port` with a numeric port.
fn is_valid_address(address: &str) -> bool {
    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    if port.parse::<u16>().is_err() {
        return false;
    }
    match host.strip_prefix('[') {
        Some(v6) => v6
            .strip_suffix(']')
            .is_some_and(|ip| ip.parse::<std::net::Ipv6Addr>().is_ok()),
        None => !host.is_empty() && !host.contains(':'),
    }
}
