//! Matcher registry: resolves a call in a rule to a leaf predicate.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{template, ConnData, RuleError};

/// Leaf predicate evaluated against connection metadata.
pub type Predicate = Arc<dyn Fn(&ConnData) -> bool + Send + Sync>;

/// Reserved for the ACME TLS-ALPN-01 challenge; routes may not claim it.
const ACME_TLS_ALPN: &str = "acme-tls/1";

/// Grammar variant a rule is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSyntax {
    /// One argument per matcher, `HostSNIRegexp` takes a plain regex.
    Legacy,
    /// N arguments per matcher, `HostSNIRegexp` takes `{name:pattern}` templates.
    #[default]
    Extended,
}

impl RuleSyntax {
    fn multi_args(self) -> bool {
        matches!(self, RuleSyntax::Extended)
    }

    fn templates(self) -> bool {
        matches!(self, RuleSyntax::Extended)
    }
}

impl fmt::Display for RuleSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSyntax::Legacy => f.write_str("legacy"),
            RuleSyntax::Extended => f.write_str("extended"),
        }
    }
}

/// Matchers available to TCP rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    HostSni,
    HostSniRegexp,
    ClientIp,
    Alpn,
}

impl Matcher {
    const ALL: [Matcher; 4] = [
        Matcher::HostSni,
        Matcher::HostSniRegexp,
        Matcher::ClientIp,
        Matcher::Alpn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Matcher::HostSni => "HostSNI",
            Matcher::HostSniRegexp => "HostSNIRegexp",
            Matcher::ClientIp => "ClientIP",
            Matcher::Alpn => "ALPN",
        }
    }

    /// Case-insensitive lookup of a matcher name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
    }
}

/// Build the predicate for one `Name(args...)` call.
pub fn build(name: &str, args: &[String], syntax: RuleSyntax) -> Result<Predicate, RuleError> {
    let matcher = Matcher::from_name(name).ok_or_else(|| RuleError::UnknownMatcher {
        name: name.to_string(),
        syntax,
    })?;

    if args.is_empty() {
        return Err(RuleError::NoArguments {
            matcher: matcher.name(),
        });
    }
    if args.len() > 1 && !syntax.multi_args() {
        return Err(RuleError::TooManyArguments {
            matcher: matcher.name(),
            syntax,
            count: args.len(),
        });
    }

    match matcher {
        Matcher::HostSni => host_sni(args),
        Matcher::HostSniRegexp => host_sni_regexp(args, syntax),
        Matcher::ClientIp => client_ip(args),
        Matcher::Alpn => alpn(args),
    }
}

fn is_host_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-'))
}

fn host_sni(args: &[String]) -> Result<Predicate, RuleError> {
    let mut hosts = Vec::with_capacity(args.len());
    for arg in args {
        if arg != "*" && !is_host_token(arg) {
            return Err(RuleError::InvalidArgument {
                matcher: "HostSNI",
                value: arg.clone(),
                reason: "is not a valid hostname".to_string(),
            });
        }
        hosts.push(arg.to_ascii_lowercase());
    }

    if hosts.iter().any(|host| host == "*") {
        return Ok(Arc::new(|_| true));
    }

    Ok(Arc::new(move |meta: &ConnData| {
        let name = meta.server_name();
        if name.is_empty() {
            return false;
        }
        let trimmed = name.strip_suffix('.').unwrap_or(name);
        hosts.iter().any(|host| {
            let host_trimmed = host.strip_suffix('.').unwrap_or(host.as_str());
            host == name || host_trimmed == name || host == trimmed
        })
    }))
}

fn host_sni_regexp(args: &[String], syntax: RuleSyntax) -> Result<Predicate, RuleError> {
    let mut patterns = Vec::with_capacity(args.len());
    for arg in args {
        if !arg.is_ascii() {
            return Err(RuleError::InvalidArgument {
                matcher: "HostSNIRegexp",
                value: arg.clone(),
                reason: "contains non-ASCII characters".to_string(),
            });
        }

        let source = if syntax.templates() {
            template::prepare_pattern(arg)?
        } else {
            format!("(?i)^(?:{arg})$")
        };

        let re = Regex::new(&source).map_err(|e| RuleError::InvalidArgument {
            matcher: "HostSNIRegexp",
            value: arg.clone(),
            reason: e.to_string(),
        })?;
        patterns.push(re);
    }

    Ok(Arc::new(move |meta: &ConnData| {
        let name = meta.server_name();
        patterns.iter().any(|re| re.is_match(name))
    }))
}

fn client_ip(args: &[String]) -> Result<Predicate, RuleError> {
    let mut nets = Vec::with_capacity(args.len());
    for arg in args {
        let value = arg.trim();
        let net = match value.parse::<IpNet>() {
            Ok(net) => net,
            Err(_) => value
                .parse::<IpAddr>()
                .map(IpNet::from)
                .map_err(|_| RuleError::InvalidArgument {
                    matcher: "ClientIP",
                    value: arg.clone(),
                    reason: "is neither an IP address nor a CIDR".to_string(),
                })?,
        };
        nets.push(net);
    }

    Ok(Arc::new(move |meta: &ConnData| {
        match meta.remote_ip().parse::<IpAddr>() {
            Ok(ip) => nets.iter().any(|net| net.contains(&ip)),
            Err(_) => false,
        }
    }))
}

fn alpn(args: &[String]) -> Result<Predicate, RuleError> {
    if let Some(reserved) = args
        .iter()
        .find(|a| a.eq_ignore_ascii_case(ACME_TLS_ALPN))
    {
        return Err(RuleError::InvalidArgument {
            matcher: "ALPN",
            value: reserved.clone(),
            reason: "is reserved for the ACME TLS-ALPN challenge".to_string(),
        });
    }

    let protocols = args.to_vec();
    Ok(Arc::new(move |meta: &ConnData| {
        meta.alpn_protocols()
            .iter()
            .any(|offered| protocols.iter().any(|p| p == offered))
    }))
}
