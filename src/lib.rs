//! Edge router library: TCP/TLS connection routing with SNI sniffing,
//! TLS termination or passthrough, and HTTP forwarding.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod rules;
pub mod tls;

pub use config::schema::ProxyConfig;
pub use lifecycle::{EdgeRouter, Shutdown};
pub use routing::{Router, RouterManager};
