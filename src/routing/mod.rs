//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Configuration (per entry point)
//!     → manager.rs (compile routers, resolve TLS options, record issues)
//!     → router.rs (three muxers + HTTP/HTTPS forwarders + default TLS config)
//!
//! Accepted connection
//!     → router.rs (STARTTLS, sniff, decide)
//!     → muxer.rs (first matching route by priority)
//!     → handler.rs (TCP proxy | TLS terminator | broken TLS | HTTP forwarder)
//! ```
//!
//! # Design Decisions
//! - Routes are compiled when configuration is applied, never per connection
//! - Ties in priority keep configuration order
//! - A router that fails to build is reported, its siblings still serve

pub mod handler;
pub mod manager;
pub mod muxer;
pub mod router;

pub use handler::{Handler, TcpHandler, TcpProxy};
pub use manager::RouterManager;
pub use muxer::{compute_rule_priority, Muxer};
pub use router::{DispatchPath, Router};
