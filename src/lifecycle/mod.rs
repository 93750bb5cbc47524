//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → TLS manager → routers per entry point → bind entry points → accept
//!
//! Reload (startup.rs):
//!     New config → equal? skip → TLS manager update → rebuild routers → swap
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → stop accepting → drain connections (deadline) → exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then TLS, then routers, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline: remaining connections are dropped with the runtime

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
pub use startup::{EdgeRouter, StartupError};
