//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields
//!     → connection spans (id, peer, entry_point) from net::listener
//!     → request spans and x-request-id from the HTTP forwarder
//!
//! logging.rs installs the subscriber: EnvFilter + fmt (pretty | json)
//! ```

pub mod logging;

pub use logging::init_logging;
