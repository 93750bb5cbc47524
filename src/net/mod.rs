//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits, tracking)
//!     → starttls.rs (optional protocol preamble)
//!     → sniff.rs (bounded ClientHello peek: SNI, ALPN)
//!     → peeked.rs (replay the peeked bytes to the chosen handler)
//! ```
//!
//! # Design Decisions
//! - Permit acquired before accept, so the kernel backlog absorbs bursts
//! - Sniffing never fails a connection; errors and timeouts mean "not TLS"
//! - Every byte read while sniffing is replayed, handlers see the raw stream

pub mod connection;
pub mod listener;
pub mod peeked;
pub mod sniff;
pub mod starttls;

pub use connection::{BoxedStream, Connection, ConnectionTracker, TlsInfo};
pub use listener::{EntryPoint, ListenerError};
pub use peeked::PeekedStream;
pub use sniff::{ClientHello, Sniffer};
pub use starttls::{StartTlsUpgrader, UpgraderRegistry};
