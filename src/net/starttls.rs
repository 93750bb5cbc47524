//! STARTTLS preambles that run before the ClientHello is sniffed.
//!
//! Some protocols open in clear text and only switch to TLS after a
//! protocol-specific exchange. An upgrader performs that exchange and hands
//! back a stream whose next bytes are the ClientHello.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::connection::BoxedStream;

/// Protocol-specific exchange that precedes a TLS handshake.
#[async_trait]
pub trait StartTlsUpgrader: Send + Sync {
    /// Name used in entry point configuration.
    fn name(&self) -> &'static str;

    /// Run the preamble. An error closes the connection.
    async fn upgrade(&self, stream: BoxedStream) -> io::Result<BoxedStream>;
}

/// PostgreSQL `SSLRequest`: length 8, code 80877103.
pub const POSTGRES_SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

/// Answers a PostgreSQL `SSLRequest` with `S` so the client starts TLS.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresStartTls;

#[async_trait]
impl StartTlsUpgrader for PostgresStartTls {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn upgrade(&self, mut stream: BoxedStream) -> io::Result<BoxedStream> {
        let mut preamble = [0u8; 8];
        stream.read_exact(&mut preamble).await?;
        if preamble != POSTGRES_SSL_REQUEST {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected PostgreSQL SSLRequest",
            ));
        }
        stream.write_all(b"S").await?;
        stream.flush().await?;
        Ok(stream)
    }
}

/// Upgraders available to entry points, by name.
#[derive(Clone, Default)]
pub struct UpgraderRegistry {
    upgraders: HashMap<&'static str, Arc<dyn StartTlsUpgrader>>,
}

impl UpgraderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every bundled upgrader.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresStartTls));
        registry
    }

    pub fn register(&mut self, upgrader: Arc<dyn StartTlsUpgrader>) {
        self.upgraders.insert(upgrader.name(), upgrader);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StartTlsUpgrader>> {
        self.upgraders.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.upgraders.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.upgraders.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for UpgraderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgraderRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn postgres_accepts_ssl_request() {
        let (mut client, server) = duplex(64);
        client.write_all(&POSTGRES_SSL_REQUEST).await.unwrap();
        client.write_all(b"\x16\x03\x01").await.unwrap();

        let mut upgraded = PostgresStartTls.upgrade(Box::new(server)).await.unwrap();

        let mut answer = [0u8; 1];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"S");

        let mut next = [0u8; 3];
        upgraded.read_exact(&mut next).await.unwrap();
        assert_eq!(&next, b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn postgres_rejects_other_preamble() {
        let (mut client, server) = duplex(64);
        client
            .write_all(&[0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x30])
            .await
            .unwrap();
        assert!(PostgresStartTls.upgrade(Box::new(server)).await.is_err());
    }

    #[test]
    fn registry_lookup() {
        let registry = UpgraderRegistry::with_defaults();
        assert!(registry.contains("postgres"));
        assert!(registry.get("smtp").is_none());
        assert_eq!(registry.names(), vec!["postgres"]);
    }
}
