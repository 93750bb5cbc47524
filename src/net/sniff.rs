//! Non-destructive TLS ClientHello sniffing.
//!
//! Reads just enough of a new connection to tell TLS from plain TCP and,
//! for TLS, to pull the SNI and ALPN offers out of the ClientHello. Every
//! byte read is kept in [`ClientHello::peeked`] so it can be replayed.
//!
//! ```text
//! byte 0        0x16 handshake | 0x80 SSLv2 | other → plain TCP
//! bytes 1..5    version (2) + record length (2)
//! bytes 5..     handshake: type 0x01, len (3), version (2), random (32),
//!               session id, cipher suites, compression, extensions
//!               ext 0x0000 server_name, ext 0x0010 ALPN
//! ```

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(2);

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const SSLV2_FRAME: u8 = 0x80;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const RECORD_HEADER_LEN: usize = 5;
/// 2^14 plaintext plus the largest expansion a record may carry.
const MAX_RECORD_LEN: usize = 16384 + 2048;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const NAME_TYPE_HOST: u8 = 0x00;

/// Outcome of sniffing one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    /// SNI as sent by the client, empty when absent.
    pub server_name: String,
    pub alpn_protocols: Vec<String>,
    pub is_tls: bool,
    /// Every byte consumed from the stream, in order.
    pub peeked: Bytes,
}

#[derive(Debug, Default)]
struct Identity {
    server_name: String,
    alpn_protocols: Vec<String>,
}

enum Detected {
    Plain,
    Tls(Identity),
}

/// Bounded ClientHello reader.
#[derive(Debug, Clone)]
pub struct Sniffer {
    timeout: Duration,
}

impl Sniffer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Peek the start of `stream`. Never fails: I/O errors and timeouts
    /// report a non-TLS connection with whatever bytes were read.
    pub async fn sniff<S: AsyncRead + Unpin>(&self, stream: &mut S) -> ClientHello {
        let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + 512);
        let outcome = tokio::time::timeout(self.timeout, read_hello(stream, &mut buf)).await;
        let peeked = buf.freeze();

        match outcome {
            Ok(Ok(Detected::Tls(identity))) => ClientHello {
                server_name: identity.server_name,
                alpn_protocols: identity.alpn_protocols,
                is_tls: true,
                peeked,
            },
            Ok(Ok(Detected::Plain)) => ClientHello {
                peeked,
                ..ClientHello::default()
            },
            Ok(Err(e)) => {
                tracing::debug!(error = %e, bytes = peeked.len(), "ClientHello read failed");
                ClientHello {
                    peeked,
                    ..ClientHello::default()
                }
            }
            Err(_) => {
                tracing::debug!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    bytes = peeked.len(),
                    "ClientHello sniff timed out"
                );
                ClientHello {
                    peeked,
                    ..ClientHello::default()
                }
            }
        }
    }
}

impl Default for Sniffer {
    fn default() -> Self {
        Self::new(DEFAULT_HELLO_TIMEOUT)
    }
}

async fn fill<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    want: usize,
) -> io::Result<()> {
    while buf.len() < want {
        buf.reserve(want - buf.len());
        if stream.read_buf(buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
    Ok(())
}

async fn read_hello<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> io::Result<Detected> {
    fill(stream, buf, 1).await?;
    match buf[0] {
        CONTENT_TYPE_HANDSHAKE => {}
        SSLV2_FRAME => return Ok(Detected::Tls(Identity::default())),
        _ => return Ok(Detected::Plain),
    }

    fill(stream, buf, RECORD_HEADER_LEN).await?;
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len > MAX_RECORD_LEN {
        return Ok(Detected::Tls(Identity::default()));
    }

    fill(stream, buf, RECORD_HEADER_LEN + record_len).await?;
    let record = &buf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len];
    Ok(Detected::Tls(parse_client_hello(record).unwrap_or_default()))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize)
    }

    /// Sub-reader over a block prefixed by a one-byte length.
    fn block_u8(&mut self) -> Option<Reader<'a>> {
        let len = self.u8()? as usize;
        self.take(len).map(Reader::new)
    }

    /// Sub-reader over a block prefixed by a two-byte length.
    fn block_u16(&mut self) -> Option<Reader<'a>> {
        let len = self.u16()? as usize;
        self.take(len).map(Reader::new)
    }
}

/// Pull SNI and ALPN out of a handshake record. `None` for anything malformed.
fn parse_client_hello(record: &[u8]) -> Option<Identity> {
    let mut r = Reader::new(record);
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let len = r.u24()?;
    let mut hello = Reader::new(r.take(len)?);

    hello.take(2 + 32)?; // legacy version + random
    hello.block_u8()?; // session id
    hello.block_u16()?; // cipher suites
    hello.block_u8()?; // compression methods

    let mut identity = Identity::default();
    if hello.is_empty() {
        return Some(identity);
    }

    let mut extensions = hello.block_u16()?;
    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let mut body = extensions.block_u16()?;
        match kind {
            EXT_SERVER_NAME => {
                let mut names = body.block_u16()?;
                while !names.is_empty() {
                    let name_type = names.u8()?;
                    let name = names.block_u16()?;
                    if name_type == NAME_TYPE_HOST {
                        identity.server_name = std::str::from_utf8(name.data).ok()?.to_string();
                        break;
                    }
                }
            }
            EXT_ALPN => {
                let mut protocols = body.block_u16()?;
                while !protocols.is_empty() {
                    let proto = protocols.block_u8()?;
                    identity
                        .alpn_protocols
                        .push(String::from_utf8_lossy(proto.data).into_owned());
                }
            }
            _ => {}
        }
    }

    Some(identity)
}
