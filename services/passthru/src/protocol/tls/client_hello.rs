//! ClientHello extraction from the first TLS record.
//!
//! TLS record structure:
//! - byte 0: content type (0x16 = handshake)
//! - bytes 1-2: legacy record version
//! - bytes 3-4: record length
//! - bytes 5+: handshake message
//!
//! Handshake ClientHello:
//! - byte 0: handshake type (0x01 = ClientHello)
//! - bytes 1-3: length
//! - 2 bytes: client version
//! - 32 bytes: random
//! - 1 byte length + session ID
//! - 2 byte length + cipher suites
//! - 1 byte length + compression methods
//! - 2 byte length + extensions (optional)

use thiserror::Error;

/// Length of the record header preceding every TLS record.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext record body a peer may send (2^14).
pub const MAX_RECORD_LEN: usize = 16384;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_HEADER_LEN: usize = 4;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// The cleartext routing hints of a ClientHello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// Requested host name, lowercased without a trailing dot.
    pub server_name: Option<String>,
    /// First application protocol the client offered.
    pub alpn: Option<String>,
}

/// Why the leading bytes are not a usable ClientHello.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientHelloError {
    #[error("record type {0:#04x} is not a handshake")]
    NotHandshake(u8),

    #[error("handshake type {0:#04x} is not a ClientHello")]
    NotClientHello(u8),

    #[error("record length {0} exceeds the TLS maximum")]
    RecordTooLong(usize),

    /// The handshake message does not fit in the first record.
    #[error("ClientHello of {needed} bytes is fragmented across records")]
    Fragmented { needed: usize },

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("server name is not valid UTF-8")]
    InvalidServerName,
}

/// Validate a record header and return the full record length (header included).
pub fn record_len(header: &[u8]) -> Result<usize, ClientHelloError> {
    if header.len() < RECORD_HEADER_LEN {
        return Err(ClientHelloError::Truncated("record header"));
    }
    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(ClientHelloError::NotHandshake(header[0]));
    }

    let body_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if body_len > MAX_RECORD_LEN {
        return Err(ClientHelloError::RecordTooLong(body_len));
    }
    Ok(RECORD_HEADER_LEN + body_len)
}

/// Parse a complete first record (header included).
pub fn parse_client_hello(record: &[u8]) -> Result<ClientHelloInfo, ClientHelloError> {
    let total = record_len(record)?;
    if record.len() < total {
        return Err(ClientHelloError::Truncated("record"));
    }

    let mut handshake = Reader::new(&record[RECORD_HEADER_LEN..total]);
    let msg_type = handshake.u8("handshake header")?;
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return Err(ClientHelloError::NotClientHello(msg_type));
    }

    let msg_len = handshake.u24("handshake header")?;
    if msg_len > handshake.remaining() {
        return Err(ClientHelloError::Fragmented {
            needed: HANDSHAKE_HEADER_LEN + msg_len,
        });
    }

    let mut hello = Reader::new(handshake.bytes(msg_len, "ClientHello")?);
    hello.bytes(2 + 32, "version and random")?;
    hello.vec8("session id")?;
    hello.vec16("cipher suites")?;
    hello.vec8("compression methods")?;

    let mut info = ClientHelloInfo::default();
    if hello.remaining() == 0 {
        return Ok(info);
    }

    let mut extensions = Reader::new(hello.vec16("extensions")?);
    while extensions.remaining() > 0 {
        let ext_type = extensions.u16("extension header")?;
        let data = extensions.vec16("extension body")?;

        match ext_type {
            EXT_SERVER_NAME if info.server_name.is_none() => {
                info.server_name = parse_server_name(data)?;
            }
            EXT_ALPN if info.alpn.is_none() => {
                info.alpn = parse_alpn(data)?;
            }
            _ => {}
        }
    }

    Ok(info)
}

/// First `host_name` entry of a server_name extension.
fn parse_server_name(data: &[u8]) -> Result<Option<String>, ClientHelloError> {
    let mut list = Reader::new(Reader::new(data).vec16("server name list")?);

    while list.remaining() > 0 {
        let name_type = list.u8("server name entry")?;
        let name = list.vec16("server name")?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let host = std::str::from_utf8(name).map_err(|_| ClientHelloError::InvalidServerName)?;
        let host = normalize_host(host);
        return Ok((!host.is_empty()).then_some(host));
    }

    Ok(None)
}

/// First protocol of an application_layer_protocol_negotiation extension.
fn parse_alpn(data: &[u8]) -> Result<Option<String>, ClientHelloError> {
    let mut list = Reader::new(Reader::new(data).vec16("ALPN list")?);
    if list.remaining() == 0 {
        return Ok(None);
    }

    let first = list.vec8("ALPN protocol")?;
    Ok(Some(String::from_utf8_lossy(first).into_owned()))
}

/// Normalize: lowercase, trim trailing dot.
pub(crate) fn normalize_host(host: &str) -> String {
    host.to_ascii_lowercase().trim_end_matches('.').to_string()
}

/// Bounds-checked big-endian cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ClientHelloError> {
        if n > self.remaining() {
            return Err(ClientHelloError::Truncated(what));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ClientHelloError> {
        Ok(self.bytes(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ClientHelloError> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<usize, ClientHelloError> {
        let b = self.bytes(3, what)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }

    fn vec8(&mut self, what: &'static str) -> Result<&'a [u8], ClientHelloError> {
        let len = self.u8(what)? as usize;
        self.bytes(len, what)
    }

    fn vec16(&mut self, what: &'static str) -> Result<&'a [u8], ClientHelloError> {
        let len = self.u16(what)? as usize;
        self.bytes(len, what)
    }
}
