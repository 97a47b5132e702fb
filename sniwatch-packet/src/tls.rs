//! TLS ClientHello recognition and server_name extraction
//!
//! [`scan`] looks at the bytes a client sent at the start of a TCP stream.
//! It understands just enough of the record and handshake layers to find
//! the first ClientHello, coalescing it across records when it was split,
//! and to pull the `host_name` entry out of the server_name extension.

use bytes::{BufMut, BytesMut};
use std::fmt;

/// Record content type for handshake messages
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Record layer header length
pub const RECORD_HEADER_LEN: usize = 5;

/// Handshake message header length
pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// Largest record body permitted (2^14 plus expansion allowance)
pub const MAX_RECORD_LEN: usize = 16384 + 2048;

const EXT_SERVER_NAME: u16 = 0;
const EXT_ALPN: u16 = 16;
const EXT_SUPPORTED_VERSIONS: u16 = 43;
const NAME_TYPE_HOST_NAME: u8 = 0;

/// Fields pulled out of a ClientHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// First host_name entry of the server_name extension
    pub hostname: String,
    /// `legacy_version` from the ClientHello body
    pub legacy_version: u16,
    /// Number of offered cipher suites
    pub cipher_suite_count: usize,
    /// ALPN protocol names, in offer order
    pub alpn: Vec<String>,
    /// supported_versions entries, GREASE values excluded
    pub supported_versions: Vec<u16>,
    /// Length of the handshake message body
    pub message_len: usize,
}

impl ClientHelloInfo {
    /// Highest version offered, from supported_versions when present
    pub fn max_version(&self) -> u16 {
        self.supported_versions
            .iter()
            .copied()
            .max()
            .unwrap_or(self.legacy_version)
    }
}

/// Result of scanning the start of a client stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A complete ClientHello carrying a hostname
    Found(ClientHelloInfo),
    /// Not a ClientHello, or a ClientHello without server_name
    NotFound,
    /// Looks like a ClientHello but more bytes are needed
    Incomplete {
        /// Lower bound on the additional bytes required
        needed: usize,
    },
    /// Framed like a ClientHello but internally inconsistent
    Malformed(&'static str),
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanOutcome::Found(info) => write!(f, "found {}", info.hostname),
            ScanOutcome::NotFound => f.write_str("not found"),
            ScanOutcome::Incomplete { needed } => write!(f, "incomplete, {} more bytes", needed),
            ScanOutcome::Malformed(reason) => write!(f, "malformed: {}", reason),
        }
    }
}

/// True if `payload` starts the way a ClientHello record does
///
/// Checks as much of the record and handshake headers as is present.
pub fn looks_like_client_hello(payload: &[u8]) -> bool {
    match payload {
        [] => false,
        [CONTENT_TYPE_HANDSHAKE] => true,
        [CONTENT_TYPE_HANDSHAKE, 0x03, rest @ ..] => {
            rest.len() < 4 || rest[3] == HANDSHAKE_CLIENT_HELLO
        }
        _ => false,
    }
}

/// Scan the first bytes of a client stream for a ClientHello
pub fn scan(payload: &[u8]) -> ScanOutcome {
    if !looks_like_client_hello(payload) {
        return ScanOutcome::NotFound;
    }

    let message = match coalesce_handshake(payload) {
        Ok(message) => message,
        Err(outcome) => return outcome,
    };

    match parse_client_hello(&message) {
        Ok(Some(info)) => ScanOutcome::Found(info),
        Ok(None) => ScanOutcome::NotFound,
        Err(reason) => ScanOutcome::Malformed(reason),
    }
}

/// Gather the first handshake message from consecutive records
///
/// Returns the message body (without the 4-byte handshake header).
fn coalesce_handshake(payload: &[u8]) -> Result<Vec<u8>, ScanOutcome> {
    let mut handshake = Vec::new();
    let mut offset = 0;
    let mut message_len: Option<usize> = None;

    loop {
        if let Some(len) = message_len {
            if handshake.len() >= HANDSHAKE_HEADER_LEN + len {
                handshake.truncate(HANDSHAKE_HEADER_LEN + len);
                return Ok(handshake.split_off(HANDSHAKE_HEADER_LEN));
            }
        }

        let Some(header) = payload.get(offset..offset + RECORD_HEADER_LEN) else {
            let missing_header = offset + RECORD_HEADER_LEN - payload.len();
            return Err(ScanOutcome::Incomplete {
                needed: missing_header + still_needed(&handshake, message_len),
            });
        };

        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(ScanOutcome::Malformed("non-handshake record inside ClientHello"));
        }
        if header[1] != 0x03 {
            return Err(ScanOutcome::Malformed("unexpected record version"));
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            return Err(ScanOutcome::Malformed("bad record length"));
        }

        let body_start = offset + RECORD_HEADER_LEN;
        let available = payload.len().saturating_sub(body_start).min(record_len);
        handshake.extend_from_slice(&payload[body_start..body_start + available]);

        if message_len.is_none() && handshake.len() >= HANDSHAKE_HEADER_LEN {
            if handshake[0] != HANDSHAKE_CLIENT_HELLO {
                return Err(ScanOutcome::NotFound);
            }
            let len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
            message_len = Some(len);
        }

        if available < record_len {
            // Record cut short by the end of the payload
            let complete = message_len
                .map(|len| handshake.len() >= HANDSHAKE_HEADER_LEN + len)
                .unwrap_or(false);
            if !complete {
                let needed = (record_len - available).max(still_needed(&handshake, message_len));
                return Err(ScanOutcome::Incomplete { needed });
            }
        }

        offset = body_start + record_len;
    }
}

fn still_needed(handshake: &[u8], message_len: Option<usize>) -> usize {
    let target = HANDSHAKE_HEADER_LEN + message_len.unwrap_or(0);
    target.saturating_sub(handshake.len()).max(1)
}

/// Bounds-checked reader over a byte slice
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], &'static str> {
        let slice = self
            .data
            .get(self.offset..self.offset + len)
            .ok_or(what)?;
        self.offset += len;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, &'static str> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, &'static str> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn vec8(&mut self, what: &'static str) -> Result<&'a [u8], &'static str> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    fn vec16(&mut self, what: &'static str) -> Result<&'a [u8], &'static str> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }
}

fn parse_client_hello(body: &[u8]) -> Result<Option<ClientHelloInfo>, &'static str> {
    let mut reader = Reader::new(body);

    let legacy_version = reader.u16("truncated version")?;
    reader.take(32, "truncated random")?;
    let session_id = reader.vec8("truncated session id")?;
    if session_id.len() > 32 {
        return Err("session id too long");
    }
    let ciphers = reader.vec16("truncated cipher suites")?;
    if ciphers.is_empty() || ciphers.len() % 2 != 0 {
        return Err("bad cipher suite list");
    }
    let compression = reader.vec8("truncated compression methods")?;
    if compression.is_empty() {
        return Err("empty compression methods");
    }

    // No extensions block at all: nothing to name the server with
    if reader.remaining() == 0 {
        return Ok(None);
    }

    let mut extensions = Reader::new(reader.vec16("truncated extensions")?);
    let mut hostname = None;
    let mut alpn = Vec::new();
    let mut supported_versions = Vec::new();

    while extensions.remaining() > 0 {
        let ext_type = extensions.u16("truncated extension header")?;
        let ext_data = extensions.vec16("extension overruns block")?;

        match ext_type {
            EXT_SERVER_NAME if hostname.is_none() => {
                hostname = parse_server_name(ext_data)?;
            }
            EXT_ALPN => {
                let mut list = Reader::new(Reader::new(ext_data).vec16("truncated ALPN list")?);
                while list.remaining() > 0 {
                    let name = list.vec8("truncated ALPN entry")?;
                    alpn.push(String::from_utf8_lossy(name).into_owned());
                }
            }
            EXT_SUPPORTED_VERSIONS => {
                let list = Reader::new(ext_data).vec8("truncated supported_versions")?;
                supported_versions = list
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .filter(|version| !is_grease(*version))
                    .collect();
            }
            _ => {}
        }
    }

    Ok(hostname.map(|hostname| ClientHelloInfo {
        hostname,
        legacy_version,
        cipher_suite_count: ciphers.len() / 2,
        alpn,
        supported_versions,
        message_len: body.len(),
    }))
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>, &'static str> {
    let mut list = Reader::new(Reader::new(data).vec16("truncated server_name list")?);
    while list.remaining() > 0 {
        let name_type = list.u8("truncated server_name entry")?;
        let name = list.vec16("truncated server_name entry")?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }
        if name.is_empty() {
            return Err("empty host_name");
        }
        if !name.iter().all(|b| b.is_ascii() && !b.is_ascii_control()) {
            return Err("host_name is not printable ASCII");
        }
        // All bytes are ASCII, so this cannot fail
        return Ok(std::str::from_utf8(name).ok().map(str::to_owned));
    }
    Ok(None)
}

fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a
}

/// Builds ClientHello records for tests and synthetic captures
#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    server_name: Option<Vec<u8>>,
    legacy_version: u16,
    cipher_suites: Vec<u16>,
    session_id: Vec<u8>,
    alpn: Vec<String>,
    supported_versions: Vec<u16>,
    padding: usize,
}

impl ClientHelloBuilder {
    pub fn new(hostname: &str) -> Self {
        ClientHelloBuilder {
            server_name: Some(hostname.as_bytes().to_vec()),
            legacy_version: 0x0303,
            cipher_suites: vec![0x1301, 0x1302, 0x1303, 0xC02F],
            session_id: vec![0x5A; 32],
            alpn: Vec::new(),
            supported_versions: Vec::new(),
            padding: 0,
        }
    }

    /// ClientHello with no server_name extension
    pub fn without_server_name() -> Self {
        let mut builder = Self::new("");
        builder.server_name = None;
        builder
    }

    /// Use raw bytes as the host_name value
    pub fn with_raw_server_name(mut self, name: &[u8]) -> Self {
        self.server_name = Some(name.to_vec());
        self
    }

    pub fn with_alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_supported_versions(mut self, versions: &[u16]) -> Self {
        self.supported_versions = versions.to_vec();
        self
    }

    pub fn with_cipher_suites(mut self, suites: &[u16]) -> Self {
        self.cipher_suites = suites.to_vec();
        self
    }

    /// Add a padding extension of `len` bytes, to grow the message
    pub fn with_padding(mut self, len: usize) -> Self {
        self.padding = len;
        self
    }

    /// Handshake message: 4-byte header plus ClientHello body
    pub fn build_message(&self) -> Vec<u8> {
        let mut extensions = BytesMut::new();

        if let Some(name) = &self.server_name {
            extensions.put_u16(EXT_SERVER_NAME);
            extensions.put_u16((name.len() + 5) as u16);
            extensions.put_u16((name.len() + 3) as u16);
            extensions.put_u8(NAME_TYPE_HOST_NAME);
            extensions.put_u16(name.len() as u16);
            extensions.put_slice(name);
        }

        if !self.alpn.is_empty() {
            let list_len: usize = self.alpn.iter().map(|p| p.len() + 1).sum();
            extensions.put_u16(EXT_ALPN);
            extensions.put_u16((list_len + 2) as u16);
            extensions.put_u16(list_len as u16);
            for protocol in &self.alpn {
                extensions.put_u8(protocol.len() as u8);
                extensions.put_slice(protocol.as_bytes());
            }
        }

        if !self.supported_versions.is_empty() {
            let list_len = self.supported_versions.len() * 2;
            extensions.put_u16(EXT_SUPPORTED_VERSIONS);
            extensions.put_u16((list_len + 1) as u16);
            extensions.put_u8(list_len as u8);
            for version in &self.supported_versions {
                extensions.put_u16(*version);
            }
        }

        if self.padding > 0 {
            extensions.put_u16(21);
            extensions.put_u16(self.padding as u16);
            extensions.put_bytes(0, self.padding);
        }

        let mut body = BytesMut::new();
        body.put_u16(self.legacy_version);
        body.put_bytes(0x42, 32);
        body.put_u8(self.session_id.len() as u8);
        body.put_slice(&self.session_id);
        body.put_u16((self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            body.put_u16(*suite);
        }
        body.put_u8(1);
        body.put_u8(0);
        body.put_u16(extensions.len() as u16);
        body.put_slice(&extensions);

        let mut message = BytesMut::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
        message.put_u8(HANDSHAKE_CLIENT_HELLO);
        message.put_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.put_slice(&body);
        message.to_vec()
    }

    /// The message wrapped in a single record
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_records(MAX_RECORD_LEN)
    }

    /// The message fragmented into records of at most `max_fragment` bytes
    pub fn to_records(&self, max_fragment: usize) -> Vec<u8> {
        let message = self.build_message();
        let mut records = BytesMut::new();
        for fragment in message.chunks(max_fragment.max(1)) {
            records.put_u8(CONTENT_TYPE_HANDSHAKE);
            records.put_u16(0x0301);
            records.put_u16(fragment.len() as u16);
            records.put_slice(fragment);
        }
        records.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(outcome: ScanOutcome) -> ClientHelloInfo {
        match outcome {
            ScanOutcome::Found(info) => info,
            other => panic!("Expected Found, got {other:?}"),
        }
    }

    #[test]
    fn test_scan_simple() {
        let bytes = ClientHelloBuilder::new("example.com")
            .with_alpn(&["h2", "http/1.1"])
            .with_supported_versions(&[0x3A3A, 0x0304, 0x0303])
            .to_bytes();

        let info = found(scan(&bytes));
        assert_eq!(info.hostname, "example.com");
        assert_eq!(info.cipher_suite_count, 4);
        assert_eq!(info.alpn, vec!["h2", "http/1.1"]);
        assert_eq!(info.supported_versions, vec![0x0304, 0x0303]);
        assert_eq!(info.max_version(), 0x0304);
        assert_eq!(info.message_len + 4 + 5, bytes.len());
    }

    #[test]
    fn test_scan_every_prefix_is_incomplete() {
        let bytes = ClientHelloBuilder::new("example.com").to_bytes();
        for len in 1..bytes.len() {
            match scan(&bytes[..len]) {
                ScanOutcome::Incomplete { needed } => {
                    assert!(needed >= 1);
                    assert!(len + needed <= bytes.len(), "overestimate at {len}");
                }
                other => panic!("prefix of {len} bytes gave {other:?}"),
            }
        }
        assert!(matches!(scan(&bytes), ScanOutcome::Found(_)));
    }

    #[test]
    fn test_scan_coalesces_records() {
        let bytes = ClientHelloBuilder::new("split.example")
            .with_padding(300)
            .to_records(64);
        assert!(bytes.len() > 6 * 64);
        assert_eq!(found(scan(&bytes)).hostname, "split.example");

        // Trailing data after the message is ignored
        let mut with_tail = bytes;
        with_tail.extend_from_slice(&[0x17, 0x03, 0x03, 0x00, 0x01, 0x00]);
        assert_eq!(found(scan(&with_tail)).hostname, "split.example");
    }

    #[test]
    fn test_scan_not_found() {
        assert_eq!(scan(b""), ScanOutcome::NotFound);
        assert_eq!(scan(b"GET / HTTP/1.1\r\n"), ScanOutcome::NotFound);
        // ServerHello
        assert_eq!(scan(&[0x16, 0x03, 0x03, 0x00, 0x04, 0x02, 0, 0, 0]), ScanOutcome::NotFound);
        assert_eq!(
            scan(&ClientHelloBuilder::without_server_name().to_bytes()),
            ScanOutcome::NotFound
        );
    }

    #[test]
    fn test_scan_rejects_bad_hostnames() {
        for name in [&b""[..], b"bad\x00name", "exämple.com".as_bytes(), b"tab\tname"] {
            let bytes = ClientHelloBuilder::new("").with_raw_server_name(name).to_bytes();
            assert!(
                matches!(scan(&bytes), ScanOutcome::Malformed(_)),
                "accepted {name:?}"
            );
        }
    }

    #[test]
    fn test_scan_malformed_framing() {
        let mut bytes = ClientHelloBuilder::new("example.com").to_records(40);
        // Second record turned into application data
        bytes[45] = 0x17;
        assert!(matches!(scan(&bytes), ScanOutcome::Malformed(_)));

        let mut bytes = ClientHelloBuilder::new("example.com").to_bytes();
        // Extensions length larger than the message
        let ext_len_at = bytes.len() - (4 + 2 + 3 + 11) - 2;
        bytes[ext_len_at] = 0x7F;
        assert!(matches!(scan(&bytes), ScanOutcome::Malformed(_)));
    }
}
