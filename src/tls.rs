//! TLS ClientHello SNI locator
//!
//! Finds the server_name extension value in a ClientHello without decoding
//! anything else. Non-TLS and truncated input is normal traffic here, so every
//! failure is a plain `None`, never a panic or an error.
//!
//! Based on RFC 8446 §4.1.2 and RFC 6066 §3.

use crate::wire::{read_u16, read_u24};

/// Record content type for handshake messages
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension type for server_name
pub const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// server_name entry type for DNS hostnames
pub const NAME_TYPE_HOST_NAME: u8 = 0x00;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

/// legacy_version (2) + random (32)
const VERSION_AND_RANDOM_LEN: usize = 34;

/// Location of the hostname bytes within the buffer that was searched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniSpan {
    pub offset: usize,
    pub len: usize,
}

impl SniSpan {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Midpoint of the hostname, used as a split position
    pub fn midpoint(&self) -> usize {
        self.offset + self.len / 2
    }

    /// Hostname bytes as UTF-8, if `buf` is the buffer that was searched
    pub fn hostname<'a>(&self, buf: &'a [u8]) -> Option<&'a str> {
        std::str::from_utf8(buf.get(self.offset..self.end())?).ok()
    }

    /// Shift the span by `delta` bytes
    pub fn shifted(self, delta: usize) -> Self {
        Self {
            offset: self.offset + delta,
            len: self.len,
        }
    }
}

/// Locate the SNI hostname in a buffer starting at the TLS record layer.
///
/// The returned offset is absolute within `data`.
pub fn locate_sni(data: &[u8]) -> Option<SniSpan> {
    if data.len() < RECORD_HEADER_LEN {
        return None;
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE || data[1] != 0x03 {
        return None;
    }

    let record_len = read_u16(data, 3)? as usize;
    let end = data.len().min(RECORD_HEADER_LEN + record_len);

    // Handshake header plus version and random must be present
    if end - RECORD_HEADER_LEN < HANDSHAKE_HEADER_LEN + VERSION_AND_RANDOM_LEN {
        return None;
    }

    locate_in_handshake(data, RECORD_HEADER_LEN, end)
}

/// Walk a ClientHello handshake message that begins at `start` and find its
/// server_name hostname. Nothing at or beyond `end` is read.
///
/// Shared by the TCP locator (after the record header) and the QUIC locator
/// (at the start of the CRYPTO stream).
pub fn locate_in_handshake(buf: &[u8], start: usize, end: usize) -> Option<SniSpan> {
    let end = end.min(buf.len());
    if *buf.get(start)? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let body_len = read_u24(buf, start + 1)?;
    let end = end.min(start + HANDSHAKE_HEADER_LEN + body_len);

    let mut pos = start + HANDSHAKE_HEADER_LEN + VERSION_AND_RANDOM_LEN;
    if pos >= end {
        return None;
    }

    // session_id
    pos += 1 + *buf.get(pos)? as usize;

    // cipher_suites
    if pos + 2 > end {
        return None;
    }
    pos += 2 + read_u16(buf, pos)? as usize;

    // compression_methods
    if pos >= end {
        return None;
    }
    pos += 1 + buf[pos] as usize;

    // extensions
    if pos + 2 > end {
        return None;
    }
    let extensions_len = read_u16(buf, pos)? as usize;
    pos += 2;
    let extensions_end = end.min(pos + extensions_len);

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(buf, pos)?;
        let ext_len = read_u16(buf, pos + 2)? as usize;
        pos += 4;

        if ext_type == EXTENSION_SERVER_NAME {
            return server_name_entry(buf, pos, extensions_end.min(pos + ext_len));
        }
        pos += ext_len;
    }

    None
}

/// Parse the body of a server_name extension (RFC 6066 §3)
fn server_name_entry(buf: &[u8], pos: usize, end: usize) -> Option<SniSpan> {
    // server_name_list length, then the first entry
    if pos + 2 + 3 > end {
        return None;
    }
    let name_type = buf[pos + 2];
    let name_len = read_u16(buf, pos + 3)? as usize;
    let name_start = pos + 5;

    if name_type != NAME_TYPE_HOST_NAME || name_start + name_len > end {
        return None;
    }

    Some(SniSpan {
        offset: name_start,
        len: name_len,
    })
}

/// Builds a minimal ClientHello record carrying one hostname.
///
/// The output is accepted by [`locate_sni`] and looks like a TLS 1.3 hello to
/// a middlebox: supported_versions, a key_share placeholder and the usual
/// cipher suites. Used for decoy payloads.
#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    hostname: String,
    random: [u8; 32],
    session_id: Vec<u8>,
    extra_extensions: Vec<(u16, Vec<u8>)>,
    server_name_first: bool,
}

impl ClientHelloBuilder {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            random: [0u8; 32],
            session_id: Vec::new(),
            extra_extensions: Vec::new(),
            server_name_first: true,
        }
    }

    /// Fill random and session id from the thread RNG
    pub fn randomized(mut self) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        rng.fill(&mut self.random);
        self.session_id = vec![0u8; 32];
        rng.fill(&mut self.session_id[..]);
        self
    }

    pub fn session_id(mut self, id: &[u8]) -> Self {
        self.session_id = id.to_vec();
        self
    }

    /// Add an opaque extension; placed before server_name unless
    /// [`Self::server_name_last`] is used
    pub fn extension(mut self, ext_type: u16, data: &[u8]) -> Self {
        self.extra_extensions.push((ext_type, data.to_vec()));
        self
    }

    pub fn server_name_last(mut self) -> Self {
        self.server_name_first = false;
        self
    }

    /// Handshake message only (no record header), as carried in QUIC CRYPTO frames
    pub fn build_handshake(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(256);
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&self.random);
        body.push(self.session_id.len() as u8);
        body.extend_from_slice(&self.session_id);

        const SUITES: [u16; 5] = [0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f];
        body.extend_from_slice(&((SUITES.len() * 2) as u16).to_be_bytes());
        for suite in SUITES {
            body.extend_from_slice(&suite.to_be_bytes());
        }
        body.extend_from_slice(&[0x01, 0x00]);

        let mut extensions = Vec::new();
        let server_name = self.server_name_extension();
        if self.server_name_first {
            push_extension(&mut extensions, EXTENSION_SERVER_NAME, &server_name);
        }
        for (ext_type, data) in &self.extra_extensions {
            push_extension(&mut extensions, *ext_type, data);
        }
        // supported_versions: TLS 1.3
        push_extension(&mut extensions, 0x002b, &[0x02, 0x03, 0x04]);
        // supported_groups: x25519
        push_extension(&mut extensions, 0x000a, &[0x00, 0x02, 0x00, 0x1d]);
        if !self.server_name_first {
            push_extension(&mut extensions, EXTENSION_SERVER_NAME, &server_name);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::with_capacity(body.len() + HANDSHAKE_HEADER_LEN);
        handshake.push(HANDSHAKE_CLIENT_HELLO);
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);
        handshake
    }

    /// Full TLS record
    pub fn build(&self) -> Vec<u8> {
        let handshake = self.build_handshake();
        let mut record = Vec::with_capacity(handshake.len() + RECORD_HEADER_LEN);
        record.push(CONTENT_TYPE_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn server_name_extension(&self) -> Vec<u8> {
        let name = self.hostname.as_bytes();
        let mut ext = Vec::with_capacity(name.len() + 5);
        ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        ext.push(NAME_TYPE_HOST_NAME);
        ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        ext.extend_from_slice(name);
        ext
    }
}

fn push_extension(out: &mut Vec<u8>, ext_type: u16, data: &[u8]) {
    out.extend_from_slice(&ext_type.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}
