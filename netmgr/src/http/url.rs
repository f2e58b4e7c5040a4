//! URL handling for the DoH transport: endpoint URL parsing, the `dns`
//! query-parameter grammar, and the base64url/base64 conversions.

use std::net::{IpAddr, SocketAddr};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::errors::{NmError, NmResult};

/// URL scheme; determines TLS usage and the default port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(self) -> bool {
        self == Scheme::Https
    }
}

/// A parsed `scheme://host[:port]/path?query` endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

impl Url {
    /// Parse an endpoint URL. Hosts are IPv4 literals or bracketed IPv6
    /// literals; the core never resolves names.
    pub fn parse(input: &str) -> NmResult<Url> {
        let (scheme, rest) = if let Some(rest) = input.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = input.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return Err(NmError::Failure);
        };

        let (authority, path_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(NmError::Failure);
        }

        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let end = v6.find(']').ok_or(NmError::Failure)?;
            let host = &v6[..end];
            let port = match &v6[end + 1..] {
                "" => scheme.default_port(),
                p => p
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or(NmError::Failure)?,
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (
                    host.to_string(),
                    port.parse().map_err(|_| NmError::Failure)?,
                ),
                None => (authority.to_string(), scheme.default_port()),
            }
        };
        if host.is_empty() {
            return Err(NmError::Failure);
        }

        let (path, query) = match path_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_query.to_string(), None),
        };

        Ok(Url {
            scheme,
            host,
            port,
            path,
            query,
        })
    }

    /// The socket address, when the host is an IP literal.
    pub fn socket_addr(&self) -> NmResult<SocketAddr> {
        let ip: IpAddr = self.host.parse().map_err(|_| NmError::Failure)?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// `host[:port]` for the `:authority` pseudo-header; the port is
    /// omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// Extract the value of the `dns` query parameter.
///
/// The query string may start with or without a leading `?`. Parameters
/// are `name=value` pairs separated by `&`; percent escapes must be two
/// hexadecimal digits, any violation fails the whole parse, an empty
/// value fails its pair, and when several `dns=` parameters are present
/// the last one wins.
pub fn parse_http_query(query: &str) -> Option<&str> {
    let mut parser = QueryParser::new(query.as_bytes());
    if !parser.query_string() || !parser.found {
        return None;
    }
    query.get(parser.value_start..parser.value_end)
}

struct QueryParser<'a> {
    input: &'a [u8],
    pos: usize,
    found: bool,
    value_start: usize,
    value_end: usize,
}

impl<'a> QueryParser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            found: false,
            value_start: 0,
            value_end: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn eat(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn query_string(&mut self) -> bool {
        self.eat(b'?');
        while self.key_value_pair() {}
        // The whole input must have been consumed.
        self.pos == self.input.len()
    }

    fn key_value_pair(&mut self) -> bool {
        let Some((key_start, key_end)) = self.key() else {
            return false;
        };
        if !self.eat(b'=') {
            return false;
        }
        let Some((value_start, value_end)) = self.value() else {
            return false;
        };

        if &self.input[key_start..key_end] == b"dns" {
            self.found = true;
            self.value_start = value_start;
            self.value_end = value_end;
        }

        self.eat(b'&');
        true
    }

    fn key(&mut self) -> Option<(usize, usize)> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c == b'_' || c.is_ascii_alphabetic() => self.pos += 1,
            _ => return None,
        }
        while matches!(self.peek(), Some(c) if c == b'_' || c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        Some((start, self.pos))
    }

    fn value(&mut self) -> Option<(usize, usize)> {
        let start = self.pos;
        if !self.value_char() {
            return None;
        }
        while self.value_char() {}
        Some((start, self.pos))
    }

    fn value_char(&mut self) -> bool {
        self.unreserved_char() || self.percent_charcode()
    }

    fn unreserved_char(&mut self) -> bool {
        match self.peek() {
            Some(c) if c.is_ascii_alphanumeric() || matches!(c, b'_' | b'.' | b'-' | b'~') => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn percent_charcode(&mut self) -> bool {
        if !self.eat(b'%') {
            return false;
        }
        for _ in 0..2 {
            match self.peek() {
                Some(c) if c.is_ascii_hexdigit() => self.pos += 1,
                _ => return false,
            }
        }
        true
    }
}

/// Decode `%HH` escapes; used on the `dns` parameter value before the
/// base64url conversion.
pub fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1)?.to_ascii_uppercase();
            let lo = bytes.get(i + 2)?.to_ascii_uppercase();
            let hex = |c: u8| -> Option<u8> {
                match c {
                    b'0'..=b'9' => Some(c - b'0'),
                    b'A'..=b'F' => Some(c - b'A' + 10),
                    _ => None,
                }
            };
            out.push(hex(hi)? * 16 + hex(lo)?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Convert base64url to base64: `-`→`+`, `_`→`/`, and `=` padding
/// appended to a multiple of four. Empty input, `=`, `%`, or any octet
/// outside the base64url alphabet is rejected.
pub fn base64url_to_base64(input: &str) -> Option<String> {
    if input.is_empty() {
        return None;
    }
    let mut out = String::with_capacity(input.len() + 3);
    for ch in input.chars() {
        match ch {
            '-' => out.push('+'),
            '_' => out.push('/'),
            c if c.is_ascii_alphanumeric() => out.push(c),
            _ => return None,
        }
    }
    while out.len() % 4 != 0 {
        out.push('=');
    }
    Some(out)
}

/// Convert base64 to base64url: `+`→`-`, `/`→`_`, padding stripped.
/// Empty input, `-`, `_`, or any octet outside the base64 alphabet is
/// rejected.
pub fn base64_to_base64url(input: &str) -> Option<String> {
    if input.is_empty() {
        return None;
    }
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '+' => out.push('-'),
            '/' => out.push('_'),
            // Padding only appears at the end; everything after the first
            // '=' must also be padding.
            '=' => break,
            c if c.is_ascii_alphanumeric() => out.push(c),
            _ => return None,
        }
    }
    Some(out)
}

/// Decode a `dns=` parameter value (possibly percent-encoded base64url)
/// into the raw DNS message bytes.
pub fn decode_dns_param(value: &str) -> NmResult<Vec<u8>> {
    let decoded = percent_decode(value).ok_or(NmError::InvalidProto)?;
    let b64 = base64url_to_base64(&decoded).ok_or(NmError::InvalidProto)?;
    BASE64.decode(b64.as_bytes()).map_err(|_| NmError::InvalidProto)
}

/// Encode a DNS message for a GET request's `dns` parameter.
pub fn encode_dns_param(body: &[u8]) -> Option<String> {
    base64_to_base64url(&BASE64.encode(body))
}
