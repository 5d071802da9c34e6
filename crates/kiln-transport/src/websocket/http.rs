//! The slice of HTTP/1.1 needed for the WebSocket opening handshake.

use std::collections::HashMap;
use std::fmt;

/// Request methods recognised by the handshake parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Options,
    Head,
    Unknown,
}

impl Method {
    fn parse(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "HEAD" => Self::Head,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Head => "HEAD",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Why a request could not be accepted. Carries the HTTP status to answer
/// with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub message: &'static str,
}

impl Rejection {
    pub const fn new(status: u16, message: &'static str) -> Self {
        Self { status, message }
    }

    /// The full HTTP response for this rejection.
    pub fn to_response(&self) -> Vec<u8> {
        error_response(self.status, self.message)
    }
}

const MALFORMED: Rejection = Rejection::new(500, "Malformed URL.");
const BAD_REQUEST: Rejection = Rejection::new(400, "Bad request.");

/// A parsed request head. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub version: String,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
}

impl HttpRequest {
    /// Parses the request head (everything before the blank line).
    pub fn parse(head: &[u8]) -> Result<Self, Rejection> {
        if head.contains(&0) {
            return Err(MALFORMED);
        }
        let text = std::str::from_utf8(head).map_err(|_| BAD_REQUEST)?;
        if text.contains("%0") {
            return Err(MALFORMED);
        }

        let mut lines = text.lines();
        let request_line = lines.next().ok_or(BAD_REQUEST)?;
        let mut parts = request_line.split(' ');
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(BAD_REQUEST);
        };

        let mut headers = HashMap::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(": ").ok_or(BAD_REQUEST)?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        let cookies = headers
            .get("cookie")
            .map(|raw| parse_cookies(raw))
            .unwrap_or_default();

        Ok(Self {
            method: Method::parse(method),
            path: path.to_string(),
            version: version.to_string(),
            headers,
            cookies,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// `true` if `name` holds `token` as one of its comma-separated values.
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    /// Checks everything the upgrade requires and returns the client key.
    pub fn validate_upgrade(&self) -> Result<&str, Rejection> {
        if self.version != "HTTP/1.1" {
            return Err(Rejection::new(505, "HTTP version not supported."));
        }
        match self.method {
            Method::Get => {}
            Method::Unknown => return Err(Rejection::new(501, "Method not implemented.")),
            _ => return Err(Rejection::new(405, "Method not allowed.")),
        }
        if self
            .header("content-length")
            .is_some_and(|len| len.trim() != "0")
        {
            return Err(Rejection::new(413, "Request bodies are not accepted."));
        }
        if !self.header_has_token("upgrade", "websocket")
            || !self.header_has_token("connection", "upgrade")
        {
            return Err(BAD_REQUEST);
        }
        match self.header("sec-websocket-key") {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(BAD_REQUEST),
        }
    }

    /// The forwarded client address, without any port suffix.
    pub fn forwarded_for(&self) -> Option<&str> {
        let value = self.header("x-forwarded-for")?;
        let first = value.split(',').next()?.trim();
        let address = first.split(':').next()?.trim();
        (!address.is_empty()).then_some(address)
    }
}

fn parse_cookies(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Finds the end of the request head. Returns the offset of the
/// terminator and its length; both `\r\n\r\n` and `\n\n` are accepted and
/// the earliest wins.
pub fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    let crlf = data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    let lf = data.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn status_text(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        400 => "Bad Request",
        401 => "Unauthorized",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        505 => "HTTP Version Not Supported",
        _ => "Error",
    }
}

/// An HTML error page with a correct `Content-Length`.
pub fn error_response(code: u16, message: &str) -> Vec<u8> {
    let body = format!(
        "<!DOCTYPE html><html><head><title>Error</title></head><body><h2>{message}</h2></body></html>"
    );
    format!(
        "HTTP/1.1 {code} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        status_text(code),
        body.len()
    )
    .into_bytes()
}

/// The `101` response completing the upgrade.
pub fn switching_protocols(accept: &str, protocol: Option<&str>) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(protocol) = protocol {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(protocol);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.into_bytes()
}
