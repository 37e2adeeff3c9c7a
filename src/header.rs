// src/header.rs
//
// Minimal request-head parsing: just enough splitting to drive the
// phase machine. Routing, validation and body semantics live above.

use memchr::memmem;

pub const MAX_HEADERS: usize = 64;
pub const MAX_HEADER_LEN: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

/// Upgrade-protocol indicator from `Connection: upgrade`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Upgrade {
    #[default]
    Nothing,
    WebSocket,
    Other,
}

/// Owned, parsed request head. Reused across transactions: `clean`
/// truncates but keeps allocations.
#[derive(Debug, Default)]
pub struct HeaderBlock {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    headers: Vec<(String, String)>,
}

impl Default for Method {
    fn default() -> Self {
        Method::Unknown
    }
}

impl HeaderBlock {
    /// Case-insensitive single-header lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn clean(&mut self) {
        self.method = Method::Unknown;
        self.path.clear();
        self.query = None;
        self.version = Version::Http11;
        self.headers.clear();
    }
}

#[derive(Debug)]
pub enum Parse {
    /// Head parsed; `usize` is the number of bytes consumed (through
    /// the blank line). Anything after belongs to the body or to the
    /// next pipelined request.
    Complete(HeaderBlock, usize),
    Incomplete,
    Malformed,
}

/// Parse one request head out of `buf`. Incomplete until the
/// `\r\n\r\n` terminator is present.
pub fn parse(buf: &[u8]) -> Parse {
    let Some(end) = memmem::find(buf, b"\r\n\r\n") else {
        return if buf.len() > MAX_HEADER_LEN {
            Parse::Malformed
        } else {
            Parse::Incomplete
        };
    };
    let consumed = end + 4;
    let head = &buf[..end];

    let mut lines = head.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    let Some(request_line) = lines.next() else {
        return Parse::Malformed;
    };
    let mut parts = request_line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let (Some(method_b), Some(target_b), Some(version_b)) = (parts.next(), parts.next(), parts.next())
    else {
        return Parse::Malformed;
    };
    if parts.next().is_some() {
        return Parse::Malformed;
    }

    let method = Method::from_bytes(method_b);
    let version = match version_b {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        _ => return Parse::Malformed,
    };

    let Ok(target) = std::str::from_utf8(target_b) else {
        return Parse::Malformed;
    };
    let (path, query) = match target.find('?') {
        Some(idx) => (target[..idx].to_string(), Some(target[idx + 1..].to_string())),
        None => (target.to_string(), None),
    };
    if path.is_empty() {
        return Parse::Malformed;
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if headers.len() >= MAX_HEADERS {
            return Parse::Malformed;
        }
        let Some(colon) = memchr::memchr(b':', line) else {
            return Parse::Malformed;
        };
        let (Ok(name), Ok(value)) = (
            std::str::from_utf8(&line[..colon]),
            std::str::from_utf8(&line[colon + 1..]),
        ) else {
            return Parse::Malformed;
        };
        if name.is_empty() || name.contains(' ') {
            return Parse::Malformed;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Parse::Complete(
        HeaderBlock {
            method,
            path,
            query,
            version,
            headers,
        },
        consumed,
    )
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        416 => "Range Not Satisfiable",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
