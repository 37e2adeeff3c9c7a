// src/request.rs
//
// One HTTP transaction's working state. Descriptors are large and
// requests are frequent, so they are heap-boxed, pooled per worker and
// recycled between transactions instead of reallocated.

use crate::handler::{AuthScheme, CacheEntry, Encoder, Handler, Validator};
use crate::header::{HeaderBlock, Method, Upgrade, Version};
use crate::resolver::{AccessLogger, BindInfo, CaptureSlots, ConfigEntry, Expiration, VirtualHost};
use crate::traffic::RateLimit;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle stage of one request. The single source of truth for
/// resumption: every suspension records nothing but this and the
/// buffers, and `Connection::advance` re-enters exactly here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Nothing,
    TlsHandshake,
    ReadingHeader,
    ProcessingHeader,
    SetupConnection,
    Init,
    ReadingPost,
    AddHeaders,
    SendHeaders,
    Stepping,
    Shutdown,
    Lingering,
}

/// Per-request option flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options(u32);

impl Options {
    pub const ROOT_INDEX: Options = Options(1 << 1);
    pub const TCP_CORK: Options = Options(1 << 2);
    pub const DOCUMENT_ROOT: Options = Options(1 << 3);
    pub const CANT_ENCODER: Options = Options(1 << 4);
    pub const GOT_EOF: Options = Options(1 << 5);
    pub const CHUNKED_FORMATTED: Options = Options(1 << 6);

    pub fn set(&mut self, flag: Options) {
        self.0 |= flag.0;
    }

    pub fn unset(&mut self, flag: Options) {
        self.0 &= !flag.0;
    }

    pub fn has(&self, flag: Options) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Content-Length framed body accumulator.
#[derive(Debug, Default)]
pub struct PostReader {
    expected: u64,
    received: u64,
    pub buffer: Vec<u8>,
}

impl PostReader {
    pub fn set_expected(&mut self, len: u64) {
        self.expected = len;
        self.received = 0;
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn remaining(&self) -> u64 {
        self.expected - self.received
    }

    pub fn complete(&self) -> bool {
        self.received >= self.expected
    }

    /// Feed body bytes; returns how many were consumed (the rest
    /// belongs to the next pipelined request).
    pub fn push(&mut self, data: &[u8]) -> usize {
        let take = (self.remaining() as usize).min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        self.received += take as u64;
        take
    }

    pub fn clean(&mut self) {
        self.expected = 0;
        self.received = 0;
        self.buffer.clear();
    }
}

/// Source of one pending scatter/gather segment. Resolved to a slice
/// only at write time so no self-borrow is stored across suspensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSeg {
    SizeLine,
    Payload,
    Trailer,
}

const CRLF: &[u8] = b"\r\n";

pub struct RequestDescriptor {
    // Non-owning back-references.
    pub conn_token: Option<usize>,
    pub worker_id: usize,
    pub vhost: Option<Arc<VirtualHost>>,
    pub bind: Option<Arc<BindInfo>>,
    pub entry: Option<Arc<ConfigEntry>>,

    /// Process-unique, stamped each time the descriptor is armed for a
    /// new transaction. Used for log correlation.
    pub id: u64,

    pub phase: Phase,
    pub options: Options,

    pub header_in: Vec<u8>,
    pub header_out: Vec<u8>,
    pub header: HeaderBlock,
    pub upgrade: Upgrade,

    // Path decomposition. `request_original`/`query_string_original`
    // survive internal rewrites for logging and redirects.
    pub local_directory: String,
    pub web_directory: String,
    pub request_path: String,
    pub pathinfo: String,
    pub userdir: String,
    pub query_string: String,
    pub arguments: HashMap<String, String>,
    pub host: String,
    pub host_port: String,
    pub effective_directory: String,
    pub request_original: String,
    pub query_string_original: String,

    pub handler: Option<Box<dyn Handler>>,
    pub encoder: Option<Box<dyn Encoder>>,
    pub encoder_buffer: Vec<u8>,
    pub logger: Option<Arc<dyn AccessLogger>>,
    pub validator: Option<Box<dyn Validator>>,
    pub auth_type: AuthScheme,
    pub req_auth_type: AuthScheme,

    pub post: PostReader,

    // -1 means unset.
    pub range_start: i64,
    pub range_end: i64,

    pub io_entry: Option<Arc<dyn CacheEntry>>,
    pub mmap_off: usize,
    pub mmap_len: usize,

    pub captures: CaptureSlots,
    pub host_captures: CaptureSlots,

    pub expiration: Expiration,
    pub expiration_time: u64,

    // Chunked-transfer state. `chunks`/`chunksn` describe the pending
    // segmented write; `chunked_sent` is the resume cursor across it.
    pub chunked_encoding: bool,
    pub chunked_last_package: bool,
    pub chunked_len: Vec<u8>,
    pub chunked_sent: usize,
    pub chunks: [ChunkSeg; 3],
    pub chunksn: u8,
    pub payload_from_encoder: bool,

    pub redirect: String,
    pub respins: u32,

    /// Handler-installed override; replaces the connection cap while
    /// enabled.
    pub limit: RateLimit,

    pub error_code: Option<u16>,
    pub error_internal_url: String,
    pub error_internal_qs: String,
    pub error_internal_code: u16,

    pub reply_status: u16,
    pub content_length: Option<u64>,
    pub step_buffer: Vec<u8>,
    pub header_sent: bool,
    pub keepalive_requested: bool,
    /// The built-in error handler is serving this request; a second
    /// failure can only close the connection.
    pub in_error_handler: bool,
}

impl RequestDescriptor {
    pub fn new() -> Self {
        Self {
            conn_token: None,
            worker_id: 0,
            vhost: None,
            bind: None,
            entry: None,
            id: 0,
            phase: Phase::Nothing,
            options: Options::default(),
            header_in: Vec::new(),
            header_out: Vec::new(),
            header: HeaderBlock::default(),
            upgrade: Upgrade::Nothing,
            local_directory: String::new(),
            web_directory: String::new(),
            request_path: String::new(),
            pathinfo: String::new(),
            userdir: String::new(),
            query_string: String::new(),
            arguments: HashMap::new(),
            host: String::new(),
            host_port: String::new(),
            effective_directory: String::new(),
            request_original: String::new(),
            query_string_original: String::new(),
            handler: None,
            encoder: None,
            encoder_buffer: Vec::new(),
            logger: None,
            validator: None,
            auth_type: AuthScheme::None,
            req_auth_type: AuthScheme::None,
            post: PostReader::default(),
            range_start: -1,
            range_end: -1,
            io_entry: None,
            mmap_off: 0,
            mmap_len: 0,
            captures: CaptureSlots::default(),
            host_captures: CaptureSlots::default(),
            expiration: Expiration::None,
            expiration_time: 0,
            chunked_encoding: false,
            chunked_last_package: false,
            chunked_len: Vec::new(),
            chunked_sent: 0,
            chunks: [ChunkSeg::Payload; 3],
            chunksn: 0,
            payload_from_encoder: false,
            redirect: String::new(),
            respins: 0,
            limit: RateLimit::default(),
            error_code: None,
            error_internal_url: String::new(),
            error_internal_qs: String::new(),
            error_internal_code: 0,
            reply_status: 200,
            content_length: None,
            step_buffer: Vec::new(),
            header_sent: false,
            keepalive_requested: true,
            in_error_handler: false,
        }
    }

    /// Stamp the descriptor for a new transaction on `conn_token`.
    /// Must be called on a clean descriptor.
    pub fn arm(&mut self, worker_id: usize, conn_token: Option<usize>) {
        debug_assert_eq!(self.phase, Phase::Nothing);
        self.id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        self.worker_id = worker_id;
        self.conn_token = conn_token;
    }

    /// Return to the empty state for reuse, keeping buffer capacity.
    /// Idempotent; required before the descriptor goes back to a pool.
    pub fn clean(&mut self) {
        self.conn_token = None;
        self.worker_id = 0;
        self.vhost = None;
        self.bind = None;
        self.entry = None;
        self.phase = Phase::Nothing;
        self.options.clear();
        self.header_in.clear();
        self.header_out.clear();
        self.header.clean();
        self.upgrade = Upgrade::Nothing;
        self.local_directory.clear();
        self.web_directory.clear();
        self.request_path.clear();
        self.pathinfo.clear();
        self.userdir.clear();
        self.query_string.clear();
        self.arguments.clear();
        self.host.clear();
        self.host_port.clear();
        self.effective_directory.clear();
        self.request_original.clear();
        self.query_string_original.clear();
        self.handler = None;
        self.encoder = None;
        self.encoder_buffer.clear();
        self.logger = None;
        self.validator = None;
        self.auth_type = AuthScheme::None;
        self.req_auth_type = AuthScheme::None;
        self.post.clean();
        self.range_start = -1;
        self.range_end = -1;
        self.io_entry = None;
        self.mmap_off = 0;
        self.mmap_len = 0;
        self.captures.clean();
        self.host_captures.clean();
        self.expiration = Expiration::None;
        self.expiration_time = 0;
        self.chunked_encoding = false;
        self.chunked_last_package = false;
        self.chunked_len.clear();
        self.chunked_sent = 0;
        self.chunksn = 0;
        self.payload_from_encoder = false;
        self.redirect.clear();
        self.respins = 0;
        self.limit.clean();
        self.error_code = None;
        self.error_internal_url.clear();
        self.error_internal_qs.clear();
        self.error_internal_code = 0;
        self.reply_status = 200;
        self.content_length = None;
        self.step_buffer.clear();
        self.header_sent = false;
        self.keepalive_requested = true;
        self.in_error_handler = false;
    }

    /// Partial reset for an internal re-dispatch: routing and reply
    /// state go, the parsed request and original path stay, and the
    /// respin counter ticks up.
    pub fn clean_for_respin(&mut self) {
        if self.request_original.is_empty() {
            self.request_original = self.request_path.clone();
            self.query_string_original = self.query_string.clone();
        }
        self.vhost = None;
        self.entry = None;
        self.handler = None;
        self.encoder = None;
        self.encoder_buffer.clear();
        self.validator = None;
        self.auth_type = AuthScheme::None;
        self.header_out.clear();
        self.local_directory.clear();
        self.web_directory.clear();
        self.pathinfo.clear();
        self.effective_directory.clear();
        self.io_entry = None;
        self.mmap_off = 0;
        self.mmap_len = 0;
        self.expiration = Expiration::None;
        self.expiration_time = 0;
        self.chunked_encoding = false;
        self.chunked_last_package = false;
        self.chunked_len.clear();
        self.chunked_sent = 0;
        self.chunksn = 0;
        self.payload_from_encoder = false;
        self.redirect.clear();
        self.reply_status = 200;
        self.content_length = None;
        self.step_buffer.clear();
        self.options.unset(Options::ROOT_INDEX);
        self.options.unset(Options::DOCUMENT_ROOT);
        self.options.unset(Options::CHUNKED_FORMATTED);
        self.in_error_handler = false;
        self.respins += 1;
    }

    /// Install the built-in error page handler for the recorded error
    /// code, discarding any half-composed reply. The request then
    /// re-enters the pipeline at `init` and flows out through
    /// `send_headers` like any other response.
    pub fn setup_error_handler(&mut self) {
        let code = self.error_code.unwrap_or(500);
        self.header_out.clear();
        self.encoder = None;
        self.encoder_buffer.clear();
        self.chunked_encoding = false;
        self.content_length = None;
        self.io_entry = None;
        self.mmap_off = 0;
        self.mmap_len = 0;
        self.expiration = Expiration::None;
        self.reply_status = code;

        if code == 401 {
            if let Some(realm) = self.entry.as_ref().and_then(|e| e.auth_realm.clone()) {
                let scheme = match self.entry.as_ref().map(|e| e.auth_type).unwrap_or_default() {
                    AuthScheme::Digest => "Digest",
                    _ => "Basic",
                };
                let _ = write!(
                    ResponseWriter(&mut self.header_out),
                    "WWW-Authenticate: {} realm=\"{}\"\r\n",
                    scheme, realm,
                );
            }
        }

        self.handler = Some(Box::new(crate::handler::ErrorPageHandler::new(code)));
        self.in_error_handler = true;
        self.phase = Phase::Init;
    }

    /// Rewrite the request to an internal target (error document,
    /// directory index) and re-enter routing. Preserves the redirect
    /// context so the target handler sees where it came from.
    pub fn internal_redirect(&mut self, url: &str, code: u16) {
        self.error_internal_url.clear();
        self.error_internal_url.push_str(url);
        self.error_internal_qs.clear();
        self.error_internal_qs.push_str(&self.query_string.clone());
        self.error_internal_code = code;

        self.clean_for_respin();
        self.request_path.clear();
        self.request_path.push_str(url);
        self.query_string.clear();
        self.error_code = None;
        self.phase = Phase::SetupConnection;
    }

    // ---- Header interpretation ----

    /// Populate the decomposed fields from the parsed header block.
    /// Runs in `processing_header`, synchronously.
    pub fn process_header(&mut self) -> Result<(), u16> {
        self.request_path.clear();
        self.request_path.push_str(&self.header.path);
        self.query_string.clear();
        if let Some(q) = &self.header.query {
            self.query_string.push_str(q);
        }
        if self.request_original.is_empty() {
            self.request_original = self.request_path.clone();
            self.query_string_original = self.query_string.clone();
        }
        if self.request_path == "/" {
            self.options.set(Options::ROOT_INDEX);
        }

        // Host / host:port, falling back to the bind address.
        self.host.clear();
        self.host_port.clear();
        if let Some(host) = self.header.get("Host") {
            if host.is_empty() {
                return Err(400);
            }
            match host.rsplit_once(':') {
                Some((name, port))
                    if !name.is_empty()
                        && !port.is_empty()
                        && port.bytes().all(|b| b.is_ascii_digit()) =>
                {
                    self.host.push_str(name);
                    self.host_port.push_str(host);
                }
                // A trailing colon with no port is dropped.
                Some((name, "")) if !name.is_empty() => {
                    self.host.push_str(name);
                    self.host_port.push_str(name);
                    if let Some(bind) = &self.bind {
                        let _ = write!(self.host_port, ":{}", bind.port);
                    }
                }
                _ => {
                    self.host.push_str(host);
                    self.host_port.push_str(host);
                    if let Some(bind) = &self.bind {
                        let _ = write!(self.host_port, ":{}", bind.port);
                    }
                }
            }
        } else {
            if self.header.version == Version::Http11 {
                // Host is mandatory in 1.1.
                return Err(400);
            }
            if let Some(bind) = &self.bind {
                self.host.push_str(&bind.addr);
                let _ = write!(self.host_port, "{}:{}", bind.addr, bind.port);
            }
        }

        // Keep-alive request. 1.1 defaults on, 1.0 defaults off.
        self.keepalive_requested = match self.header.get("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            Some(v) if v.to_ascii_lowercase().contains("upgrade") => {
                self.upgrade = match self.header.get("Upgrade") {
                    Some(u) if u.eq_ignore_ascii_case("websocket") => Upgrade::WebSocket,
                    Some(_) => Upgrade::Other,
                    None => Upgrade::Nothing,
                };
                true
            }
            Some(_) => self.header.version == Version::Http11,
            None => self.header.version == Version::Http11,
        };

        // Body framing.
        if let Some(len) = self.header.get("Content-Length") {
            let len: u64 = len.trim().parse().map_err(|_| 400u16)?;
            self.post.set_expected(len);
        } else if self.header.get("Transfer-Encoding").is_some() {
            // Chunked request bodies are not handled by this engine.
            return Err(411);
        }

        self.parse_userdir();
        self.parse_range()?;
        Ok(())
    }

    /// `/~user/...` detection; records the user component and strips
    /// it from the routed path.
    fn parse_userdir(&mut self) {
        self.userdir.clear();
        let Some(rest) = self.request_path.strip_prefix("/~") else {
            return;
        };
        let (user, tail) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if user.is_empty() {
            return;
        }
        self.userdir.push_str(user);
        self.request_path = tail.to_string();
    }

    /// `Range: bytes=a-b` (also `a-` and `-b`). Multi-range is not
    /// supported and is ignored rather than rejected.
    fn parse_range(&mut self) -> Result<(), u16> {
        let Some(value) = self.header.get("Range") else {
            return Ok(());
        };
        let Some(spec) = value.trim().strip_prefix("bytes=") else {
            return Ok(());
        };
        if spec.contains(',') {
            return Ok(());
        }
        let Some((start, end)) = spec.split_once('-') else {
            return Err(416);
        };
        let start = start.trim();
        let end = end.trim();
        if !start.is_empty() {
            self.range_start = start.parse::<i64>().map_err(|_| 416u16)?;
            if self.range_start < 0 {
                return Err(416);
            }
        }
        if !end.is_empty() {
            self.range_end = end.parse::<i64>().map_err(|_| 416u16)?;
            if self.range_end < 0 {
                return Err(416);
            }
        }
        if self.range_start < 0 && self.range_end < 0 {
            return Err(416);
        }
        if self.range_start >= 0 && self.range_end >= 0 && self.range_end < self.range_start {
            return Err(416);
        }
        Ok(())
    }

    /// Decode the query string into the arguments map. Parsed on
    /// demand; repeated calls are cheap no-ops once filled.
    pub fn parse_arguments(&mut self) {
        if !self.arguments.is_empty() || self.query_string.is_empty() {
            return;
        }
        for pair in self.query_string.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            self.arguments.insert(url_decode(k), url_decode(v));
        }
    }

    // ---- Reply composition ----

    /// 1xx/204/304 replies and HEAD requests carry no body, so no
    /// length or chunk framing either.
    pub fn should_include_length(&self) -> bool {
        if self.header.method == Method::Head {
            return false;
        }
        !matches!(self.reply_status, 100..=199 | 204 | 304)
    }

    /// Decide chunked framing once, while headers are being composed.
    /// Fixed for the remainder of the response.
    pub fn set_chunked_encoding(&mut self) {
        self.chunked_encoding = self.header.version == Version::Http11
            && self.content_length.is_none()
            && self.should_include_length();
    }

    /// Serialize the response head. The body rides along later (or,
    /// for a small mapped region, in the same writev).
    pub fn render_response_head(&mut self, keepalive: bool, out: &mut Vec<u8>) {
        let _ = write!(
            ResponseWriter(out),
            "HTTP/1.{} {} {}\r\n",
            if self.header.version == Version::Http10 { '0' } else { '1' },
            self.reply_status,
            crate::header::reason_phrase(self.reply_status),
        );
        let _ = write!(
            ResponseWriter(out),
            "Date: {}\r\nServer: ravel\r\n",
            httpdate::fmt_http_date(SystemTime::now()),
        );

        if self.chunked_encoding {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        } else if let Some(len) = self.content_length {
            if self.should_include_length() || self.header.method == Method::Head {
                let _ = write!(ResponseWriter(out), "Content-Length: {}\r\n", len);
            }
        }

        if keepalive {
            out.extend_from_slice(b"Connection: keep-alive\r\n");
        } else {
            out.extend_from_slice(b"Connection: close\r\n");
        }

        self.add_expiration_header(out);
        out.extend_from_slice(&self.header_out);
        out.extend_from_slice(CRLF);
    }

    fn add_expiration_header(&self, out: &mut Vec<u8>) {
        match self.expiration {
            Expiration::None => {}
            Expiration::Epoch => {
                out.extend_from_slice(b"Expires: Thu, 01 Jan 1970 00:00:01 GMT\r\n");
                out.extend_from_slice(b"Cache-Control: no-cache\r\n");
            }
            Expiration::Max => {
                // One year, the RFC-suggested ceiling.
                let exp = SystemTime::now() + Duration::from_secs(365 * 24 * 3600);
                let _ = write!(
                    ResponseWriter(out),
                    "Expires: {}\r\nCache-Control: max-age=31536000\r\n",
                    httpdate::fmt_http_date(exp),
                );
            }
            Expiration::Secs(secs) => {
                let exp = SystemTime::now() + Duration::from_secs(secs);
                let _ = write!(
                    ResponseWriter(out),
                    "Expires: {}\r\nCache-Control: max-age={}\r\n",
                    httpdate::fmt_http_date(exp),
                    secs,
                );
            }
        }
    }

    // ---- Outbound segment queue ----

    /// Frame one body chunk for chunked transfer: size line, payload,
    /// trailing CRLF, written as one scatter/gather unit.
    pub fn queue_chunk(&mut self, payload_len: usize, from_encoder: bool) {
        self.chunked_len.clear();
        let _ = write!(ResponseWriter(&mut self.chunked_len), "{:x}\r\n", payload_len);
        self.chunks = [ChunkSeg::SizeLine, ChunkSeg::Payload, ChunkSeg::Trailer];
        self.chunksn = 3;
        self.chunked_sent = 0;
        self.payload_from_encoder = from_encoder;
        self.options.set(Options::CHUNKED_FORMATTED);
    }

    /// Queue an unframed payload write (identity transfer).
    pub fn queue_raw(&mut self, from_encoder: bool) {
        self.chunks[0] = ChunkSeg::Payload;
        self.chunksn = 1;
        self.chunked_sent = 0;
        self.payload_from_encoder = from_encoder;
    }

    /// Queue the terminating zero-length chunk.
    pub fn queue_last_chunk(&mut self) {
        self.chunked_len.clear();
        self.chunked_len.extend_from_slice(b"0\r\n\r\n");
        self.chunks[0] = ChunkSeg::SizeLine;
        self.chunksn = 1;
        self.chunked_sent = 0;
        self.chunked_last_package = true;
        self.options.set(Options::CHUNKED_FORMATTED);
    }

    pub fn seg_bytes(&self, seg: ChunkSeg) -> &[u8] {
        match seg {
            ChunkSeg::SizeLine => &self.chunked_len,
            ChunkSeg::Payload => {
                if self.payload_from_encoder {
                    &self.encoder_buffer
                } else {
                    &self.step_buffer
                }
            }
            ChunkSeg::Trailer => CRLF,
        }
    }

    pub fn pending_total(&self) -> usize {
        (0..self.chunksn as usize)
            .map(|i| self.seg_bytes(self.chunks[i]).len())
            .sum()
    }

    pub fn has_pending_write(&self) -> bool {
        self.chunksn > 0 && self.chunked_sent < self.pending_total()
    }

    pub fn clear_pending_write(&mut self) {
        self.chunksn = 0;
        self.chunked_sent = 0;
        self.options.unset(Options::CHUNKED_FORMATTED);
    }
}

impl Default for RequestDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

// Vec<u8> sink for write!; header text is always ASCII.
struct ResponseWriter<'a>(&'a mut Vec<u8>);

impl std::fmt::Write for ResponseWriter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
