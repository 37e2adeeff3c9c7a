// src/handler.rs
//
// Collaborator contracts: content handlers, output encoders and
// authentication validators. All object-safe; the engine stores them
// boxed on the request descriptor and releases them on `clean`.

use crate::request::RequestDescriptor;
use std::sync::Arc;

/// Outcome of handler initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Done,
    /// More I/O needed (e.g. opening a backend); re-entered on the
    /// next readiness event.
    Suspend,
}

/// Outcome of one body-production step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Bytes were appended to the output buffer.
    Data,
    /// Body complete.
    Done,
    /// No data available yet; re-entered on readiness.
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthScheme {
    #[default]
    None,
    Basic,
    Digest,
}

/// Produces response bytes for one request. Errors are HTTP status
/// codes; the engine reroutes them through the error-handler path.
pub trait Handler: Send {
    fn init(&mut self, req: &mut RequestDescriptor) -> Result<HandlerState, u16>;

    /// Contribute status, length and extra header lines. Synchronous.
    fn add_headers(&mut self, req: &mut RequestDescriptor);

    /// Produce the next chunk of body bytes into `out`.
    fn step(&mut self, req: &mut RequestDescriptor, out: &mut Vec<u8>) -> Result<Step, u16>;
}

pub trait HandlerFactory: Send + Sync {
    fn create(&self, req: &RequestDescriptor) -> Box<dyn Handler>;
}

/// Transforms output bytes (gzip and friends). Selecting an encoder
/// makes the content length unknown, which forces chunked framing.
pub trait Encoder: Send {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), u16>;
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), u16>;
}

pub trait EncoderFactory: Send + Sync {
    fn create(&self) -> Box<dyn Encoder>;
}

pub trait Validator: Send {
    fn authenticate(
        &mut self,
        scheme: AuthScheme,
        credentials: &str,
        req: &RequestDescriptor,
    ) -> Verdict;
}

pub trait ValidatorFactory: Send + Sync {
    fn create(&self) -> Box<dyn Validator>;
}

/// An entry in the I/O cache: stable bytes the engine may reference
/// for the lifetime of the request (mmap'd file, cached body).
pub trait CacheEntry: Send + Sync {
    fn bytes(&self) -> &[u8];
}

// Body rides the header writev when it fits; larger entries stream
// through `step` in fixed slices.
const MMAP_SEND_MAX: usize = 32 * 1024;
const STEP_SLICE: usize = 16 * 1024;

/// Serves a cache entry, honoring single-range requests. The default
/// production handler for static content.
pub struct ContentHandler {
    entry: Arc<dyn CacheEntry>,
    content_type: Option<&'static str>,
    start: usize,
    len: usize,
    cursor: usize,
    ranged: bool,
}

impl ContentHandler {
    pub fn new(entry: Arc<dyn CacheEntry>) -> Self {
        Self {
            entry,
            content_type: None,
            start: 0,
            len: 0,
            cursor: 0,
            ranged: false,
        }
    }

    pub fn with_content_type(mut self, ct: &'static str) -> Self {
        self.content_type = Some(ct);
        self
    }
}

pub struct ContentHandlerFactory {
    entry: Arc<dyn CacheEntry>,
    content_type: Option<&'static str>,
}

impl ContentHandlerFactory {
    pub fn new(entry: Arc<dyn CacheEntry>) -> Self {
        Self {
            entry,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, ct: &'static str) -> Self {
        self.content_type = Some(ct);
        self
    }
}

impl HandlerFactory for ContentHandlerFactory {
    fn create(&self, _req: &RequestDescriptor) -> Box<dyn Handler> {
        let mut h = ContentHandler::new(self.entry.clone());
        h.content_type = self.content_type;
        Box::new(h)
    }
}

impl Handler for ContentHandler {
    fn init(&mut self, req: &mut RequestDescriptor) -> Result<HandlerState, u16> {
        let total = self.entry.bytes().len();

        // Resolve the byte range against the entry size.
        let (start, end) = match (req.range_start, req.range_end) {
            (-1, -1) => (0, total),
            (-1, suffix) => {
                let suffix = suffix as usize;
                (total.saturating_sub(suffix), total)
            }
            (start, -1) => {
                if start as usize >= total {
                    return Err(416);
                }
                (start as usize, total)
            }
            (start, end) => {
                if start as usize >= total {
                    return Err(416);
                }
                (start as usize, ((end as usize) + 1).min(total))
            }
        };
        self.start = start;
        self.len = end - start;
        self.cursor = 0;
        self.ranged = req.range_start >= 0 || req.range_end >= 0;

        if self.len <= MMAP_SEND_MAX {
            req.io_entry = Some(self.entry.clone());
            req.mmap_off = self.start;
            req.mmap_len = self.len;
            self.cursor = self.len;
        }
        Ok(HandlerState::Done)
    }

    fn add_headers(&mut self, req: &mut RequestDescriptor) {
        let total = self.entry.bytes().len();
        req.reply_status = if self.ranged { 206 } else { 200 };
        req.content_length = Some(self.len as u64);
        if let Some(ct) = self.content_type {
            req.header_out.extend_from_slice(b"Content-Type: ");
            req.header_out.extend_from_slice(ct.as_bytes());
            req.header_out.extend_from_slice(b"\r\n");
        }
        if self.ranged {
            use std::fmt::Write as _;
            let mut line = String::new();
            let _ = write!(
                line,
                "Content-Range: bytes {}-{}/{}\r\n",
                self.start,
                self.start + self.len.saturating_sub(1),
                total
            );
            req.header_out.extend_from_slice(line.as_bytes());
        }
    }

    fn step(&mut self, _req: &mut RequestDescriptor, out: &mut Vec<u8>) -> Result<Step, u16> {
        if self.cursor >= self.len {
            return Ok(Step::Done);
        }
        let from = self.start + self.cursor;
        let take = (self.len - self.cursor).min(STEP_SLICE);
        out.extend_from_slice(&self.entry.bytes()[from..from + take]);
        self.cursor += take;
        Ok(Step::Data)
    }
}

/// Built-in error document: a small HTML page for the recorded status.
/// Installed by the error-handler setup path when no custom error
/// document applies (or the respin budget is spent).
pub struct ErrorPageHandler {
    status: u16,
    body: Vec<u8>,
    sent: bool,
}

impl ErrorPageHandler {
    pub fn new(status: u16) -> Self {
        let reason = crate::header::reason_phrase(status);
        let body = format!(
            "<!DOCTYPE html><html><head><title>{status} {reason}</title></head>\
             <body><h1>{status} {reason}</h1><hr><p>ravel</p></body></html>\n"
        )
        .into_bytes();
        Self {
            status,
            body,
            sent: false,
        }
    }
}

impl Handler for ErrorPageHandler {
    fn init(&mut self, _req: &mut RequestDescriptor) -> Result<HandlerState, u16> {
        Ok(HandlerState::Done)
    }

    fn add_headers(&mut self, req: &mut RequestDescriptor) {
        req.reply_status = self.status;
        req.content_length = Some(self.body.len() as u64);
        req.header_out
            .extend_from_slice(b"Content-Type: text/html\r\n");
    }

    fn step(&mut self, _req: &mut RequestDescriptor, out: &mut Vec<u8>) -> Result<Step, u16> {
        if self.sent {
            return Ok(Step::Done);
        }
        out.extend_from_slice(&self.body);
        self.sent = true;
        Ok(Step::Data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bytes(Vec<u8>);
    impl CacheEntry for Bytes {
        fn bytes(&self) -> &[u8] {
            &self.0
        }
    }

    #[test]
    fn content_handler_small_body_rides_mmap() {
        let entry: Arc<dyn CacheEntry> = Arc::new(Bytes(b"hello world".to_vec()));
        let mut h = ContentHandler::new(entry);
        let mut req = RequestDescriptor::new();
        assert_eq!(h.init(&mut req), Ok(HandlerState::Done));
        assert_eq!(req.mmap_len, 11);
        h.add_headers(&mut req);
        assert_eq!(req.reply_status, 200);
        assert_eq!(req.content_length, Some(11));
        // body already mapped, nothing left to step
        let mut out = Vec::new();
        assert_eq!(h.step(&mut req, &mut out), Ok(Step::Done));
        assert!(out.is_empty());
    }

    #[test]
    fn content_handler_range() {
        let entry: Arc<dyn CacheEntry> = Arc::new(Bytes((0u8..100).collect()));
        let mut h = ContentHandler::new(entry);
        let mut req = RequestDescriptor::new();
        req.range_start = 10;
        req.range_end = 19;
        h.init(&mut req).unwrap();
        h.add_headers(&mut req);
        assert_eq!(req.reply_status, 206);
        assert_eq!(req.content_length, Some(10));
        assert_eq!(req.mmap_off, 10);
        assert_eq!(req.mmap_len, 10);
    }

    #[test]
    fn content_handler_unsatisfiable_range() {
        let entry: Arc<dyn CacheEntry> = Arc::new(Bytes(b"abc".to_vec()));
        let mut h = ContentHandler::new(entry);
        let mut req = RequestDescriptor::new();
        req.range_start = 50;
        assert_eq!(h.init(&mut req), Err(416));
    }

    #[test]
    fn error_page_single_shot() {
        let mut h = ErrorPageHandler::new(404);
        let mut req = RequestDescriptor::new();
        h.add_headers(&mut req);
        assert_eq!(req.reply_status, 404);
        let mut out = Vec::new();
        assert_eq!(h.step(&mut req, &mut out), Ok(Step::Data));
        assert!(!out.is_empty());
        assert_eq!(h.step(&mut req, &mut out), Ok(Step::Done));
    }
}
