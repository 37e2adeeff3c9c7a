// src/conn.rs
//
// One client connection and its phase machine. A connection owns the
// transport, a FIFO of request descriptors and the traffic counters;
// `advance` runs the front request through its lifecycle until it
// completes, blocks on I/O, or hits a shaping deadline.

use crate::handler::{HandlerState, Step, Verdict};
use crate::header::Upgrade;
use crate::metrics::WorkerMetrics;
use crate::pool::RequestPool;
use crate::request::{Options, Phase, RequestDescriptor};
use crate::resolver::{AccessEntry, ConfigEntry, ServerContext, TlsDriver, TlsStatus};
use crate::socket::{IoStatus, Socket};
use crate::traffic::Traffic;
use std::collections::VecDeque;
use std::sync::Arc;

/// What the worker should do with this connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Park until the socket is readable.
    Readable,
    /// Park until the socket is writable.
    Writable,
    /// Park until the given absolute millisecond deadline (rate cap).
    Sleep(u64),
    /// Tear the connection down and free its slot.
    Close,
}

/// Per-dispatch engine context: shared startup state plus the worker's
/// mutable collaborators. Rebuilt each loop turn so `now_ms` is read
/// once per turn, not per syscall.
pub struct EngineCtx<'a> {
    pub server: &'a ServerContext,
    pub pool: &'a mut RequestPool,
    pub metrics: &'a WorkerMetrics,
    pub now_ms: u64,
    pub worker_id: usize,
}

enum Wait {
    Readable,
    Writable,
    Timer(u64),
}

enum Transition {
    Continue,
    Suspend(Wait),
    Close,
}

enum After {
    NextPipelined,
    Idle,
    Linger,
    Close,
}

enum FlushResult {
    Complete,
    Suspend,
    Blocked(u64),
    Closed,
}

pub struct Connection<S: Socket> {
    pub socket: Option<S>,
    /// Slot token in the worker's arena; stamped onto each descriptor.
    pub poll_token: Option<usize>,

    queue: VecDeque<Box<RequestDescriptor>>,

    // Absolute deadline and its refresh lapse, ms. -1 means unarmed.
    pub timeout_at: i64,
    pub timeout_lapse: i64,
    pub timeout_reason: Option<&'static str>,

    /// Keep-alive transactions left, including the one in flight.
    /// 0 before the first request and after exhaustion.
    pub keepalive: u32,
    served: u64,

    pub traffic: Traffic,

    /// Bytes read past the current transaction: the next pipelined
    /// request head, or excess body.
    pub buffer_in: Vec<u8>,
    /// Serialized response head (plus mapped body) being written out.
    buffer_out: Vec<u8>,
    out_pos: usize,

    tls: Option<Box<dyn TlsDriver>>,
    tls_done: bool,

    linger_read: u64,

    /// Shaping wake-up deadline the worker honors while parked.
    pub wake_at: Option<u64>,
}

impl<S: Socket> Connection<S> {
    pub fn new(socket: S) -> Self {
        Self {
            socket: Some(socket),
            poll_token: None,
            queue: VecDeque::new(),
            timeout_at: -1,
            timeout_lapse: -1,
            timeout_reason: None,
            keepalive: 0,
            served: 0,
            traffic: Traffic::new(),
            buffer_in: Vec::new(),
            buffer_out: Vec::new(),
            out_pos: 0,
            tls: None,
            tls_done: false,
            linger_read: 0,
            wake_at: None,
        }
    }

    pub fn with_tls(mut self, tls: Box<dyn TlsDriver>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Reset the connection for slot reuse. Queued descriptors are
    /// cleaned and recycled into `pool`, or destroyed without one.
    /// Idempotent.
    pub fn clean(&mut self, mut pool: Option<&mut RequestPool>) {
        self.socket = None;
        self.poll_token = None;
        while let Some(mut req) = self.queue.pop_front() {
            req.clean();
            match pool.as_deref_mut() {
                Some(p) => p.recycle(req),
                None => drop(req),
            }
        }
        self.timeout_at = -1;
        self.timeout_lapse = -1;
        self.timeout_reason = None;
        self.keepalive = 0;
        self.served = 0;
        self.traffic.clean();
        self.buffer_in.clear();
        self.buffer_out.clear();
        self.out_pos = 0;
        self.tls = None;
        self.tls_done = false;
        self.linger_read = 0;
        self.wake_at = None;
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Append a descriptor to the transaction FIFO. `advance` always
    /// works on the front, so ordering is arrival order.
    pub fn enqueue_request(&mut self, req: Box<RequestDescriptor>) {
        self.queue.push_back(req);
    }

    pub fn front_phase(&self) -> Option<Phase> {
        self.queue.front().map(|r| r.phase)
    }

    /// Requests completed on this connection.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn timeout_expired(&self, now_ms: u64) -> bool {
        self.timeout_at >= 0 && (now_ms as i64) >= self.timeout_at
    }

    pub fn update_timeout(&mut self, now_ms: u64, lapse_ms: i64, reason: &'static str) {
        self.timeout_lapse = lapse_ms;
        self.timeout_at = now_ms as i64 + lapse_ms;
        self.timeout_reason = Some(reason);
    }

    /// Refresh the armed deadline after I/O progress.
    fn touch(&mut self, now_ms: u64) {
        if self.timeout_lapse >= 0 {
            self.timeout_at = now_ms as i64 + self.timeout_lapse;
        }
    }

    pub fn on_readable(&mut self, ctx: &mut EngineCtx) -> Disposition {
        self.advance(ctx)
    }

    pub fn on_writable(&mut self, ctx: &mut EngineCtx) -> Disposition {
        self.advance(ctx)
    }

    /// Shaping deadline elapsed; resume the suspended write.
    pub fn on_wake(&mut self, ctx: &mut EngineCtx) -> Disposition {
        self.wake_at = None;
        self.advance(ctx)
    }

    pub fn on_timeout(&mut self, _ctx: &mut EngineCtx) -> Disposition {
        tracing::debug!(
            reason = self.timeout_reason.unwrap_or("unset"),
            phase = ?self.front_phase(),
            "connection timed out"
        );
        Disposition::Close
    }

    /// Drive the front request as far as it will go without blocking.
    pub fn advance(&mut self, ctx: &mut EngineCtx) -> Disposition {
        let mut req = match self.queue.pop_front() {
            Some(r) => r,
            None => {
                let mut r = ctx.pool.acquire();
                r.arm(ctx.worker_id, self.poll_token);
                r.bind = Some(ctx.server.bind.clone());
                r
            }
        };

        loop {
            let transition = match req.phase {
                Phase::Nothing => self.phase_start(&mut req, ctx),
                Phase::TlsHandshake => self.phase_tls(&mut req),
                Phase::ReadingHeader => self.phase_reading_header(&mut req, ctx),
                Phase::ProcessingHeader => self.phase_processing_header(&mut req, ctx),
                Phase::SetupConnection => self.phase_setup_connection(&mut req, ctx),
                Phase::Init => self.phase_init(&mut req, ctx),
                Phase::ReadingPost => self.phase_reading_post(&mut req, ctx),
                Phase::AddHeaders => self.phase_add_headers(&mut req, ctx),
                Phase::SendHeaders => self.phase_send_headers(&mut req, ctx),
                Phase::Stepping => self.phase_stepping(&mut req, ctx),
                Phase::Shutdown => match self.phase_shutdown(&mut req, ctx) {
                    After::NextPipelined | After::Linger => Transition::Continue,
                    After::Idle => {
                        ctx.pool.recycle(req);
                        return Disposition::Readable;
                    }
                    After::Close => Transition::Close,
                },
                Phase::Lingering => self.phase_lingering(&mut req, ctx),
            };

            match transition {
                Transition::Continue => {}
                Transition::Suspend(wait) => {
                    self.queue.push_front(req);
                    return match wait {
                        Wait::Readable => Disposition::Readable,
                        Wait::Writable => Disposition::Writable,
                        Wait::Timer(deadline) => {
                            self.wake_at = Some(deadline);
                            Disposition::Sleep(deadline)
                        }
                    };
                }
                Transition::Close => {
                    req.clean();
                    ctx.pool.recycle(req);
                    return Disposition::Close;
                }
            }
        }
    }

    // ---- Phases ----

    fn phase_start(&mut self, req: &mut RequestDescriptor, ctx: &EngineCtx) -> Transition {
        self.update_timeout(ctx.now_ms, ctx.server.config.timeout_header_ms, "header");
        req.phase = if self.tls.is_some() && !self.tls_done {
            Phase::TlsHandshake
        } else {
            Phase::ReadingHeader
        };
        Transition::Continue
    }

    fn phase_tls(&mut self, req: &mut RequestDescriptor) -> Transition {
        let (Some(sock), Some(tls)) = (self.socket.as_mut(), self.tls.as_mut()) else {
            return Transition::Close;
        };
        match tls.drive(sock) {
            Ok(TlsStatus::Complete) => {
                self.tls_done = true;
                req.phase = Phase::ReadingHeader;
                Transition::Continue
            }
            Ok(TlsStatus::WouldBlock) => Transition::Suspend(Wait::Readable),
            Err(e) => {
                tracing::debug!(id = req.id, error = %e, "tls handshake failed");
                Transition::Close
            }
        }
    }

    fn phase_reading_header(
        &mut self,
        req: &mut RequestDescriptor,
        ctx: &mut EngineCtx,
    ) -> Transition {
        // Bytes staged by the previous transaction come first.
        if !self.buffer_in.is_empty() {
            req.header_in.extend_from_slice(&self.buffer_in);
            self.buffer_in.clear();
        }

        loop {
            if !req.header_in.is_empty() {
                match crate::header::parse(&req.header_in) {
                    crate::header::Parse::Complete(block, consumed) => {
                        // Everything past the head belongs to the body
                        // or the next pipelined request.
                        self.buffer_in.extend_from_slice(&req.header_in[consumed..]);
                        req.header_in.truncate(consumed);
                        req.header = block;
                        req.phase = Phase::ProcessingHeader;
                        return Transition::Continue;
                    }
                    crate::header::Parse::Incomplete => {}
                    crate::header::Parse::Malformed => {
                        req.error_code = Some(400);
                        return self.to_error(req, ctx);
                    }
                }
            }

            let Some(sock) = self.socket.as_mut() else {
                return Transition::Close;
            };
            let mut tmp = [0u8; 4096];
            match sock.read(&mut tmp) {
                Ok(IoStatus::Ready(n)) => {
                    self.traffic.rx_add(n);
                    req.header_in.extend_from_slice(&tmp[..n]);
                    self.touch(ctx.now_ms);
                }
                Ok(IoStatus::WouldBlock) => return Transition::Suspend(Wait::Readable),
                Ok(IoStatus::Eof) => {
                    req.options.set(Options::GOT_EOF);
                    return Transition::Close;
                }
                Err(e) => {
                    tracing::debug!(id = req.id, error = %e, "header read failed");
                    return Transition::Close;
                }
            }
        }
    }

    fn phase_processing_header(
        &mut self,
        req: &mut RequestDescriptor,
        ctx: &mut EngineCtx,
    ) -> Transition {
        if let Err(code) = req.process_header() {
            req.error_code = Some(code);
            return self.to_error(req, ctx);
        }

        let res = ctx.server.resolver.resolve(&req.host, &req.request_path);
        req.logger = res.vhost.logger.clone().or_else(|| ctx.server.logger.clone());
        req.vhost = Some(res.vhost);
        req.entry = Some(res.entry);
        req.captures = res.captures;
        req.host_captures = res.host_captures;
        req.phase = Phase::SetupConnection;
        Transition::Continue
    }

    fn phase_setup_connection(
        &mut self,
        req: &mut RequestDescriptor,
        ctx: &mut EngineCtx,
    ) -> Transition {
        if req.respins > ctx.server.config.max_respins {
            req.error_code = Some(500);
            return self.to_error(req, ctx);
        }

        // Respins arrive here with routing cleared; resolve the
        // rewritten path before applying policy.
        if req.entry.is_none() {
            let res = ctx.server.resolver.resolve(&req.host, &req.request_path);
            req.logger = res.vhost.logger.clone().or_else(|| ctx.server.logger.clone());
            req.vhost = Some(res.vhost);
            req.entry = Some(res.entry);
            req.captures = res.captures;
            req.host_captures = res.host_captures;
        }
        let Some(entry) = req.entry.clone() else {
            req.error_code = Some(500);
            return self.to_error(req, ctx);
        };

        if entry.secure_only && self.tls.is_none() {
            req.error_code = Some(426);
            return self.to_error(req, ctx);
        }
        if let Some(allowed) = &entry.allowed_methods {
            if !allowed.contains(&req.header.method) {
                req.error_code = Some(405);
                return self.to_error(req, ctx);
            }
        }
        if entry.auth_realm.is_some() {
            if let Err(code) = self.check_auth(req, &entry) {
                req.error_code = Some(code);
                return self.to_error(req, ctx);
            }
        }

        // Connection-level policy: entry cap wins over the server-wide
        // default. A later per-request override replaces both.
        let bps = if entry.limit_bps > 0 {
            entry.limit_bps
        } else {
            ctx.server.config.limit_bps
        };
        self.traffic.limit.set(bps);

        if let Some(root) = &entry.document_root {
            req.effective_directory.clear();
            req.effective_directory.push_str(root);
            req.local_directory.clear();
            req.local_directory.push_str(root);
            req.options.set(Options::DOCUMENT_ROOT);
        } else if let Some(vh) = &req.vhost {
            let root = vh.root.clone();
            req.local_directory.clear();
            req.local_directory.push_str(&root);
        }
        if req.expiration == crate::resolver::Expiration::None {
            req.expiration = entry.expiration;
        }

        if !entry.keepalive || !req.keepalive_requested {
            self.keepalive = 0;
        } else if self.served == 0 && self.keepalive == 0 {
            self.keepalive = ctx.server.config.keepalive_max;
        }

        req.phase = Phase::Init;
        Transition::Continue
    }

    fn check_auth(
        &mut self,
        req: &mut RequestDescriptor,
        entry: &Arc<ConfigEntry>,
    ) -> Result<(), u16> {
        use crate::handler::AuthScheme;

        let Some(factory) = &entry.validator else {
            return Err(500);
        };
        req.auth_type = entry.auth_type;

        let Some(authz) = req.header.get("Authorization").map(str::to_owned) else {
            return Err(401);
        };
        let (scheme_str, credentials) = authz.split_once(' ').unwrap_or((authz.as_str(), ""));
        let scheme = if scheme_str.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else if scheme_str.eq_ignore_ascii_case("digest") {
            AuthScheme::Digest
        } else {
            AuthScheme::None
        };
        req.req_auth_type = scheme;
        if scheme != entry.auth_type {
            return Err(401);
        }

        let mut validator = factory.create();
        let verdict = validator.authenticate(scheme, credentials.trim(), req);
        req.validator = Some(validator);
        match verdict {
            Verdict::Accepted => Ok(()),
            Verdict::Rejected => Err(401),
        }
    }

    fn phase_init(&mut self, req: &mut RequestDescriptor, ctx: &mut EngineCtx) -> Transition {
        if req.handler.is_none() {
            let factory = req.entry.as_ref().and_then(|e| e.handler.clone());
            match factory {
                Some(f) => req.handler = Some(f.create(req)),
                None => {
                    req.error_code = Some(404);
                    return self.to_error(req, ctx);
                }
            }
        }

        let Some(mut handler) = req.handler.take() else {
            return Transition::Close;
        };
        let result = handler.init(req);
        req.handler = Some(handler);

        match result {
            Ok(HandlerState::Done) => {
                if !req.redirect.is_empty() {
                    if req.respins >= ctx.server.config.max_respins {
                        req.error_code = Some(500);
                        return self.to_error(req, ctx);
                    }
                    let target = std::mem::take(&mut req.redirect);
                    tracing::debug!(id = req.id, target = %target, "internal redirect");
                    req.internal_redirect(&target, req.reply_status);
                    return Transition::Continue;
                }
                if !req.post.complete() {
                    self.update_timeout(ctx.now_ms, ctx.server.config.timeout_post_ms, "post");
                    req.phase = Phase::ReadingPost;
                } else {
                    req.phase = Phase::AddHeaders;
                }
                Transition::Continue
            }
            Ok(HandlerState::Suspend) => Transition::Suspend(Wait::Readable),
            Err(code) => {
                req.handler = None;
                req.error_code = Some(code);
                self.to_error(req, ctx)
            }
        }
    }

    fn phase_reading_post(
        &mut self,
        req: &mut RequestDescriptor,
        ctx: &mut EngineCtx,
    ) -> Transition {
        if !self.buffer_in.is_empty() && !req.post.complete() {
            let consumed = req.post.push(&self.buffer_in);
            self.buffer_in.drain(..consumed);
        }

        while !req.post.complete() {
            let Some(sock) = self.socket.as_mut() else {
                return Transition::Close;
            };
            let mut tmp = [0u8; 8192];
            match sock.read(&mut tmp) {
                Ok(IoStatus::Ready(n)) => {
                    self.traffic.rx_add(n);
                    let consumed = req.post.push(&tmp[..n]);
                    if consumed < n {
                        self.buffer_in.extend_from_slice(&tmp[consumed..n]);
                    }
                    self.touch(ctx.now_ms);
                }
                Ok(IoStatus::WouldBlock) => return Transition::Suspend(Wait::Readable),
                Ok(IoStatus::Eof) => {
                    // Truncated body; nothing sensible left to answer.
                    req.options.set(Options::GOT_EOF);
                    return Transition::Close;
                }
                Err(e) => {
                    tracing::debug!(id = req.id, error = %e, "body read failed");
                    return Transition::Close;
                }
            }
        }

        req.phase = Phase::AddHeaders;
        Transition::Continue
    }

    fn phase_add_headers(&mut self, req: &mut RequestDescriptor, _ctx: &mut EngineCtx) -> Transition {
        let Some(mut handler) = req.handler.take() else {
            return Transition::Close;
        };
        handler.add_headers(req);
        req.handler = Some(handler);

        // Encoder selection discards any known length: the transformed
        // size is unknown until `finish`.
        if req.encoder.is_none()
            && !req.in_error_handler
            && !req.options.has(Options::CANT_ENCODER)
            && req.should_include_length()
        {
            if let Some(factory) = req.entry.as_ref().and_then(|e| e.encoder.clone()) {
                req.encoder = Some(factory.create());
                req.content_length = None;
            }
        }

        req.set_chunked_encoding();

        // An unknown-length identity body is delimited by EOF, so the
        // connection cannot be reused after it.
        if !req.chunked_encoding && req.content_length.is_none() && req.should_include_length() {
            self.keepalive = 0;
        }

        let keep = self.keepalive > 1
            && !req.options.has(Options::GOT_EOF)
            && req.upgrade == Upgrade::Nothing;

        self.buffer_out.clear();
        self.out_pos = 0;
        req.render_response_head(keep, &mut self.buffer_out);

        if req.options.has(Options::TCP_CORK) {
            if let Some(sock) = self.socket.as_mut() {
                sock.set_cork(true);
            }
        }

        req.phase = Phase::SendHeaders;
        Transition::Continue
    }

    fn phase_send_headers(
        &mut self,
        req: &mut RequestDescriptor,
        ctx: &mut EngineCtx,
    ) -> Transition {
        if let Some(deadline) = self.write_blocked(req, ctx.now_ms) {
            return Transition::Suspend(Wait::Timer(deadline));
        }

        // A small mapped body rides the same writev as the head.
        let io = if req.should_include_length() {
            req.io_entry.clone()
        } else {
            None
        };
        let body: &[u8] = match &io {
            Some(entry) if req.mmap_len > 0 => {
                &entry.bytes()[req.mmap_off..req.mmap_off + req.mmap_len]
            }
            _ => &[],
        };

        let head_len = self.buffer_out.len();
        let total = head_len + body.len();

        while self.out_pos < total {
            let Some(sock) = self.socket.as_mut() else {
                return Transition::Close;
            };
            let status = if self.out_pos < head_len {
                if body.is_empty() {
                    sock.write(&self.buffer_out[self.out_pos..])
                } else {
                    sock.writev(&[&self.buffer_out[self.out_pos..], body])
                }
            } else {
                sock.write(&body[self.out_pos - head_len..])
            };
            match status {
                Ok(IoStatus::Ready(n)) => {
                    self.out_pos += n;
                    self.traffic.tx_add(n, ctx.now_ms);
                    if req.limit.enabled {
                        req.limit.on_sent(n, ctx.now_ms);
                    }
                    self.touch(ctx.now_ms);
                    if self.out_pos < total {
                        if let Some(deadline) = self.write_blocked(req, ctx.now_ms) {
                            return Transition::Suspend(Wait::Timer(deadline));
                        }
                    }
                }
                Ok(IoStatus::WouldBlock) => return Transition::Suspend(Wait::Writable),
                Ok(IoStatus::Eof) => return Transition::Close,
                Err(e) => {
                    tracing::debug!(id = req.id, error = %e, "header write failed");
                    return Transition::Close;
                }
            }
        }

        req.header_sent = true;
        self.buffer_out.clear();
        self.out_pos = 0;
        req.phase = if req.should_include_length() {
            Phase::Stepping
        } else {
            Phase::Shutdown
        };
        Transition::Continue
    }

    fn phase_stepping(&mut self, req: &mut RequestDescriptor, ctx: &mut EngineCtx) -> Transition {
        loop {
            if let Some(deadline) = self.write_blocked(req, ctx.now_ms) {
                return Transition::Suspend(Wait::Timer(deadline));
            }

            if req.has_pending_write() {
                match self.flush_pending(req, ctx) {
                    FlushResult::Complete => req.clear_pending_write(),
                    FlushResult::Suspend => return Transition::Suspend(Wait::Writable),
                    FlushResult::Blocked(deadline) => {
                        return Transition::Suspend(Wait::Timer(deadline));
                    }
                    FlushResult::Closed => return Transition::Close,
                }
            }

            if req.chunked_last_package {
                req.phase = Phase::Shutdown;
                return Transition::Continue;
            }

            let Some(mut handler) = req.handler.take() else {
                return Transition::Close;
            };
            let mut out = std::mem::take(&mut req.step_buffer);
            out.clear();
            let result = handler.step(req, &mut out);
            req.step_buffer = out;
            req.handler = Some(handler);

            match result {
                Ok(Step::Data) => {
                    if req.step_buffer.is_empty() {
                        continue;
                    }
                    let from_encoder = match req.encoder.take() {
                        Some(mut encoder) => {
                            req.encoder_buffer.clear();
                            let step = std::mem::take(&mut req.step_buffer);
                            let res = encoder.transform(&step, &mut req.encoder_buffer);
                            req.step_buffer = step;
                            req.encoder = Some(encoder);
                            if let Err(code) = res {
                                return self.step_error(req, ctx, code);
                            }
                            true
                        }
                        None => false,
                    };
                    if from_encoder && req.encoder_buffer.is_empty() {
                        // Encoder held the bytes back; produce more.
                        continue;
                    }
                    let len = if from_encoder {
                        req.encoder_buffer.len()
                    } else {
                        req.step_buffer.len()
                    };
                    if req.chunked_encoding {
                        req.queue_chunk(len, from_encoder);
                    } else {
                        req.queue_raw(from_encoder);
                    }
                }
                Ok(Step::Done) => {
                    if let Some(mut encoder) = req.encoder.take() {
                        req.encoder_buffer.clear();
                        let res = encoder.finish(&mut req.encoder_buffer);
                        if let Err(code) = res {
                            return self.step_error(req, ctx, code);
                        }
                        if !req.encoder_buffer.is_empty() {
                            if req.chunked_encoding {
                                req.queue_chunk(req.encoder_buffer.len(), true);
                            } else {
                                req.queue_raw(true);
                            }
                            continue;
                        }
                    }
                    if req.chunked_encoding {
                        req.queue_last_chunk();
                        continue;
                    }
                    req.phase = Phase::Shutdown;
                    return Transition::Continue;
                }
                Ok(Step::Suspend) => return Transition::Suspend(Wait::Readable),
                Err(code) => return self.step_error(req, ctx, code),
            }
        }
    }

    /// Write out the pending segment group, resuming at the cursor.
    fn flush_pending(&mut self, req: &mut RequestDescriptor, ctx: &mut EngineCtx) -> FlushResult {
        let total = req.pending_total();
        while req.chunked_sent < total {
            let mut segs: [&[u8]; 3] = [&[]; 3];
            let mut count = 0;
            let mut skip = req.chunked_sent;
            for i in 0..req.chunksn as usize {
                let bytes = req.seg_bytes(req.chunks[i]);
                if skip >= bytes.len() {
                    skip -= bytes.len();
                    continue;
                }
                segs[count] = &bytes[skip..];
                skip = 0;
                count += 1;
            }

            let Some(sock) = self.socket.as_mut() else {
                return FlushResult::Closed;
            };
            match sock.writev(&segs[..count]) {
                Ok(IoStatus::Ready(n)) => {
                    req.chunked_sent += n;
                    self.traffic.tx_add(n, ctx.now_ms);
                    if req.limit.enabled {
                        req.limit.on_sent(n, ctx.now_ms);
                    }
                    self.touch(ctx.now_ms);
                    if req.chunked_sent < total {
                        if let Some(deadline) = self.write_blocked(req, ctx.now_ms) {
                            return FlushResult::Blocked(deadline);
                        }
                    }
                }
                Ok(IoStatus::WouldBlock) => return FlushResult::Suspend,
                Ok(IoStatus::Eof) => return FlushResult::Closed,
                Err(e) => {
                    tracing::debug!(id = req.id, error = %e, "body write failed");
                    return FlushResult::Closed;
                }
            }
        }
        FlushResult::Complete
    }

    fn phase_shutdown(&mut self, req: &mut RequestDescriptor, ctx: &mut EngineCtx) -> After {
        self.finish_request(req, ctx);

        if req.options.has(Options::TCP_CORK) {
            if let Some(sock) = self.socket.as_mut() {
                sock.set_cork(false);
            }
        }

        self.served += 1;
        if self.keepalive > 0 {
            self.keepalive -= 1;
        }
        let keep = self.keepalive > 0
            && !req.options.has(Options::GOT_EOF)
            && req.upgrade == Upgrade::Nothing;

        if keep {
            req.clean();
            if self.buffer_in.is_empty() {
                self.update_timeout(ctx.now_ms, ctx.server.config.timeout_header_ms, "keep-alive");
                return After::Idle;
            }
            // The next pipelined request head is already staged.
            req.arm(ctx.worker_id, self.poll_token);
            req.bind = Some(ctx.server.bind.clone());
            After::NextPipelined
        } else {
            let ok = match self.socket.as_mut() {
                Some(sock) => sock.shutdown_write().is_ok(),
                None => false,
            };
            if !ok {
                return After::Close;
            }
            self.linger_read = 0;
            self.update_timeout(ctx.now_ms, ctx.server.config.linger_timeout_ms, "lingering");
            req.phase = Phase::Lingering;
            After::Linger
        }
    }

    /// Drain what the peer still has in flight so the close is clean,
    /// bounded by a byte ceiling and the lingering deadline.
    fn phase_lingering(&mut self, req: &mut RequestDescriptor, ctx: &mut EngineCtx) -> Transition {
        self.linger_read += self.buffer_in.len() as u64;
        self.buffer_in.clear();

        loop {
            if self.linger_read >= ctx.server.config.linger_max_bytes {
                return Transition::Close;
            }
            let Some(sock) = self.socket.as_mut() else {
                return Transition::Close;
            };
            let mut tmp = [0u8; 2048];
            match sock.read(&mut tmp) {
                Ok(IoStatus::Ready(n)) => {
                    self.linger_read += n as u64;
                    self.traffic.rx_add(n);
                    // No deadline refresh: the drain window is fixed.
                }
                Ok(IoStatus::WouldBlock) => return Transition::Suspend(Wait::Readable),
                Ok(IoStatus::Eof) => {
                    req.options.set(Options::GOT_EOF);
                    return Transition::Close;
                }
                Err(_) => return Transition::Close,
            }
        }
    }

    // ---- Error routing ----

    fn to_error(&mut self, req: &mut RequestDescriptor, ctx: &EngineCtx) -> Transition {
        if req.header_sent || req.in_error_handler {
            return Transition::Close;
        }

        let code = req.error_code.unwrap_or(500);
        let doc = req.entry.as_ref().and_then(|e| e.error_document.clone());
        if let Some(doc) = doc {
            if req.respins < ctx.server.config.max_respins && req.request_path != doc {
                tracing::debug!(id = req.id, code, doc = %doc, "error document redirect");
                req.internal_redirect(&doc, code);
                return Transition::Continue;
            }
            // Respin budget spent while still failing.
            req.error_code = Some(500);
        }

        req.setup_error_handler();
        Transition::Continue
    }

    fn step_error(&mut self, req: &mut RequestDescriptor, ctx: &EngineCtx, code: u16) -> Transition {
        if req.header_sent {
            tracing::debug!(id = req.id, code, "handler failed after headers");
            return Transition::Close;
        }
        req.error_code = Some(code);
        self.to_error(req, ctx)
    }

    // ---- Accounting ----

    /// Effective shaping gate: a per-request override replaces the
    /// connection cap while enabled.
    fn write_blocked(&self, req: &RequestDescriptor, now_ms: u64) -> Option<u64> {
        if req.limit.enabled {
            req.limit.blocked(now_ms)
        } else {
            self.traffic.limit.blocked(now_ms)
        }
    }

    fn finish_request(&mut self, req: &mut RequestDescriptor, ctx: &mut EngineCtx) {
        ctx.metrics.inc_req();

        if let Some(logger) = req.logger.clone().or_else(|| ctx.server.logger.clone()) {
            let (path, query) = if req.request_original.is_empty() {
                (req.request_path.as_str(), req.query_string.as_str())
            } else {
                (
                    req.request_original.as_str(),
                    req.query_string_original.as_str(),
                )
            };
            logger.log(&AccessEntry {
                id: req.id,
                method: req.header.method,
                path,
                query,
                status: req.reply_status,
                rx: self.traffic.rx,
                tx: self.traffic.tx,
            });
        }

        if let Some((rx, tx)) = self
            .traffic
            .flush_partials(ctx.now_ms, ctx.server.config.traffic_update_ms)
        {
            if let Some(vhost) = &req.vhost {
                vhost.add_traffic(rx, tx);
            }
            ctx.metrics.add_rx(rx as usize);
            ctx.metrics.add_tx(tx as usize);
        }

        tracing::debug!(
            id = req.id,
            status = req.reply_status,
            respins = req.respins,
            served = self.served + 1,
            "request finished"
        );
    }
}
