// End-to-end phase machine runs over a scripted transport.

mod common;

use common::*;
use ravel::conn::{Connection, Disposition, EngineCtx};
use ravel::handler::{AuthScheme, Handler, HandlerFactory, HandlerState, Step, Validator, ValidatorFactory, Verdict};
use ravel::header::Method;
use ravel::request::{Phase, RequestDescriptor};
use ravel::resolver::ConfigEntry;
use std::sync::Arc;

#[test]
fn unknown_length_body_is_chunked() {
    let mut entry = ConfigEntry::new();
    entry.handler = Some(Arc::new(StreamerFactory {
        chunks: vec![b"hello".to_vec(), b"world!".to_vec()],
    }));
    let mut fx = fixture(entry);
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET /s HTTP/1.1\r\nHost: h\r\n\r\n",
    ));

    let d = drive(&mut conn, &mut fx);
    assert_eq!(d, Disposition::Readable);

    let out = wrote(&conn);
    assert!(out.contains("Transfer-Encoding: chunked\r\n"));
    assert!(!out.contains("Content-Length"));
    assert!(out.ends_with("5\r\nhello\r\n6\r\nworld!\r\n0\r\n\r\n"));
}

#[test]
fn known_length_body_is_not_chunked() {
    let mut fx = fixture(content_entry(b"stable bytes"));
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET /f HTTP/1.1\r\nHost: h\r\n\r\n",
    ));

    drive(&mut conn, &mut fx);
    let out = wrote(&conn);
    assert!(out.contains("Content-Length: 12\r\n"));
    assert!(!out.contains("Transfer-Encoding"));
    assert!(out.ends_with("stable bytes"));
}

#[test]
fn http10_never_chunks() {
    let mut entry = ConfigEntry::new();
    entry.handler = Some(Arc::new(StreamerFactory {
        chunks: vec![b"data".to_vec()],
    }));
    let mut fx = fixture(entry);
    let mut conn = Connection::new(ScriptSocket::with_request(b"GET /s HTTP/1.0\r\n\r\n"));

    drive(&mut conn, &mut fx);
    let out = wrote(&conn);
    assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(!out.contains("Transfer-Encoding"));
    // EOF-delimited body forces the close
    assert!(out.contains("Connection: close\r\n"));
    assert!(out.ends_with("data"));
}

#[test]
fn silent_peer_lingering_times_out() {
    let mut fx = fixture(content_entry(b"x"));
    let mut conn = Connection::new(ScriptSocket::with_request(b"GET / HTTP/1.0\r\n\r\n"));

    let d = drive(&mut conn, &mut fx);
    assert_eq!(d, Disposition::Readable);
    assert_eq!(conn.front_phase(), Some(ravel::request::Phase::Lingering));

    // drain window armed at shutdown, not refreshed by idle polls
    let deadline = 1_000 + fx.server.config.linger_timeout_ms as u64;
    let armed_at = conn.timeout_at;
    let d = drive_at(&mut conn, &mut fx, deadline - 500);
    assert_eq!(d, Disposition::Readable);
    assert_eq!(conn.timeout_at, armed_at);

    assert!(!conn.timeout_expired(deadline - 1));
    assert!(conn.timeout_expired(deadline));

    let mut ctx = EngineCtx {
        server: &fx.server,
        pool: &mut fx.pool,
        metrics: &fx.metrics,
        now_ms: deadline,
        worker_id: 0,
    };
    assert_eq!(conn.on_timeout(&mut ctx), Disposition::Close);
}

#[test]
fn partial_writes_resume_where_they_stopped() {
    let mut fx = fixture(content_entry(b"abcdefghij"));
    let mut sock = ScriptSocket::with_request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    // three short writes, then a stall, then unlimited
    sock.write_caps.extend([7, 5, 3, 0]);
    let mut conn = Connection::new(sock);

    let d = drive(&mut conn, &mut fx);
    assert_eq!(d, Disposition::Writable);
    assert_eq!(conn.front_phase(), Some(Phase::SendHeaders));

    let d = drive(&mut conn, &mut fx);
    assert_eq!(d, Disposition::Readable);
    let out = wrote(&conn);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("abcdefghij"));
    // no duplicated bytes across the resumptions
    assert_eq!(out.matches("HTTP/1.1").count(), 1);
}

#[test]
fn head_omits_body_but_keeps_length() {
    let mut fx = fixture(content_entry(b"some body"));
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"HEAD / HTTP/1.1\r\nHost: h\r\n\r\n",
    ));

    drive(&mut conn, &mut fx);
    let out = wrote(&conn);
    assert!(out.contains("Content-Length: 9\r\n"));
    assert!(out.ends_with("\r\n\r\n"));
}

#[test]
fn range_request_gets_206() {
    let body: Vec<u8> = (0u8..100).collect();
    let mut fx = fixture(content_entry(&body));
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET /f HTTP/1.1\r\nHost: h\r\nRange: bytes=10-19\r\n\r\n",
    ));

    drive(&mut conn, &mut fx);
    let out = wrote(&conn);
    assert!(out.starts_with("HTTP/1.1 206 Partial Content\r\n"));
    assert!(out.contains("Content-Range: bytes 10-19/100\r\n"));
    assert!(out.contains("Content-Length: 10\r\n"));
}

#[test]
fn method_not_allowed_gets_405() {
    let mut entry = content_entry(b"x");
    entry.allowed_methods = Some(vec![Method::Get, Method::Head]);
    let mut fx = fixture(entry);
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"POST /f HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n",
    ));

    drive(&mut conn, &mut fx);
    assert!(wrote(&conn).starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

struct FixedValidator {
    accept: &'static str,
}

impl Validator for FixedValidator {
    fn authenticate(
        &mut self,
        _scheme: AuthScheme,
        credentials: &str,
        _req: &RequestDescriptor,
    ) -> Verdict {
        if credentials == self.accept {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        }
    }
}

struct FixedValidatorFactory {
    accept: &'static str,
}

impl ValidatorFactory for FixedValidatorFactory {
    fn create(&self) -> Box<dyn Validator> {
        Box::new(FixedValidator {
            accept: self.accept,
        })
    }
}

fn auth_entry() -> ConfigEntry {
    let mut entry = content_entry(b"secret page");
    entry.auth_realm = Some("vault".into());
    entry.auth_type = AuthScheme::Basic;
    entry.validator = Some(Arc::new(FixedValidatorFactory {
        accept: "dXNlcjpwdw==",
    }));
    entry
}

#[test]
fn missing_credentials_get_401_with_challenge() {
    let mut fx = fixture(auth_entry());
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET /v HTTP/1.1\r\nHost: h\r\n\r\n",
    ));

    drive(&mut conn, &mut fx);
    let out = wrote(&conn);
    assert!(out.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    assert!(out.contains("WWW-Authenticate: Basic realm=\"vault\"\r\n"));
}

#[test]
fn valid_credentials_pass_through() {
    let mut fx = fixture(auth_entry());
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET /v HTTP/1.1\r\nHost: h\r\nAuthorization: Basic dXNlcjpwdw==\r\n\r\n",
    ));

    drive(&mut conn, &mut fx);
    let out = wrote(&conn);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("secret page"));
}

/// Serves the error document path; 404s everything else.
struct DocOr404 {
    sent: bool,
}

impl Handler for DocOr404 {
    fn init(&mut self, req: &mut RequestDescriptor) -> Result<HandlerState, u16> {
        if req.request_path == "/err.html" {
            Ok(HandlerState::Done)
        } else {
            Err(404)
        }
    }

    fn add_headers(&mut self, req: &mut RequestDescriptor) {
        req.reply_status = if req.error_internal_code > 0 {
            req.error_internal_code
        } else {
            200
        };
        req.content_length = Some(9);
    }

    fn step(&mut self, _req: &mut RequestDescriptor, out: &mut Vec<u8>) -> Result<Step, u16> {
        if self.sent {
            return Ok(Step::Done);
        }
        out.extend_from_slice(b"not here\n");
        self.sent = true;
        Ok(Step::Data)
    }
}

struct DocOr404Factory;

impl HandlerFactory for DocOr404Factory {
    fn create(&self, _req: &RequestDescriptor) -> Box<dyn Handler> {
        Box::new(DocOr404 { sent: false })
    }
}

#[test]
fn error_document_served_via_internal_redirect() {
    let mut entry = ConfigEntry::new();
    entry.handler = Some(Arc::new(DocOr404Factory));
    entry.error_document = Some("/err.html".into());
    let logger = Arc::new(CollectingLogger::default());
    let mut fx = fixture_with(
        entry,
        ravel::config::ServerConfig::default(),
        Some(logger.clone()),
    );
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET /missing?q=1 HTTP/1.1\r\nHost: h\r\n\r\n",
    ));

    drive(&mut conn, &mut fx);
    let out = wrote(&conn);
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(out.ends_with("not here\n"));

    // access log records what the client asked for, not the rewrite
    let entries = logger.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1, "/missing");
    assert_eq!(entries[0].2, "q=1");
    assert_eq!(entries[0].3, 404);
}

#[test]
fn descriptor_pool_reused_across_transactions() {
    let mut fx = fixture(content_entry(b"x"));
    let mut conn = Connection::new(ScriptSocket::new());

    for i in 0..3 {
        conn.socket
            .as_mut()
            .unwrap()
            .push_data(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let d = drive(&mut conn, &mut fx);
        assert_eq!(d, Disposition::Readable);
        assert_eq!(conn.served(), i + 1);
    }

    let (hits, misses, rejected) = fx.pool.stats();
    assert_eq!(misses, 1); // one descriptor constructed, then reused
    assert_eq!(hits, 2);
    assert_eq!(rejected, 0);
    assert_eq!(fx.pool.len(), 1);
}
