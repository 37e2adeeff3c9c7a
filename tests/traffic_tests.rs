// Traffic accounting and outbound rate shaping through the full
// connection lifecycle.

mod common;

use common::*;
use ravel::conn::{Connection, Disposition};
use ravel::handler::{Handler, HandlerFactory, HandlerState, Step};
use ravel::request::RequestDescriptor;
use ravel::resolver::ConfigEntry;
use std::sync::Arc;

#[test]
fn vhost_receives_traffic_rollup() {
    let mut fx = fixture(content_entry(b"payload"));
    let raw = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";
    let mut conn = Connection::new(ScriptSocket::with_request(raw));

    drive(&mut conn, &mut fx);

    let (rx, tx) = fx.vhost.traffic();
    assert_eq!(rx, raw.len() as u64);
    assert_eq!(tx, conn.socket.as_ref().unwrap().wrote.len() as u64);
    assert_eq!(conn.traffic.rx, rx);
    assert_eq!(conn.traffic.tx, tx);
}

#[test]
fn connection_cap_defers_the_next_write() {
    let mut entry = content_entry(b"0123456789");
    entry.limit_bps = 1_000; // 1 byte per ms
    let mut fx = fixture(entry);
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET / HTTP/1.1\r\nHost: h\r\n\r\n",
    ));

    let now = 1_000;
    let d = drive_at(&mut conn, &mut fx, now);
    let Disposition::Sleep(deadline) = d else {
        panic!("expected shaping sleep, got {:?}", d);
    };

    // sleep_ms = sent * 1000 / bps, and everything went out in one turn
    let sent = conn.socket.as_ref().unwrap().wrote.len() as u64;
    assert_eq!(deadline, now + sent);
    assert_eq!(conn.wake_at, Some(deadline));

    // resuming at the deadline completes the transaction
    let d = drive_at(&mut conn, &mut fx, deadline);
    assert_eq!(d, Disposition::Readable);
    assert_eq!(conn.served(), 1);
    assert!(wrote(&conn).ends_with("0123456789"));
}

#[test]
fn early_wakeup_stays_blocked() {
    let mut entry = content_entry(b"abcdef");
    entry.limit_bps = 100;
    let mut fx = fixture(entry);
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET / HTTP/1.1\r\nHost: h\r\n\r\n",
    ));

    let Disposition::Sleep(deadline) = drive_at(&mut conn, &mut fx, 1_000) else {
        panic!("expected shaping sleep");
    };

    let d = drive_at(&mut conn, &mut fx, deadline - 1);
    assert!(matches!(d, Disposition::Sleep(dl) if dl == deadline));
}

/// Installs a per-request cap during init, the way a bandwidth-limiting
/// rule module would.
struct CappedContent {
    bps: u32,
    body: Vec<u8>,
    sent: bool,
}

impl Handler for CappedContent {
    fn init(&mut self, req: &mut RequestDescriptor) -> Result<HandlerState, u16> {
        req.limit.set(self.bps);
        Ok(HandlerState::Done)
    }

    fn add_headers(&mut self, req: &mut RequestDescriptor) {
        req.reply_status = 200;
        req.content_length = Some(self.body.len() as u64);
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

struct CappedContentFactory {
    bps: u32,
    body: Vec<u8>,
}

impl HandlerFactory for CappedContentFactory {
    fn create(&self, _req: &RequestDescriptor) -> Box<dyn Handler> {
        Box::new(CappedContent {
            bps: self.bps,
            body: self.body.clone(),
            sent: false,
        })
    }
}

#[test]
fn request_override_replaces_connection_cap() {
    // connection cap is glacial; the override is fast and must win
    let mut entry = ConfigEntry::new();
    entry.limit_bps = 10;
    entry.handler = Some(Arc::new(CappedContentFactory {
        bps: 2_000,
        body: b"override body".to_vec(),
    }));
    let mut fx = fixture(entry);
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET / HTTP/1.1\r\nHost: h\r\n\r\n",
    ));

    let now = 1_000;
    let Disposition::Sleep(deadline) = drive_at(&mut conn, &mut fx, now) else {
        panic!("expected shaping sleep");
    };

    let sent = conn.socket.as_ref().unwrap().wrote.len() as u64;
    let override_deadline = now + sent * 1_000 / 2_000;
    let conn_cap_deadline = now + sent * 1_000 / 10;
    assert_eq!(deadline, override_deadline);
    assert!(deadline < conn_cap_deadline);
}

#[test]
fn zero_limit_never_shapes() {
    let mut fx = fixture(content_entry(b"free flowing"));
    assert_eq!(fx.server.config.limit_bps, 0);
    let mut conn = Connection::new(ScriptSocket::with_request(
        b"GET / HTTP/1.1\r\nHost: h\r\n\r\n",
    ));

    let d = drive(&mut conn, &mut fx);
    assert_eq!(d, Disposition::Readable);
    assert_eq!(conn.wake_at, None);
}
