// Shared fixtures: a scripted transport and context builders that let
// the whole phase machine run in-memory.
#![allow(dead_code)]

use ravel::config::ServerConfig;
use ravel::conn::{Connection, Disposition, EngineCtx};
use ravel::handler::{
    CacheEntry, ContentHandlerFactory, Handler, HandlerFactory, HandlerState, Step,
};
use ravel::metrics::WorkerMetrics;
use ravel::pool::RequestPool;
use ravel::request::RequestDescriptor;
use ravel::resolver::{
    AccessEntry, AccessLogger, BindInfo, ConfigEntry, ServerContext, SingleEntryResolver,
    VirtualHost,
};
use ravel::socket::{IoStatus, Socket};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

pub enum ReadEvent {
    Data(Vec<u8>),
    Block,
    Eof,
}

/// Transport driven by a script: reads come from `reads`, writes are
/// capped by `write_caps` (0 = would-block once; an exhausted list
/// accepts everything).
pub struct ScriptSocket {
    pub reads: VecDeque<ReadEvent>,
    pub write_caps: VecDeque<usize>,
    pub wrote: Vec<u8>,
    pub shut: bool,
}

impl ScriptSocket {
    pub fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            write_caps: VecDeque::new(),
            wrote: Vec::new(),
            shut: false,
        }
    }

    pub fn with_request(raw: &[u8]) -> Self {
        let mut s = Self::new();
        s.reads.push_back(ReadEvent::Data(raw.to_vec()));
        s
    }

    pub fn push_data(&mut self, raw: &[u8]) {
        self.reads.push_back(ReadEvent::Data(raw.to_vec()));
    }

    pub fn wrote_str(&self) -> String {
        String::from_utf8_lossy(&self.wrote).into_owned()
    }
}

impl Socket for ScriptSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<IoStatus> {
        match self.reads.pop_front() {
            Some(ReadEvent::Data(chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.reads.push_front(ReadEvent::Data(chunk[n..].to_vec()));
                }
                Ok(IoStatus::Ready(n))
            }
            Some(ReadEvent::Block) | None => Ok(IoStatus::WouldBlock),
            Some(ReadEvent::Eof) => Ok(IoStatus::Eof),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<IoStatus> {
        match self.write_caps.pop_front() {
            Some(0) => Ok(IoStatus::WouldBlock),
            Some(cap) => {
                let n = cap.min(buf.len());
                self.wrote.extend_from_slice(&buf[..n]);
                Ok(IoStatus::Ready(n))
            }
            None => {
                self.wrote.extend_from_slice(buf);
                Ok(IoStatus::Ready(buf.len()))
            }
        }
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shut = true;
        Ok(())
    }
}

pub struct Bytes(pub Vec<u8>);

impl CacheEntry for Bytes {
    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Handler producing a scripted sequence of body chunks with no
/// declared length, the shape of a CGI-style backend.
pub struct Streamer {
    chunks: VecDeque<Vec<u8>>,
}

impl Handler for Streamer {
    fn init(&mut self, _req: &mut RequestDescriptor) -> Result<HandlerState, u16> {
        Ok(HandlerState::Done)
    }

    fn add_headers(&mut self, req: &mut RequestDescriptor) {
        req.reply_status = 200;
        // length intentionally unknown
    }

    fn step(&mut self, _req: &mut RequestDescriptor, out: &mut Vec<u8>) -> Result<Step, u16> {
        match self.chunks.pop_front() {
            Some(chunk) => {
                out.extend_from_slice(&chunk);
                Ok(Step::Data)
            }
            None => Ok(Step::Done),
        }
    }
}

pub struct StreamerFactory {
    pub chunks: Vec<Vec<u8>>,
}

impl HandlerFactory for StreamerFactory {
    fn create(&self, _req: &RequestDescriptor) -> Box<dyn Handler> {
        Box::new(Streamer {
            chunks: self.chunks.iter().cloned().collect(),
        })
    }
}

#[derive(Default)]
pub struct CollectingLogger {
    pub entries: Mutex<Vec<(u64, String, String, u16)>>,
}

impl AccessLogger for CollectingLogger {
    fn log(&self, entry: &AccessEntry<'_>) {
        self.entries.lock().unwrap().push((
            entry.id,
            entry.path.to_string(),
            entry.query.to_string(),
            entry.status,
        ));
    }
}

pub struct Fixture {
    pub server: ServerContext,
    pub vhost: Arc<VirtualHost>,
    pub pool: RequestPool,
    pub metrics: WorkerMetrics,
}

pub fn fixture(entry: ConfigEntry) -> Fixture {
    fixture_with(entry, ServerConfig::default(), None)
}

pub fn fixture_with(
    entry: ConfigEntry,
    config: ServerConfig,
    logger: Option<Arc<dyn AccessLogger>>,
) -> Fixture {
    let vhost = Arc::new(VirtualHost::new("default", "/var/www"));
    let server = ServerContext {
        config,
        resolver: Box::new(SingleEntryResolver::new(vhost.clone(), Arc::new(entry))),
        logger,
        bind: Arc::new(BindInfo {
            addr: "127.0.0.1".into(),
            port: 8080,
            secure: false,
        }),
    };
    Fixture {
        server,
        vhost,
        pool: RequestPool::new(8),
        metrics: WorkerMetrics::new(),
    }
}

pub fn content_entry(body: &[u8]) -> ConfigEntry {
    let mut entry = ConfigEntry::new();
    entry.handler = Some(Arc::new(ContentHandlerFactory::new(Arc::new(Bytes(
        body.to_vec(),
    )))));
    entry
}

pub fn drive_at(
    conn: &mut Connection<ScriptSocket>,
    fx: &mut Fixture,
    now_ms: u64,
) -> Disposition {
    let mut ctx = EngineCtx {
        server: &fx.server,
        pool: &mut fx.pool,
        metrics: &fx.metrics,
        now_ms,
        worker_id: 0,
    };
    conn.advance(&mut ctx)
}

pub fn drive(conn: &mut Connection<ScriptSocket>, fx: &mut Fixture) -> Disposition {
    drive_at(conn, fx, 1_000)
}

pub fn wrote(conn: &Connection<ScriptSocket>) -> String {
    conn.socket.as_ref().unwrap().wrote_str()
}
