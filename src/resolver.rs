// src/resolver.rs
//
// Routing collaborators: virtual hosts, resolved config entries and
// the resolver contract mapping (host, path) onto them. All of it is
// read-only after startup, so workers share it through `Arc` without
// synchronization.

use crate::config::ServerConfig;
use crate::handler::{AuthScheme, EncoderFactory, HandlerFactory, ValidatorFactory};
use crate::header::Method;
use crate::socket::Socket;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const MAX_CAPTURES: usize = 10;

/// Fixed-capacity span slots filled by the resolver's pattern match.
/// Two independent instances per request: path and host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureSlots {
    spans: [(u32, u32); MAX_CAPTURES],
    len: u8,
}

impl CaptureSlots {
    pub fn push(&mut self, start: u32, end: u32) {
        if (self.len as usize) < MAX_CAPTURES {
            self.spans[self.len as usize] = (start, end);
            self.len += 1;
        }
    }

    pub fn get(&self, idx: usize) -> Option<(u32, u32)> {
        if idx < self.len as usize {
            Some(self.spans[idx])
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clean(&mut self) {
        self.len = 0;
    }
}

/// Content expiration policy attached to a config entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    #[default]
    None,
    /// Already expired; forbid caching.
    Epoch,
    /// Cache as long as the protocol allows.
    Max,
    /// Expire after the given number of seconds.
    Secs(u64),
}

/// Secure-transport driver, present only on secure binds. Runs the
/// handshake incrementally against the non-blocking socket.
pub trait TlsDriver: Send {
    fn drive(&mut self, sock: &mut dyn Socket) -> io::Result<TlsStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    Complete,
    WouldBlock,
}

/// One finished transaction, handed to the access logger.
pub struct AccessEntry<'a> {
    pub id: u64,
    pub method: Method,
    /// Pre-rewrite path, so internal redirects log what the client sent.
    pub path: &'a str,
    pub query: &'a str,
    pub status: u16,
    pub rx: u64,
    pub tx: u64,
}

pub trait AccessLogger: Send + Sync {
    fn log(&self, entry: &AccessEntry<'_>);
}

/// Listener identity a connection was accepted on.
#[derive(Debug, Clone)]
pub struct BindInfo {
    pub addr: String,
    pub port: u16,
    pub secure: bool,
}

pub struct VirtualHost {
    pub name: String,
    pub root: String,
    pub logger: Option<Arc<dyn AccessLogger>>,
    rx: AtomicU64,
    tx: AtomicU64,
}

impl VirtualHost {
    pub fn new(name: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            logger: None,
            rx: AtomicU64::new(0),
            tx: AtomicU64::new(0),
        }
    }

    /// Roll up a connection's partial counters at the accounting
    /// boundary. Atomics because every worker's connections feed the
    /// same host.
    pub fn add_traffic(&self, rx: u64, tx: u64) {
        if rx > 0 {
            self.rx.fetch_add(rx, Ordering::Relaxed);
        }
        if tx > 0 {
            self.tx.fetch_add(tx, Ordering::Relaxed);
        }
    }

    pub fn traffic(&self) -> (u64, u64) {
        (self.rx.load(Ordering::Relaxed), self.tx.load(Ordering::Relaxed))
    }
}

/// Policy and collaborator factories resolved for one request.
#[derive(Default)]
pub struct ConfigEntry {
    pub handler: Option<Arc<dyn HandlerFactory>>,
    pub encoder: Option<Arc<dyn EncoderFactory>>,
    pub validator: Option<Arc<dyn ValidatorFactory>>,
    pub auth_realm: Option<String>,
    pub auth_type: AuthScheme,
    /// `None` allows every method.
    pub allowed_methods: Option<Vec<Method>>,
    pub secure_only: bool,
    /// Outbound cap for connections routed here, bytes/second. 0 = off.
    pub limit_bps: u32,
    pub document_root: Option<String>,
    /// Custom error document served via internal redirect.
    pub error_document: Option<String>,
    pub expiration: Expiration,
    pub keepalive: bool,
}

impl ConfigEntry {
    pub fn new() -> Self {
        Self {
            keepalive: true,
            ..Default::default()
        }
    }
}

pub struct Resolution {
    pub vhost: Arc<VirtualHost>,
    pub entry: Arc<ConfigEntry>,
    pub captures: CaptureSlots,
    pub host_captures: CaptureSlots,
}

/// Maps (host, path) to a virtual host and config entry. Internals
/// (regex tables, vhost trees) are not this engine's concern.
pub trait ConfigResolver: Send + Sync {
    fn resolve(&self, host: &str, path: &str) -> Resolution;
}

/// Resolver that routes everything to one vhost/entry. The default for
/// single-site servers and the workhorse of the test suite.
pub struct SingleEntryResolver {
    vhost: Arc<VirtualHost>,
    entry: Arc<ConfigEntry>,
}

impl SingleEntryResolver {
    pub fn new(vhost: Arc<VirtualHost>, entry: Arc<ConfigEntry>) -> Self {
        Self { vhost, entry }
    }
}

impl ConfigResolver for SingleEntryResolver {
    fn resolve(&self, _host: &str, _path: &str) -> Resolution {
        Resolution {
            vhost: self.vhost.clone(),
            entry: self.entry.clone(),
            captures: CaptureSlots::default(),
            host_captures: CaptureSlots::default(),
        }
    }
}

/// Read-only startup state shared by all workers.
pub struct ServerContext {
    pub config: ServerConfig,
    pub resolver: Box<dyn ConfigResolver>,
    pub logger: Option<Arc<dyn AccessLogger>>,
    pub bind: Arc<BindInfo>,
}
