// src/worker.rs
//
// Per-core event loop. Every worker owns a SO_REUSEPORT listener, an
// edge-triggered poller, a connection arena and a descriptor pool; the
// kernel spreads accepts across workers so nothing is shared hot.

use crate::clock;
use crate::conn::{Connection, Disposition, EngineCtx};
use crate::error::RavelResult;
use crate::metrics::WorkerMetrics;
use crate::pool::RequestPool;
use crate::resolver::ServerContext;
use crate::slab::ConnectionSlab;
use crate::socket::TcpSocket;
use crate::syscalls::{self, EPOLLIN, EPOLLOUT, Epoll, epoll_event};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const LISTENER_TOKEN: u64 = u64::MAX;
const EVENT_BATCH: usize = 1024;
const POLL_TICK_MS: i32 = 100;

pub struct Worker {
    id: usize,
    server: Arc<ServerContext>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    pub fn new(id: usize, server: Arc<ServerContext>, metrics: Arc<WorkerMetrics>) -> Self {
        Self {
            id,
            server,
            metrics,
        }
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> RavelResult<()> {
        let config = &self.server.config;
        let listen_fd = syscalls::create_listener(&config.host, config.port)?;
        let epoll = Epoll::new()?;
        epoll.add(listen_fd, LISTENER_TOKEN, EPOLLIN)?;

        let mut slab: ConnectionSlab<TcpSocket> = ConnectionSlab::new(config.arena_capacity);
        let mut pool = RequestPool::new(config.pool_capacity);
        let mut events = vec![epoll_event { events: 0, u64: 0 }; EVENT_BATCH];

        tracing::info!(worker = self.id, host = %config.host, port = config.port, "worker online");

        let mut last_sweep = clock::now_ms();

        while !shutdown.load(Ordering::Acquire) {
            let n = match epoll.wait(&mut events, POLL_TICK_MS) {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "poll failed");
                    continue;
                }
            };
            let now = clock::now_ms();

            for event in &events[..n] {
                let token = event.u64;
                if token == LISTENER_TOKEN {
                    self.accept_burst(listen_fd, &epoll, &mut slab, &mut pool, now);
                    continue;
                }

                let idx = token as usize;
                let writable = event.events & EPOLLOUT as u32 != 0;
                let Some(conn) = slab.get_mut(idx) else {
                    continue;
                };
                // Rate-shaped connections stay parked until the sweep.
                if conn.wake_at.is_some_and(|w| w > now) {
                    continue;
                }

                let mut ctx = EngineCtx {
                    server: &self.server,
                    pool: &mut pool,
                    metrics: &self.metrics,
                    now_ms: now,
                    worker_id: self.id,
                };
                let disposition = if writable {
                    conn.on_writable(&mut ctx)
                } else {
                    conn.on_readable(&mut ctx)
                };
                self.apply(disposition, idx, &epoll, &mut slab, &mut pool);
            }

            let now = clock::now_ms();
            if now.saturating_sub(last_sweep) >= POLL_TICK_MS as u64 {
                self.sweep(now, &epoll, &mut slab, &mut pool);
                last_sweep = now;
                let (hits, misses, rejected) = pool.stats();
                self.metrics.record_pool(hits, misses, rejected);
            }
        }

        // Drain: every open connection is torn down, its descriptors
        // recycled (and so cleaned) on the way out.
        for idx in slab.active_tokens() {
            if let Some(fd) = slab.get(idx).and_then(|c| c.socket.as_ref()).map(|s| s.raw_fd()) {
                epoll.delete(fd).ok();
            }
            slab.free(idx, &mut pool);
            self.metrics.dec_conn();
        }
        syscalls::close_fd(listen_fd);
        tracing::info!(worker = self.id, "worker exiting");
        Ok(())
    }

    fn accept_burst(
        &self,
        listen_fd: i32,
        epoll: &Epoll,
        slab: &mut ConnectionSlab<TcpSocket>,
        pool: &mut RequestPool,
        now: u64,
    ) {
        loop {
            let fd = match syscalls::accept_connection(listen_fd) {
                Ok(Some(fd)) => fd,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "accept failed");
                    break;
                }
            };

            let conn = Connection::new(TcpSocket::from_fd(fd));
            let idx = match slab.insert(conn) {
                Ok(idx) => idx,
                // Shed load instead of queueing it.
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "rejecting connection");
                    continue;
                }
            };
            if epoll.add(fd, idx as u64, EPOLLIN).is_err() {
                slab.free(idx, pool);
                continue;
            }
            self.metrics.inc_conn();

            // TCP_DEFER_ACCEPT means data is usually already waiting;
            // drive the new connection before going back to the poller.
            if let Some(conn) = slab.get_mut(idx) {
                conn.update_timeout(now, self.server.config.timeout_header_ms, "header");
                let mut ctx = EngineCtx {
                    server: &self.server,
                    pool: &mut *pool,
                    metrics: &self.metrics,
                    now_ms: now,
                    worker_id: self.id,
                };
                let disposition = conn.on_readable(&mut ctx);
                self.apply(disposition, idx, epoll, slab, pool);
            }
        }
    }

    /// Periodic pass over the arena: resume shaped connections whose
    /// deadline elapsed, close the ones that timed out.
    fn sweep(
        &self,
        now: u64,
        epoll: &Epoll,
        slab: &mut ConnectionSlab<TcpSocket>,
        pool: &mut RequestPool,
    ) {
        for idx in slab.active_tokens() {
            let (awake, timed_out) = match slab.get(idx) {
                Some(c) => (
                    c.wake_at.is_some_and(|w| w <= now),
                    c.timeout_expired(now),
                ),
                None => continue,
            };

            if awake {
                let Some(conn) = slab.get_mut(idx) else {
                    continue;
                };
                let mut ctx = EngineCtx {
                    server: &self.server,
                    pool: &mut *pool,
                    metrics: &self.metrics,
                    now_ms: now,
                    worker_id: self.id,
                };
                let disposition = conn.on_wake(&mut ctx);
                self.apply(disposition, idx, epoll, slab, pool);
            } else if timed_out {
                let Some(conn) = slab.get_mut(idx) else {
                    continue;
                };
                let mut ctx = EngineCtx {
                    server: &self.server,
                    pool: &mut *pool,
                    metrics: &self.metrics,
                    now_ms: now,
                    worker_id: self.id,
                };
                let disposition = conn.on_timeout(&mut ctx);
                self.apply(disposition, idx, epoll, slab, pool);
            }
        }
    }

    fn apply(
        &self,
        disposition: Disposition,
        idx: usize,
        epoll: &Epoll,
        slab: &mut ConnectionSlab<TcpSocket>,
        pool: &mut RequestPool,
    ) {
        let Some(fd) = slab.get(idx).and_then(|c| c.socket.as_ref()).map(|s| s.raw_fd()) else {
            return;
        };
        match disposition {
            Disposition::Readable => {
                let _ = epoll.modify(fd, idx as u64, EPOLLIN);
            }
            Disposition::Writable => {
                let _ = epoll.modify(fd, idx as u64, EPOLLIN | EPOLLOUT);
            }
            Disposition::Sleep(_) => {
                // Keep read interest for peer resets; the sweep resumes
                // the write once the shaping deadline passes.
                let _ = epoll.modify(fd, idx as u64, EPOLLIN);
            }
            Disposition::Close => {
                epoll.delete(fd).ok();
                slab.free(idx, pool);
                self.metrics.dec_conn();
            }
        }
    }
}
