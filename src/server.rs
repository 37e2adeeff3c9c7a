// src/server.rs
use crate::config::ServerConfig;
use crate::error::{EngineError, RavelResult};
use crate::metrics::WorkerMetrics;
use crate::resolver::{AccessLogger, BindInfo, ConfigResolver, ServerContext};
use crate::worker::Worker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// The engine's front door: wires config, resolver and logger into a
/// shared context, then runs one pinned worker per core until SIGINT.
pub struct Server {
    config: ServerConfig,
    resolver: Option<Box<dyn ConfigResolver>>,
    logger: Option<Arc<dyn AccessLogger>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            resolver: None,
            logger: None,
        }
    }

    pub fn resolver(mut self, resolver: Box<dyn ConfigResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn AccessLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn serve(self) -> RavelResult<()> {
        self.config.validate()?;
        let Some(resolver) = self.resolver else {
            return Err(EngineError::Config("a resolver is required".into()));
        };

        let workers = self.config.effective_workers();
        let bind = Arc::new(BindInfo {
            addr: self.config.host.clone(),
            port: self.config.port,
            secure: false,
        });
        let server = Arc::new(ServerContext {
            config: self.config,
            resolver,
            logger: self.logger,
            bind,
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_signal = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("SIGINT received, shutting down");
            shutdown_signal.store(true, Ordering::SeqCst);
        })
        .map_err(|e| EngineError::Config(format!("signal handler: {e}")))?;

        // One instance per worker: pool snapshots are stores, so a
        // shared instance would let workers clobber each other.
        let metrics: Vec<Arc<WorkerMetrics>> =
            (0..workers).map(|_| Arc::new(WorkerMetrics::new())).collect();
        let reporter_metrics = metrics.clone();
        let reporter_shutdown = shutdown.clone();
        thread::Builder::new()
            .name("ravel-metrics".to_string())
            .spawn(move || {
                while !reporter_shutdown.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_secs(5));
                    if reporter_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let mut active = 0;
                    let mut requests = 0;
                    let mut rx = 0;
                    let mut tx = 0;
                    let mut pool_hits = 0;
                    for m in &reporter_metrics {
                        active += m.active_conns.load(Ordering::Relaxed);
                        requests += m.req_count.load(Ordering::Relaxed);
                        rx += m.bytes_rx.load(Ordering::Relaxed);
                        tx += m.bytes_tx.load(Ordering::Relaxed);
                        pool_hits += m.pool_hits.load(Ordering::Relaxed);
                    }
                    tracing::info!(active, requests, rx, tx, pool_hits, "engine stats");
                }
            })
            .ok();

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        tracing::info!(
            workers,
            host = %server.config.host,
            port = server.config.port,
            "starting workers"
        );

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let server = server.clone();
            let shutdown = shutdown.clone();
            let metrics = metrics[i].clone();

            let handle = thread::Builder::new()
                .name(format!("ravel-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, core = id.id, "pinned");
                        } else {
                            tracing::warn!(worker = i, core = id.id, "pinning failed");
                        }
                    }
                    let mut worker = Worker::new(i, server, metrics);
                    if let Err(e) = worker.run(shutdown) {
                        tracing::error!(worker = i, error = %e, "worker failed");
                    }
                })?;
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }

        tracing::info!("server shut down");
        Ok(())
    }
}
