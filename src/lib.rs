// src/lib.rs
//
// ravel: the per-connection lifecycle engine of a non-blocking HTTP
// server. Connections move through a phase machine, request state lives
// in pooled descriptors, and traffic is accounted and shaped per
// connection.

pub mod clock;
pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
pub mod header;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod request;
pub mod resolver;
pub mod server;
pub mod slab;
pub mod socket;
pub mod syscalls;
pub mod traffic;
pub mod worker;

pub use config::ServerConfig;
pub use conn::{Connection, Disposition, EngineCtx};
pub use error::{EngineError, RavelResult};
pub use pool::RequestPool;
pub use request::{Phase, RequestDescriptor};
pub use server::Server;
pub use socket::{IoStatus, Socket};
