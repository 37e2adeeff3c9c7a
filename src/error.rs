// src/error.rs
use std::io;
use thiserror::Error;

/// Central error type for the ravel engine.
///
/// Only infrastructure failures surface here. HTTP-level problems
/// (malformed request, auth rejection, missing handler) never do: they
/// are recorded as a status code on the request descriptor and routed
/// through the error-handler path so the client still receives a
/// well-formed response.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to bind or configure a listener socket.
    #[error("failed to bind listener on {addr}: {source}")]
    Listen { addr: String, source: io::Error },

    /// Event poller (epoll/kqueue) failure.
    #[error("event poller error: {0}")]
    Poll(io::Error),

    /// Connection arena reached its maximum capacity.
    #[error("connection arena is full")]
    ArenaFull,

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type RavelResult<T> = Result<T, EngineError>;
