use std::io;

use thiserror::Error;

/// Errors returned by the socket manager and connection handles.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket, selector, or thread setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A connection API was called from a thread that does not own the connection.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// The port already has an acceptor.
    #[error("port {0} is already bound")]
    AlreadyBound(u16),
    /// The manager is shutting down and refuses new work.
    #[error("socket manager is shut down")]
    ShutDown,
    /// Threads did not terminate within the requested bound.
    #[error("timed out waiting for listener threads")]
    Timeout,
    /// System resource limit too low (e.g., RLIMIT_NOFILE).
    #[error("{0}")]
    ResourceLimit(String),
}
