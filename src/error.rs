use std::{io, result::Result as StdResult};

use thiserror::Error;

use crate::net::tcp::{config::ExecutionMode, connection::ConnectionHandle};

pub type Result<T> = StdResult<T, TransportError>;

/// Errors surfaced by the transport layer.
///
/// Startup failures (`Bind`, `UnsupportedConfiguration`, `Poll`) are fatal and
/// returned from [`TransportServer::initialize`](crate::TransportServer::initialize).
/// Per-connection failures only ever lead to that connection's teardown.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("read failed on connection {handle}: {source}")]
    Read {
        handle: ConnectionHandle,
        #[source]
        source: io::Error,
    },

    #[error("write failed on connection {handle} after {written} of {total} bytes: {source}")]
    Write {
        handle: ConnectionHandle,
        written: usize,
        total: usize,
        #[source]
        source: io::Error,
    },

    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionHandle),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("operation requires {expected:?} mode but the server runs in {actual:?} mode")]
    ModeMismatch {
        expected: ExecutionMode,
        actual: ExecutionMode,
    },

    #[error("the event loop has already been taken")]
    EventLoopUnavailable,

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("{0} transport thread(s) panicked")]
    WorkerPanicked(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}
