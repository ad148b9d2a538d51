//! Per-client transport state.
//!
//! A [`Connection`] owns the accepted socket, its buffer policy and endpoint
//! identity. The state machine only moves forward:
//!
//! ```text
//! CLOSED ──open()──▶ OPEN ──begin_close()──▶ CLOSING ──release()──▶ CLOSED (released)
//! ```
//!
//! The socket lives behind an `RwLock<Option<Stream>>`: reads, writes and
//! `shutdown` share it, `release` takes it exclusively (after acquiring the
//! write gate) so a write can never overlap the close.

use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use mio::Token;
use tracing::{debug, trace};

use super::{config::BufferConfig, writer};
use crate::{
    error::Result,
    event::{CloseReason, EventBus},
};

/// Identifier of a connection, unique for the lifetime of a server.
///
/// In single-loop mode it doubles as the readiness token of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub usize);

impl ConnectionHandle {
    pub fn token(&self) -> Token {
        Token(self.0)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Closed = 0,
    Open = 1,
    Closing = 2,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// The accepted socket, in the flavor matching the execution mode.
pub(crate) enum Stream {
    /// Non-blocking, registered with the event loop's poller.
    Polled(mio::net::TcpStream),
    /// Blocking, owned by a dedicated reader thread.
    Blocking(std::net::TcpStream),
}

impl Stream {
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Polled(stream) => {
                let mut stream: &mio::net::TcpStream = stream;
                stream.read(buf)
            }
            Stream::Blocking(stream) => {
                let mut stream: &std::net::TcpStream = stream;
                stream.read(buf)
            }
        }
    }

    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Polled(stream) => {
                let mut stream: &mio::net::TcpStream = stream;
                stream.write(buf)
            }
            Stream::Blocking(stream) => {
                let mut stream: &std::net::TcpStream = stream;
                stream.write(buf)
            }
        }
    }

    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Polled(stream) => stream.shutdown(Shutdown::Both),
            Stream::Blocking(stream) => stream.shutdown(Shutdown::Both),
        }
    }

    pub(crate) fn set_nodelay(&self, enabled: bool) -> io::Result<()> {
        match self {
            Stream::Polled(stream) => stream.set_nodelay(enabled),
            Stream::Blocking(stream) => stream.set_nodelay(enabled),
        }
    }

    pub(crate) fn is_nonblocking(&self) -> bool {
        matches!(self, Stream::Polled(_))
    }
}

/// A single accepted client socket and its transport state.
pub struct Connection {
    handle: ConnectionHandle,
    state: AtomicU8,
    released: AtomicBool,
    local_config: BufferConfig,
    remote_config: Mutex<BufferConfig>,
    local_endpoint_url: String,
    remote_endpoint_url: String,
    peer_addr: SocketAddr,
    stream: RwLock<Option<Stream>>,
    write_gate: Mutex<()>,
    close_reason: Mutex<Option<CloseReason>>,
    send_timeout: Duration,
    events: Arc<EventBus>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        handle: ConnectionHandle,
        stream: Stream,
        peer_addr: SocketAddr,
        local_config: BufferConfig,
        local_endpoint_url: String,
        send_timeout: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            handle,
            state: AtomicU8::new(ConnectionState::Closed as u8),
            released: AtomicBool::new(false),
            local_config,
            remote_config: Mutex::new(BufferConfig::unnegotiated()),
            local_endpoint_url,
            remote_endpoint_url: peer_addr.to_string(),
            peer_addr,
            stream: RwLock::new(Some(stream)),
            write_gate: Mutex::new(()),
            close_reason: Mutex::new(None),
            send_timeout,
            events,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_closing(&self) -> bool {
        self.state() == ConnectionState::Closing
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_config(&self) -> &BufferConfig {
        &self.local_config
    }

    pub fn remote_config(&self) -> BufferConfig {
        *self
            .remote_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the buffer sizes negotiated with the peer by the upper layer.
    pub fn set_remote_config(&self, config: BufferConfig) {
        *self
            .remote_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn local_endpoint_url(&self) -> &str {
        &self.local_endpoint_url
    }

    pub fn remote_endpoint_url(&self) -> &str {
        &self.remote_endpoint_url
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the whole message to the peer. See [`writer::write_all`].
    pub fn write_all(&self, message: &[u8]) -> Result<()> {
        writer::write_all(self, message)
    }

    /// Asks the transport to close this connection.
    ///
    /// The socket is shut down immediately; the connection's reader performs
    /// the teardown when it observes the closed socket.
    pub fn close(&self) {
        self.begin_close(CloseReason::Requested);
    }

    pub(crate) fn open(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Closed as u8,
            ConnectionState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Moves the connection to CLOSING and shuts the socket down so a blocked
    /// reader wakes up. Only the first call records its reason; returns
    /// whether this call initiated the close.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        let released = &self.released;
        let initiated = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match ConnectionState::from(state) {
                    ConnectionState::Open => Some(ConnectionState::Closing as u8),
                    ConnectionState::Closed if !released.load(Ordering::Acquire) => {
                        Some(ConnectionState::Closing as u8)
                    }
                    _ => None,
                }
            })
            .is_ok();

        if initiated {
            debug!(handle = %self.handle, ?reason, "closing connection");
            *self
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(reason);

            let stream = self.stream.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(stream) = stream.as_ref() {
                if let Err(e) = stream.shutdown() {
                    trace!(handle = %self.handle, error = %e, "socket shutdown on close");
                }
            }
        }
        initiated
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream.read().unwrap_or_else(PoisonError::into_inner);
        match stream.as_ref() {
            Some(stream) => stream.read(buf),
            None => Ok(0),
        }
    }

    /// Takes the socket out of the connection, exactly once.
    ///
    /// Waits for an in-flight write to finish, deregisters the socket from the
    /// poller when one is given, shuts it down and closes it. Returns `false`
    /// when the connection was already released.
    pub(crate) fn release(&self, poll_registry: Option<&mio::Registry>) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        let _gate = self.lock_writes();
        let stream = self
            .stream
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut stream) = stream {
            if let (Some(registry), Stream::Polled(polled)) = (poll_registry, &mut stream) {
                if let Err(e) = registry.deregister(polled) {
                    trace!(handle = %self.handle, error = %e, "deregister on release");
                }
            }
            if let Err(e) = stream.shutdown() {
                trace!(handle = %self.handle, error = %e, "socket shutdown on release");
            }
            drop(stream);
        }

        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stream(&self) -> &RwLock<Option<Stream>> {
        &self.stream
    }

    pub(crate) fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }
}
