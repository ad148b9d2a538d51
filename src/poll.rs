use std::{io, sync::Arc, time::Duration};

use mio::{Events, Poll, Registry, Token, Waker};

use crate::error::{Result, TransportError};

/// Readiness token of the listening socket.
pub const LISTENER: Token = Token(0);
/// Readiness token used to interrupt a wait on shutdown.
pub const WAKER: Token = Token(1);

/// The OS readiness multiplexer of the single-loop mode.
pub struct PollHandle {
    poller: Poll,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new() -> Result<Self> {
        let poller = Poll::new().map_err(TransportError::Poll)?;
        let waker = Waker::new(poller.registry(), WAKER).map_err(TransportError::Poll)?;
        Ok(PollHandle {
            poller,
            waker: Arc::new(waker),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poller.registry()
    }

    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Waits for readiness. `timeout` is passed by value, so every call gets
    /// a fresh copy regardless of what the previous wait consumed.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poller.poll(events, timeout)
    }
}
