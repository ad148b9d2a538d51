use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use mio::Events;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, TransportError},
    event::{CloseReason, TransportEvent},
    net::tcp::{
        TransportServer,
        connection::{Connection, ConnectionHandle},
        reader,
    },
    poll::{LISTENER, PollHandle, WAKER},
};

/// The single-loop execution model: one thread services the listener, every
/// connection and the caller's periodic work.
pub struct EventLoop {
    server: Arc<TransportServer>,
    poll_handle: PollHandle,
    events: Events,
}

impl EventLoop {
    pub(crate) fn new(server: Arc<TransportServer>, poll_handle: PollHandle) -> Self {
        let events = Events::with_capacity(server.config().events_capacity);
        Self {
            server,
            poll_handle,
            events,
        }
    }

    /// Runs until the server shuts down.
    ///
    /// Every wait gets its own copy of `timeout`. A wait that returns without
    /// any readiness counts as a timeout and calls `worker(context)` exactly
    /// once; worker errors are reported and the loop continues. When the loop
    /// exits, every remaining connection is torn down.
    pub fn run<C, W>(&mut self, timeout: Duration, mut worker: W, context: &mut C) -> Result<()>
    where
        W: FnMut(&mut C) -> anyhow::Result<()>,
    {
        info!(endpoint_url = %self.server.endpoint_url(), ?timeout, "event loop started");

        let result = self.run_until_shutdown(timeout, &mut worker, context);

        for connection in self.server.registry().snapshot() {
            connection.begin_close(CloseReason::ServerShutdown);
            reader::run(&self.server, &connection);
        }
        info!("event loop stopped");
        result
    }

    fn run_until_shutdown<C, W>(
        &mut self,
        timeout: Duration,
        worker: &mut W,
        context: &mut C,
    ) -> Result<()>
    where
        W: FnMut(&mut C) -> anyhow::Result<()>,
    {
        let mut ready: Vec<ConnectionHandle> = Vec::new();

        while !self.server.is_shutting_down() {
            match self.poll_handle.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Poll(e)),
            }

            if self.events.is_empty() {
                if let Err(e) = worker(context) {
                    warn!(error = %e, "periodic worker failed");
                    self.server.events().publish(TransportEvent::WorkerFailed {
                        error: e.to_string(),
                    });
                }
                continue;
            }

            let mut listener_ready = false;
            ready.clear();
            for event in self.events.iter() {
                match event.token() {
                    LISTENER => listener_ready = true,
                    WAKER => {}
                    token => ready.push(ConnectionHandle(token.0)),
                }
            }

            if listener_ready {
                self.server.listener().accept_ready(&self.server);
            }

            for handle in ready.drain(..) {
                match self.server.registry().find(handle) {
                    Some(connection) => self.dispatch(&connection),
                    None => debug!(%handle, "readiness for a connection that is gone"),
                }
            }

            let listener = self.server.listener();
            if listener.accept_pending()
                && self
                    .server
                    .registry()
                    .has_capacity(self.server.config().max_connections)
            {
                listener.accept_ready(&self.server);
            }
        }
        Ok(())
    }

    /// Runs the connection's reader. A panic in the processor only costs that
    /// connection.
    fn dispatch(&self, connection: &Arc<Connection>) {
        let server = &self.server;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| reader::run(server, connection)));
        if outcome.is_err() {
            let handle = connection.handle();
            error!(%handle, "reader panicked, reclaiming connection");
            server.reclaim(handle);
        }
    }
}
