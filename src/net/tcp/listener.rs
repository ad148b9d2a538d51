//! The listening socket and the admission path.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use mio::Interest;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use super::{
    TransportServer,
    config::TransportConfig,
    connection::{Connection, Stream},
    reader,
};
use crate::{
    error::{Result, TransportError},
    event::{CloseReason, TransportEvent},
    poll::LISTENER,
};

const UNBLOCK_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

enum ListenerSocket {
    Polled(mio::net::TcpListener),
    Blocking(StdTcpListener),
}

/// The server socket: bound on all IPv4 interfaces with SO_REUSEADDR.
pub struct Listener {
    socket: ListenerSocket,
    local_addr: SocketAddr,
    endpoint_url: String,
    accept_pending: AtomicBool,
}

impl Listener {
    /// Creates, binds and listens the server socket.
    ///
    /// With a poll registry the socket is made non-blocking and registered
    /// for readability; otherwise it stays blocking for the acceptor thread.
    /// Any failure drops the partially set up socket.
    pub fn bind(
        config: &TransportConfig,
        port: u16,
        poll_registry: Option<&mio::Registry>,
    ) -> Result<Self> {
        let bind_error = |source: io::Error| TransportError::Bind { port, source };

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&addr.into()).map_err(bind_error)?;
        socket
            .listen(config.effective_backlog())
            .map_err(bind_error)?;

        let listener: StdTcpListener = socket.into();
        let local_addr = listener.local_addr().map_err(bind_error)?;
        let endpoint_url = format!("opc.tcp://{}:{}/", config.hostname, local_addr.port());

        let socket = match poll_registry {
            Some(registry) => {
                listener.set_nonblocking(true).map_err(bind_error)?;
                let mut listener = mio::net::TcpListener::from_std(listener);
                registry
                    .register(&mut listener, LISTENER, Interest::READABLE)
                    .map_err(bind_error)?;
                ListenerSocket::Polled(listener)
            }
            None => ListenerSocket::Blocking(listener),
        };

        info!(%local_addr, %endpoint_url, "listener bound");
        Ok(Self {
            socket,
            local_addr,
            endpoint_url,
            accept_pending: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Whether clients were left in the backlog because the server was full.
    pub(crate) fn accept_pending(&self) -> bool {
        self.accept_pending.load(Ordering::Acquire)
    }

    fn accept(&self, server: &TransportServer) -> io::Result<(Stream, SocketAddr)> {
        match &self.socket {
            ListenerSocket::Polled(listener) => {
                let (stream, peer) = listener.accept()?;
                Ok((Stream::Polled(stream), peer))
            }
            ListenerSocket::Blocking(listener) => {
                let (stream, peer) = listener.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_write_timeout(Some(server.config().send_timeout()))?;
                Ok((Stream::Blocking(stream), peer))
            }
        }
    }

    /// Single-loop accept: admits clients while capacity remains.
    ///
    /// Stops on `WouldBlock` or on the first accept error. When the server is
    /// full nothing is done to the socket; the pending flag tells the event
    /// loop to come back once a slot frees.
    pub(crate) fn accept_ready(&self, server: &Arc<TransportServer>) {
        let max = server.config().max_connections;
        loop {
            if !server.registry().has_capacity(max) {
                if !self.accept_pending.swap(true, Ordering::AcqRel) {
                    let open = server.registry().len();
                    debug!(open, ?max, "connection limit reached, deferring accept");
                    server.events().publish(TransportEvent::CapacityReached {
                        open,
                        max: max.unwrap_or(open),
                    });
                }
                return;
            }

            match self.accept(server) {
                Ok((stream, peer_addr)) => admit(server, stream, peer_addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.accept_pending.store(false, Ordering::Release);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    report_accept_error(server, e);
                    return;
                }
            }
        }
    }

    /// Thread-per-connection accept loop. Runs on the acceptor thread until
    /// shutdown begins.
    pub(crate) fn run_acceptor(&self, server: &Arc<TransportServer>) {
        let max = server.config().max_connections;
        info!(endpoint_url = %self.endpoint_url, "acceptor started");

        while !server.is_shutting_down() {
            if !server.registry().has_capacity(max) {
                let open = server.registry().len();
                debug!(open, ?max, "connection limit reached, waiting for a free slot");
                server.events().publish(TransportEvent::CapacityReached {
                    open,
                    max: max.unwrap_or(open),
                });
            }
            if !server
                .registry()
                .wait_for_capacity(max, || server.is_shutting_down())
            {
                break;
            }

            match self.accept(server) {
                Ok((stream, peer_addr)) => {
                    if server.is_shutting_down() {
                        debug!(%peer_addr, "dropping client accepted during shutdown");
                        break;
                    }
                    admit(server, stream, peer_addr);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    report_accept_error(server, e);
                    accept_error_backoff(server);
                }
            }

            server.reap_readers();
        }
        info!("acceptor stopped");
    }

    /// Wakes an acceptor blocked in `accept` by connecting to ourselves.
    pub(crate) fn unblock(&self) {
        if !matches!(self.socket, ListenerSocket::Blocking(_)) {
            return;
        }
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        if let Err(e) = StdTcpStream::connect_timeout(&addr, UNBLOCK_CONNECT_TIMEOUT) {
            debug!(error = %e, "acceptor unblock connect failed");
        }
    }
}

/// Pauses the acceptor after a failed accept so a persistent error (EMFILE)
/// does not spin. Returns early once shutdown begins.
fn accept_error_backoff(server: &TransportServer) {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while waited < ACCEPT_ERROR_BACKOFF && !server.is_shutting_down() {
        thread::sleep(step);
        waited += step;
    }
}

fn report_accept_error(server: &TransportServer, source: io::Error) {
    let error = TransportError::Accept(source);
    warn!(%error, "accept failed");
    server.events().publish(TransportEvent::AcceptFailed {
        error: error.to_string(),
    });
}

/// Builds a connection for an accepted socket, registers it and starts its
/// reader according to the execution mode.
fn admit(server: &Arc<TransportServer>, mut stream: Stream, peer_addr: SocketAddr) {
    let config = server.config();
    let handle = server.registry().next_handle();

    if let Err(e) = stream.set_nodelay(config.no_delay) {
        warn!(%handle, error = %e, "failed to set TCP_NODELAY");
    }

    if let (Some(registry), Stream::Polled(polled)) = (server.poll_registry(), &mut stream) {
        if let Err(e) = registry.register(polled, handle.token(), Interest::READABLE) {
            error!(%handle, %peer_addr, error = %e, "failed to register connection");
            report_accept_error(server, e);
            return;
        }
    }

    let connection = Arc::new(Connection::new(
        handle,
        stream,
        peer_addr,
        config.buffers,
        server.endpoint_url().to_string(),
        config.send_timeout(),
        Arc::clone(server.events()),
    ));
    connection.open();
    server.registry().add(Arc::clone(&connection));
    // shutdown may have closed the registry's connections before this one joined
    if server.is_shutting_down() {
        connection.begin_close(CloseReason::ServerShutdown);
    }

    info!(%handle, %peer_addr, open = server.registry().len(), "connection established");
    server
        .events()
        .publish(TransportEvent::ConnectionEstablished { handle, peer_addr });

    if let Err(e) = server.processor().on_connect(&connection) {
        warn!(%handle, error = %e, "processor on_connect failed");
    }

    if server.poll_registry().is_none() {
        let reader_server = Arc::clone(server);
        let reader_connection = Arc::clone(&connection);
        let spawned = server.supervisor().spawn_reader(handle, move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                reader::run(&reader_server, &reader_connection)
            }));
            if let Err(payload) = outcome {
                error!(%handle, "reader panicked, reclaiming connection");
                reader_server.reclaim(handle);
                panic::resume_unwind(payload);
            }
        });
        if let Err(e) = spawned {
            error!(%handle, error = %e, "failed to start reader thread");
            connection.begin_close(CloseReason::ReadError);
            reader::run(server, &connection);
        }
    }
}
