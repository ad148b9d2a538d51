//! TCP transport server with explicit connection lifecycle.
//!
//! A [`TransportServer`] owns the listening socket, the registry of open
//! connections and the threads or poller that service them. It runs in one of
//! two execution modes, fixed at initialization:
//!
//! ```text
//! SingleLoop:
//!    EventLoop (one thread)
//!        ├── LISTENER ready ──> Listener::accept_ready() ──> admit()
//!        ├── Token(handle)  ──> reader::run() ──> ProtocolProcessor::process()
//!        └── timeout        ──> worker(context)
//!
//! ThreadPerConnection:
//!    acceptor thread ──> Listener::run_acceptor() ──> admit()
//!                                                       └── reader thread per connection
//!                                                             └── reader::run() until CLOSING
//! ```
//!
//! ## Connection lifecycle
//!
//! ```text
//! admit():    allocate handle ──> Connection (OPEN) ──> registry.add() ──> on_connect()
//! reader:     read > 0  ──> process()
//!             read == 0 / error / processor error ──> CLOSING
//! teardown(): release socket ──> registry.remove() ──> ConnectionClosed ──> on_disconnect()
//! ```
//!
//! Only a connection's reader performs the teardown, and it runs exactly once.
//! If the reader panics, the connection is reclaimed on the spot (by the event
//! loop, or by the reader thread as it unwinds) and `ReaderPanicked` is
//! published.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//! use ua_transport::{Connection, TransportConfig, TransportServer};
//!
//! let config = TransportConfig::builder().max_connections(32).build();
//! let server = TransportServer::initialize(
//!     config,
//!     4840,
//!     |connection: &Arc<Connection>, data: &[u8]| -> anyhow::Result<()> {
//!         connection.write_all(data)?;
//!         Ok(())
//!     },
//! )?;
//!
//! let mut ticks = 0u64;
//! server.run_event_loop(
//!     Duration::from_millis(100),
//!     |ticks: &mut u64| {
//!         *ticks += 1;
//!         Ok(())
//!     },
//!     &mut ticks,
//! )?;
//! # Ok::<(), ua_transport::TransportError>(())
//! ```

pub mod config;
pub mod connection;
pub mod listener;
pub mod reader;
pub mod registry;
pub mod writer;

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
    },
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    error::{Result, TransportError},
    event::{CloseReason, EventBus, TransportEvent},
    handler::ProtocolProcessor,
    object_pool::BufferPool,
    poll::PollHandle,
    reactor::EventLoop,
    supervisor::Supervisor,
};
use config::{ExecutionMode, TransportConfig};
use connection::{Connection, ConnectionHandle};
use listener::Listener;
use registry::ConnectionRegistry;

const DEFAULT_POOLED_BUFFERS: usize = 16;

/// The transport layer of one server endpoint.
pub struct TransportServer {
    config: TransportConfig,
    listener: Listener,
    registry: ConnectionRegistry,
    processor: Box<dyn ProtocolProcessor>,
    events: Arc<EventBus>,
    buffers: BufferPool,
    supervisor: Supervisor,
    poll_handle: Mutex<Option<PollHandle>>,
    poll_registry: Option<mio::Registry>,
    waker: Option<Arc<mio::Waker>>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

impl TransportServer {
    /// Validates the configuration and binds the listener on all IPv4
    /// interfaces at `port` (0 picks a free port).
    ///
    /// ## Errors
    ///
    /// - [`TransportError::UnsupportedConfiguration`] for anything but binary TCP over IPv4
    /// - [`TransportError::Bind`] if the socket cannot be created, configured or bound
    /// - [`TransportError::Poll`] if the single-loop poller cannot be created
    pub fn initialize<P>(config: TransportConfig, port: u16, processor: P) -> Result<Arc<Self>>
    where
        P: ProtocolProcessor,
    {
        config.validate()?;

        let (listener, poll_handle, poll_registry, waker) = match config.mode {
            ExecutionMode::SingleLoop => {
                let poll_handle = PollHandle::new()?;
                let registry = poll_handle
                    .registry()
                    .try_clone()
                    .map_err(TransportError::Poll)?;
                let listener = Listener::bind(&config, port, Some(poll_handle.registry()))?;
                let waker = poll_handle.waker();
                (listener, Some(poll_handle), Some(registry), Some(waker))
            }
            ExecutionMode::ThreadPerConnection => {
                (Listener::bind(&config, port, None)?, None, None, None)
            }
        };

        let pooled_buffers = match config.mode {
            ExecutionMode::SingleLoop => 1,
            ExecutionMode::ThreadPerConnection => {
                config.max_connections.unwrap_or(DEFAULT_POOLED_BUFFERS)
            }
        };

        info!(
            mode = ?config.mode,
            max_connections = ?config.max_connections,
            endpoint_url = %listener.endpoint_url(),
            "transport initialized"
        );

        Ok(Arc::new(Self {
            buffers: BufferPool::new(pooled_buffers),
            config,
            listener,
            registry: ConnectionRegistry::new(),
            processor: Box::new(processor),
            events: Arc::new(EventBus::new()),
            supervisor: Supervisor::new(),
            poll_handle: Mutex::new(poll_handle),
            poll_registry,
            waker,
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }))
    }

    fn require_mode(&self, expected: ExecutionMode) -> Result<()> {
        if self.config.mode != expected {
            return Err(TransportError::ModeMismatch {
                expected,
                actual: self.config.mode,
            });
        }
        Ok(())
    }

    fn publish_listening(&self) {
        self.events.publish(TransportEvent::Listening {
            endpoint_url: self.listener.endpoint_url().to_string(),
            local_addr: self.listener.local_addr(),
        });
    }

    /// Starts the acceptor thread of the thread-per-connection mode.
    ///
    /// Returns immediately; calling it again is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.require_mode(ExecutionMode::ThreadPerConnection)?;
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("transport already started");
            return Ok(());
        }

        self.publish_listening();
        let server = Arc::clone(self);
        self.supervisor
            .spawn_acceptor(move || server.listener.run_acceptor(&server))
    }

    /// Takes the single-loop event loop. It can be taken once.
    pub fn event_loop(self: &Arc<Self>) -> Result<EventLoop> {
        self.require_mode(ExecutionMode::SingleLoop)?;
        let poll_handle = self
            .poll_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::EventLoopUnavailable)?;
        self.started.store(true, Ordering::Release);
        Ok(EventLoop::new(Arc::clone(self), poll_handle))
    }

    /// Runs the single-loop event loop on the calling thread until
    /// [`shutdown`](Self::shutdown). `worker(context)` runs on every poll
    /// timeout.
    pub fn run_event_loop<C, W>(
        self: &Arc<Self>,
        timeout: Duration,
        worker: W,
        context: &mut C,
    ) -> Result<()>
    where
        W: FnMut(&mut C) -> anyhow::Result<()>,
    {
        let mut event_loop = self.event_loop()?;
        self.publish_listening();
        event_loop.run(timeout, worker, context)
    }

    /// Begins a cooperative shutdown.
    ///
    /// Every open connection is closed (its reader observes the closed socket
    /// and tears it down), the event loop is woken and the acceptor released.
    /// Safe to call from any thread, including a processor or worker callback.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(open = self.registry.len(), "transport shutting down");

        self.registry.for_each(|connection| {
            connection.begin_close(CloseReason::ServerShutdown);
        });
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "failed to wake event loop");
            }
        }
        self.registry.wake_waiters();
        self.listener.unblock();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Waits for the acceptor and every reader thread to finish. Call after
    /// [`shutdown`](Self::shutdown); a no-op in single-loop mode.
    ///
    /// Panicked reader threads are reported as [`TransportError::WorkerPanicked`].
    pub fn join(&self) -> Result<()> {
        let (panicked, acceptor_panicked) = self.supervisor.join_all();
        for handle in &panicked {
            self.reclaim(*handle);
        }

        let failed = panicked.len() + usize::from(acceptor_panicked);
        if failed > 0 {
            return Err(TransportError::WorkerPanicked(failed));
        }
        Ok(())
    }

    /// Joins finished reader threads. Connections of readers that panicked
    /// are reclaimed if still registered.
    pub(crate) fn reap_readers(&self) {
        for handle in self.supervisor.reap() {
            self.reclaim(handle);
        }
    }

    /// Tears down a connection whose reader panicked. A no-op once the
    /// connection has left the registry.
    pub(crate) fn reclaim(&self, handle: ConnectionHandle) {
        let Some(connection) = self.registry.find(handle) else {
            return;
        };
        self.events
            .publish(TransportEvent::ReaderPanicked { handle });
        connection.begin_close(CloseReason::ReaderPanicked);
        reader::teardown(self, &connection);
    }

    /// Subscribes to the transport's event stream.
    pub fn subscribe(&self) -> Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    /// The published endpoint, `opc.tcp://<host>:<port>/`.
    pub fn endpoint_url(&self) -> &str {
        self.listener.endpoint_url()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn find(&self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        self.registry.find(handle)
    }

    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        self.registry.for_each(f)
    }

    pub(crate) fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub(crate) fn listener(&self) -> &Listener {
        &self.listener
    }

    pub(crate) fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub(crate) fn processor(&self) -> &dyn ProtocolProcessor {
        self.processor.as_ref()
    }

    pub(crate) fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub(crate) fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub(crate) fn poll_registry(&self) -> Option<&mio::Registry> {
        self.poll_registry.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{Ipv4Addr, TcpStream},
        sync::mpsc,
        thread::{self, JoinHandle},
        time::Instant,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);
    const TICK: Duration = Duration::from_millis(10);

    struct Recorder {
        received: mpsc::Sender<(ConnectionHandle, Vec<u8>)>,
    }

    impl ProtocolProcessor for Recorder {
        fn process(&self, connection: &Arc<Connection>, data: &[u8]) -> anyhow::Result<()> {
            let _ = self.received.send((connection.handle(), data.to_vec()));
            Ok(())
        }
    }

    fn recorder() -> (Recorder, mpsc::Receiver<(ConnectionHandle, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        (Recorder { received: tx }, rx)
    }

    struct Echo;

    impl ProtocolProcessor for Echo {
        fn process(&self, connection: &Arc<Connection>, data: &[u8]) -> anyhow::Result<()> {
            connection.write_all(data)?;
            Ok(())
        }
    }

    fn config(mode: ExecutionMode) -> TransportConfig {
        TransportConfig::builder().mode(mode).build()
    }

    /// Starts a server in the requested mode and returns it with its event
    /// stream and, for single-loop mode, the loop thread.
    fn launch<P: ProtocolProcessor>(
        config: TransportConfig,
        processor: P,
    ) -> (
        Arc<TransportServer>,
        mpsc::Receiver<TransportEvent>,
        Option<JoinHandle<Result<()>>>,
    ) {
        let server = TransportServer::initialize(config, 0, processor).unwrap();
        let events = server.subscribe();
        let looper = match server.mode() {
            ExecutionMode::ThreadPerConnection => {
                server.start().unwrap();
                None
            }
            ExecutionMode::SingleLoop => {
                let server = Arc::clone(&server);
                Some(thread::spawn(move || {
                    server.run_event_loop(TICK, |_: &mut ()| Ok(()), &mut ())
                }))
            }
        };
        (server, events, looper)
    }

    fn stop(server: &Arc<TransportServer>, looper: Option<JoinHandle<Result<()>>>) {
        server.shutdown();
        if let Some(looper) = looper {
            looper.join().unwrap().unwrap();
        }
        server.join().unwrap();
    }

    fn connect(server: &TransportServer) -> TcpStream {
        TcpStream::connect((Ipv4Addr::LOCALHOST, server.local_addr().port())).unwrap()
    }

    fn wait_for<F>(events: &mpsc::Receiver<TransportEvent>, mut matches: F) -> TransportEvent
    where
        F: FnMut(&TransportEvent) -> bool,
    {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("expected event did not arrive: {e}"),
            }
        }
    }

    fn established(events: &mpsc::Receiver<TransportEvent>) -> ConnectionHandle {
        match wait_for(events, |e| {
            matches!(e, TransportEvent::ConnectionEstablished { .. })
        }) {
            TransportEvent::ConnectionEstablished { handle, .. } => handle,
            _ => unreachable!(),
        }
    }

    fn closed(events: &mpsc::Receiver<TransportEvent>) -> (ConnectionHandle, CloseReason) {
        match wait_for(events, |e| matches!(e, TransportEvent::ConnectionClosed { .. })) {
            TransportEvent::ConnectionClosed { handle, reason } => (handle, reason),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_initialize_rejects_unsupported_configuration() {
        let config = TransportConfig::builder()
            .connection_kind(config::ConnectionKind::TcpV6)
            .build();
        let (processor, _rx) = recorder();
        let result = TransportServer::initialize(config, 0, processor);
        assert!(matches!(
            result,
            Err(TransportError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_initialize_reports_bind_error() {
        let (first_processor, _rx1) = recorder();
        let first =
            TransportServer::initialize(config(ExecutionMode::SingleLoop), 0, first_processor)
                .unwrap();
        let port = first.local_addr().port();

        let (processor, _rx2) = recorder();
        let result =
            TransportServer::initialize(config(ExecutionMode::ThreadPerConnection), port, processor);
        assert!(matches!(result, Err(TransportError::Bind { port: p, .. }) if p == port));
    }

    #[test]
    fn test_endpoint_url_is_well_formed() {
        let (processor, _rx) = recorder();
        let server =
            TransportServer::initialize(config(ExecutionMode::SingleLoop), 0, processor).unwrap();
        let port = server.local_addr().port();
        assert_eq!(server.endpoint_url(), format!("opc.tcp://localhost:{port}/"));
    }

    #[test]
    fn test_mode_specific_entry_points() {
        let (processor, _rx) = recorder();
        let single =
            TransportServer::initialize(config(ExecutionMode::SingleLoop), 0, processor).unwrap();
        assert!(matches!(
            single.start(),
            Err(TransportError::ModeMismatch { .. })
        ));
        assert!(single.event_loop().is_ok());
        assert!(matches!(
            single.event_loop(),
            Err(TransportError::EventLoopUnavailable)
        ));

        let (processor, _rx) = recorder();
        let threaded =
            TransportServer::initialize(config(ExecutionMode::ThreadPerConnection), 0, processor)
                .unwrap();
        let result = threaded.run_event_loop(TICK, |_: &mut ()| Ok(()), &mut ());
        assert!(matches!(result, Err(TransportError::ModeMismatch { .. })));
    }

    fn single_read_is_forwarded_once(mode: ExecutionMode) {
        let (processor, received) = recorder();
        let (server, events, looper) = launch(config(mode), processor);

        let mut client = connect(&server);
        let handle = established(&events);
        client.write_all(&[0x01, 0x02, 0x03]).unwrap();

        let (from, data) = received.recv_timeout(WAIT).unwrap();
        assert_eq!(from, handle);
        assert_eq!(data, vec![0x01, 0x02, 0x03]);
        assert!(received.recv_timeout(Duration::from_millis(100)).is_err());

        stop(&server, looper);
    }

    #[test]
    fn test_received_bytes_reach_processor_single_loop() {
        single_read_is_forwarded_once(ExecutionMode::SingleLoop);
    }

    #[test]
    fn test_received_bytes_reach_processor_thread_per_connection() {
        single_read_is_forwarded_once(ExecutionMode::ThreadPerConnection);
    }

    fn silent_disconnect_is_reclaimed(mode: ExecutionMode) {
        let (processor, received) = recorder();
        let (server, events, looper) = launch(config(mode), processor);

        let client = connect(&server);
        let handle = established(&events);
        assert_eq!(server.connection_count(), 1);
        let connection = server.find(handle).unwrap();
        assert!(connection.is_open());

        drop(client);
        assert_eq!(closed(&events), (handle, CloseReason::PeerClosed));
        assert_eq!(server.connection_count(), 0);
        assert!(server.find(handle).is_none());
        assert!(connection.is_released());
        assert!(received.try_recv().is_err());

        stop(&server, looper);
    }

    #[test]
    fn test_silent_disconnect_single_loop() {
        silent_disconnect_is_reclaimed(ExecutionMode::SingleLoop);
    }

    #[test]
    fn test_silent_disconnect_thread_per_connection() {
        silent_disconnect_is_reclaimed(ExecutionMode::ThreadPerConnection);
    }

    fn admission_is_capped(mode: ExecutionMode) {
        let (processor, _received) = recorder();
        let config = TransportConfig::builder()
            .mode(mode)
            .max_connections(2)
            .build();
        let (server, events, looper) = launch(config, processor);

        let mut clients: Vec<TcpStream> = (0..3).map(|_| connect(&server)).collect();
        established(&events);
        established(&events);
        wait_for(&events, |e| {
            matches!(e, TransportEvent::CapacityReached { max: 2, .. })
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.connection_count(), 2);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, TransportEvent::ConnectionEstablished { .. }));
        }

        // freeing a slot admits the client waiting in the backlog
        drop(clients.remove(0));
        let (mut freed, mut admitted) = (false, false);
        while !(freed && admitted) {
            match wait_for(&events, |e| {
                matches!(
                    e,
                    TransportEvent::ConnectionClosed { .. }
                        | TransportEvent::ConnectionEstablished { .. }
                )
            }) {
                TransportEvent::ConnectionClosed { .. } => freed = true,
                _ => admitted = true,
            }
        }
        assert_eq!(server.connection_count(), 2);

        stop(&server, looper);
    }

    #[test]
    fn test_admission_cap_single_loop() {
        admission_is_capped(ExecutionMode::SingleLoop);
    }

    #[test]
    fn test_admission_cap_thread_per_connection() {
        admission_is_capped(ExecutionMode::ThreadPerConnection);
    }

    #[test]
    fn test_worker_fires_once_per_timeout() {
        let (processor, _received) = recorder();
        let server =
            TransportServer::initialize(config(ExecutionMode::SingleLoop), 0, processor).unwrap();
        let _idle_a = connect(&server);
        let _idle_b = connect(&server);

        let timeout = Duration::from_millis(20);
        let mut context = (0usize, Arc::clone(&server));
        let started = Instant::now();
        server
            .run_event_loop(
                timeout,
                |(ticks, server): &mut (usize, Arc<TransportServer>)| {
                    *ticks += 1;
                    if *ticks == 3 {
                        server.shutdown();
                    }
                    Ok(())
                },
                &mut context,
            )
            .unwrap();

        assert_eq!(context.0, 3);
        assert!(started.elapsed() >= timeout * 3);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_worker_error_is_reported_and_loop_continues() {
        let (processor, _received) = recorder();
        let server =
            TransportServer::initialize(config(ExecutionMode::SingleLoop), 0, processor).unwrap();
        let events = server.subscribe();

        let mut context = (0usize, Arc::clone(&server));
        server
            .run_event_loop(
                TICK,
                |(ticks, server): &mut (usize, Arc<TransportServer>)| {
                    *ticks += 1;
                    match *ticks {
                        1 => anyhow::bail!("keepalive failed"),
                        2 => {
                            server.shutdown();
                            Ok(())
                        }
                        _ => Ok(()),
                    }
                },
                &mut context,
            )
            .unwrap();

        assert_eq!(context.0, 2);
        let failure = wait_for(&events, |e| matches!(e, TransportEvent::WorkerFailed { .. }));
        assert_eq!(
            failure,
            TransportEvent::WorkerFailed {
                error: "keepalive failed".into()
            }
        );
    }

    fn echo_round_trip(mode: ExecutionMode) {
        let (server, events, looper) = launch(config(mode), Echo);

        let mut client = connect(&server);
        established(&events);

        let message: Vec<u8> = (0..256 * 1024).map(|i| (i % 253) as u8).collect();
        let mut reader = client.try_clone().unwrap();
        let expected = message.len();
        let echoed = thread::spawn(move || {
            let mut received = Vec::with_capacity(expected);
            let mut buf = [0u8; 8192];
            while received.len() < expected {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }
            received
        });

        client.write_all(&message).unwrap();
        assert_eq!(echoed.join().unwrap(), message);

        stop(&server, looper);
    }

    #[test]
    fn test_echo_round_trip_single_loop() {
        echo_round_trip(ExecutionMode::SingleLoop);
    }

    #[test]
    fn test_echo_round_trip_thread_per_connection() {
        echo_round_trip(ExecutionMode::ThreadPerConnection);
    }

    #[test]
    fn test_shutdown_reaches_every_reader() {
        let (processor, _received) = recorder();
        let (server, events, looper) =
            launch(config(ExecutionMode::ThreadPerConnection), processor);

        let mut clients: Vec<TcpStream> = (0..3).map(|_| connect(&server)).collect();
        for _ in 0..3 {
            established(&events);
        }

        server.shutdown();
        for _ in 0..3 {
            let (_, reason) = closed(&events);
            assert_eq!(reason, CloseReason::ServerShutdown);
        }
        for client in &mut clients {
            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).unwrap(), 0);
        }
        assert_eq!(server.connection_count(), 0);

        stop(&server, looper);
    }

    #[test]
    fn test_shutdown_tears_down_single_loop_connections() {
        let (processor, _received) = recorder();
        let (server, events, looper) = launch(config(ExecutionMode::SingleLoop), processor);

        let _a = connect(&server);
        let _b = connect(&server);
        established(&events);
        established(&events);

        stop(&server, looper);
        let (_, first) = closed(&events);
        let (_, second) = closed(&events);
        assert_eq!(first, CloseReason::ServerShutdown);
        assert_eq!(second, CloseReason::ServerShutdown);
        assert_eq!(server.connection_count(), 0);
    }

    struct Rejecting;

    impl ProtocolProcessor for Rejecting {
        fn process(&self, _connection: &Arc<Connection>, _data: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("malformed hello")
        }
    }

    fn teardown_happens_once(mode: ExecutionMode) {
        let (server, events, looper) = launch(config(mode), Rejecting);

        let mut client = connect(&server);
        let handle = established(&events);
        client.write_all(b"HELF").unwrap();
        drop(client);

        assert_eq!(closed(&events), (handle, CloseReason::ProcessorError));
        thread::sleep(Duration::from_millis(100));
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(
                event,
                TransportEvent::ConnectionClosed { handle: h, .. } if h == handle
            ));
        }
        assert_eq!(server.connection_count(), 0);

        stop(&server, looper);
    }

    #[test]
    fn test_teardown_happens_once_single_loop() {
        teardown_happens_once(ExecutionMode::SingleLoop);
    }

    #[test]
    fn test_teardown_happens_once_thread_per_connection() {
        teardown_happens_once(ExecutionMode::ThreadPerConnection);
    }

    struct CloseOnData;

    impl ProtocolProcessor for CloseOnData {
        fn process(&self, connection: &Arc<Connection>, _data: &[u8]) -> anyhow::Result<()> {
            connection.write_all(b"bye")?;
            connection.close();
            Ok(())
        }
    }

    #[test]
    fn test_processor_requested_close() {
        let (server, events, looper) = launch(config(ExecutionMode::SingleLoop), CloseOnData);

        let mut client = connect(&server);
        let handle = established(&events);
        client.write_all(b"hi").unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"bye");
        assert_eq!(closed(&events), (handle, CloseReason::Requested));

        stop(&server, looper);
    }

    struct PanicOnBoom {
        received: mpsc::Sender<(ConnectionHandle, Vec<u8>)>,
    }

    impl ProtocolProcessor for PanicOnBoom {
        fn process(&self, connection: &Arc<Connection>, data: &[u8]) -> anyhow::Result<()> {
            if data == b"boom" {
                panic!("processor bug");
            }
            let _ = self.received.send((connection.handle(), data.to_vec()));
            Ok(())
        }
    }

    fn panic_on_boom() -> (PanicOnBoom, mpsc::Receiver<(ConnectionHandle, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        (PanicOnBoom { received: tx }, rx)
    }

    fn reader_panicked(events: &mpsc::Receiver<TransportEvent>) -> TransportEvent {
        wait_for(events, |e| matches!(e, TransportEvent::ReaderPanicked { .. }))
    }

    #[test]
    fn test_panicked_reader_is_reclaimed_thread_per_connection() {
        let (processor, _received) = panic_on_boom();
        let (server, events, _) = launch(config(ExecutionMode::ThreadPerConnection), processor);

        let mut client = connect(&server);
        let handle = established(&events);
        client.write_all(b"boom").unwrap();

        assert_eq!(reader_panicked(&events), TransportEvent::ReaderPanicked { handle });
        assert_eq!(closed(&events), (handle, CloseReason::ReaderPanicked));
        assert_eq!(server.connection_count(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        server.shutdown();
        assert!(matches!(server.join(), Err(TransportError::WorkerPanicked(1))));
    }

    #[test]
    fn test_panicked_reader_frees_its_slot() {
        let (processor, _received) = panic_on_boom();
        let config = TransportConfig::builder()
            .mode(ExecutionMode::ThreadPerConnection)
            .max_connections(1)
            .build();
        let (server, events, _) = launch(config, processor);

        let mut first = connect(&server);
        let first_handle = established(&events);
        first.write_all(b"boom").unwrap();
        assert_eq!(
            reader_panicked(&events),
            TransportEvent::ReaderPanicked {
                handle: first_handle
            }
        );

        let _second = connect(&server);
        let second_handle = established(&events);
        assert_ne!(second_handle, first_handle);
        assert_eq!(server.connection_count(), 1);
        assert!(server.find(first_handle).is_none());

        server.shutdown();
        assert!(matches!(server.join(), Err(TransportError::WorkerPanicked(1))));
    }

    #[test]
    fn test_panicked_reader_only_costs_its_connection_single_loop() {
        let (processor, received) = panic_on_boom();
        let (server, events, looper) = launch(config(ExecutionMode::SingleLoop), processor);

        let mut doomed = connect(&server);
        let doomed_handle = established(&events);
        let mut survivor = connect(&server);
        let survivor_handle = established(&events);

        doomed.write_all(b"boom").unwrap();
        assert_eq!(
            reader_panicked(&events),
            TransportEvent::ReaderPanicked {
                handle: doomed_handle
            }
        );
        assert_eq!(closed(&events), (doomed_handle, CloseReason::ReaderPanicked));

        survivor.write_all(b"ping").unwrap();
        assert_eq!(
            received.recv_timeout(WAIT).unwrap(),
            (survivor_handle, b"ping".to_vec())
        );
        assert_eq!(server.connection_count(), 1);

        stop(&server, looper);
        assert_eq!(closed(&events), (survivor_handle, CloseReason::ServerShutdown));
        assert_eq!(server.connection_count(), 0);
    }

    struct Flood;

    impl ProtocolProcessor for Flood {
        fn process(&self, connection: &Arc<Connection>, _data: &[u8]) -> anyhow::Result<()> {
            connection.write_all(&vec![0u8; 64 * 1024 * 1024])?;
            Ok(())
        }
    }

    fn write_failure_closes_once(mode: ExecutionMode) {
        let config = TransportConfig::builder()
            .mode(mode)
            .send_timeout(Duration::from_millis(200))
            .build();
        let (server, events, looper) = launch(config, Flood);

        // the client never reads, so the flood stalls until the send timeout
        let mut client = connect(&server);
        let handle = established(&events);
        client.write_all(b"go").unwrap();

        let failure = wait_for(&events, |e| matches!(e, TransportEvent::WriteFailed { .. }));
        assert!(matches!(failure, TransportEvent::WriteFailed { handle: h, .. } if h == handle));
        assert_eq!(closed(&events), (handle, CloseReason::WriteError));

        thread::sleep(Duration::from_millis(100));
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(
                event,
                TransportEvent::ConnectionClosed { handle: h, .. } if h == handle
            ));
        }
        assert_eq!(server.connection_count(), 0);

        drop(client);
        stop(&server, looper);
    }

    #[test]
    fn test_write_failure_closes_once_single_loop() {
        write_failure_closes_once(ExecutionMode::SingleLoop);
    }

    #[test]
    fn test_write_failure_closes_once_thread_per_connection() {
        write_failure_closes_once(ExecutionMode::ThreadPerConnection);
    }

    #[test]
    fn test_listening_event_carries_endpoint() {
        let (processor, _received) = recorder();
        let server =
            TransportServer::initialize(config(ExecutionMode::ThreadPerConnection), 0, processor)
                .unwrap();
        let events = server.subscribe();
        server.start().unwrap();

        let event = wait_for(&events, |e| matches!(e, TransportEvent::Listening { .. }));
        assert_eq!(
            event,
            TransportEvent::Listening {
                endpoint_url: server.endpoint_url().to_string(),
                local_addr: server.local_addr(),
            }
        );

        server.shutdown();
        server.join().unwrap();
    }
}
