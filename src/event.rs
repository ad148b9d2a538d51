use std::{
    net::SocketAddr,
    sync::{
        Mutex, PoisonError,
        mpsc::{self, Receiver, Sender},
    },
};

use crate::net::tcp::connection::ConnectionHandle;

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its side (zero-length read).
    PeerClosed,
    /// A read failed with an I/O error.
    ReadError,
    /// The protocol processor rejected the received bytes.
    ProcessorError,
    /// A write failed; the writer initiated the close.
    WriteError,
    /// The protocol processor called [`Connection::close`](crate::Connection::close).
    Requested,
    /// The reader panicked inside the processor and the connection was reclaimed.
    ReaderPanicked,
    /// `TransportServer::shutdown` was called.
    ServerShutdown,
}

/// Structured notifications for the operator, delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Listening {
        endpoint_url: String,
        local_addr: SocketAddr,
    },
    ConnectionEstablished {
        handle: ConnectionHandle,
        peer_addr: SocketAddr,
    },
    ConnectionClosed {
        handle: ConnectionHandle,
        reason: CloseReason,
    },
    /// Inbound clients are left in the kernel backlog until a slot frees.
    CapacityReached { open: usize, max: usize },
    AcceptFailed { error: String },
    WriteFailed {
        handle: ConnectionHandle,
        error: String,
    },
    /// The periodic worker callback of the event loop returned an error.
    WorkerFailed { error: String },
    ReaderPanicked { handle: ConnectionHandle },
}

/// Fan-out of [`TransportEvent`]s to any number of channel subscribers.
///
/// Subscribers that dropped their receiver are pruned on the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<TransportEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<TransportEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    pub fn publish(&self, event: TransportEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
