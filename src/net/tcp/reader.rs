//! The receive side of a connection.

use std::{io, sync::Arc};

use tracing::{debug, info, trace, warn};

use super::{
    TransportServer,
    connection::{Connection, ConnectionState},
};
use crate::{
    error::TransportError,
    event::{CloseReason, TransportEvent},
};

/// Reads from the connection and forwards every non-empty read to the
/// protocol processor.
///
/// With a blocking socket (thread-per-connection) this loops until the
/// connection is closing. With a polled socket it drains what is currently
/// readable and returns; the event loop calls it again on the next
/// readiness. Once the connection is observed closing, it is torn down.
pub fn run(server: &TransportServer, connection: &Arc<Connection>) {
    let handle = connection.handle();

    if connection.state() != ConnectionState::Closing {
        let len = connection.local_config().recv_buffer_size as usize;
        let mut buffer = server.buffers().acquire(len);

        loop {
            match connection.read(&mut buffer) {
                Ok(0) => {
                    debug!(%handle, "peer closed connection");
                    connection.begin_close(CloseReason::PeerClosed);
                }
                Ok(n) => {
                    trace!(%handle, bytes = n, "received");
                    if let Err(e) = server.processor().process(connection, &buffer[..n]) {
                        warn!(%handle, error = %e, "processor rejected data, closing connection");
                        connection.begin_close(CloseReason::ProcessorError);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(source) => {
                    let error = TransportError::Read { handle, source };
                    warn!(%error, "read failed, closing connection");
                    connection.begin_close(CloseReason::ReadError);
                }
            }

            if connection.state() != ConnectionState::Open {
                break;
            }
        }
    }

    if connection.state() == ConnectionState::Closing {
        teardown(server, connection);
    }
}

/// Releases the socket, removes the connection from the registry and reports
/// the close. Runs at most once per connection.
pub(crate) fn teardown(server: &TransportServer, connection: &Arc<Connection>) {
    let handle = connection.handle();
    if !connection.release(server.poll_registry()) {
        return;
    }

    if server.registry().remove(handle).is_none() {
        debug!(%handle, "released connection was not registered");
    }

    let reason = connection.close_reason().unwrap_or(CloseReason::PeerClosed);
    info!(%handle, ?reason, open = server.registry().len(), "connection closed");
    server
        .events()
        .publish(TransportEvent::ConnectionClosed { handle, reason });
    server.processor().on_disconnect(handle);
}
