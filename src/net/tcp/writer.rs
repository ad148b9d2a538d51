//! Full-message writes on a connection.

use std::{
    io,
    sync::PoisonError,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use super::connection::Connection;
use crate::{
    error::{Result, TransportError},
    event::{CloseReason, TransportEvent},
};

const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(1);

/// Writes every byte of `message` to the connection's socket.
///
/// Writes are serialized per connection and never overlap the release of the
/// socket. Partial writes are continued from the current offset; interrupted
/// writes are retried. On a non-blocking socket a full send buffer is waited
/// out until the connection's send timeout passes without progress.
///
/// A terminal error is returned to the caller and closes the connection: the
/// socket is shut down and the connection's reader performs the teardown.
pub fn write_all(connection: &Connection, message: &[u8]) -> Result<()> {
    let handle = connection.handle();
    let _gate = connection.lock_writes();

    let failure = {
        let stream = connection
            .stream()
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let stream = match stream.as_ref() {
            Some(stream) if !connection.is_closing() => stream,
            _ => return Err(TransportError::ConnectionClosed(handle)),
        };

        let total = message.len();
        let mut written = 0;
        let mut last_progress = Instant::now();
        let mut failure = None;

        while written < total {
            match stream.write(&message[written..]) {
                Ok(0) => {
                    failure = Some((written, io::Error::from(io::ErrorKind::WriteZero)));
                    break;
                }
                Ok(n) => {
                    trace!(%handle, n, written, total, "partial write");
                    written += n;
                    last_progress = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && stream.is_nonblocking() => {
                    if last_progress.elapsed() >= connection.send_timeout() {
                        failure = Some((written, io::Error::from(io::ErrorKind::TimedOut)));
                        break;
                    }
                    thread::sleep(WOULD_BLOCK_BACKOFF);
                }
                Err(e) => {
                    failure = Some((written, e));
                    break;
                }
            }
        }

        if failure.is_none() {
            debug!(%handle, bytes = total, "message written");
        }
        failure
    };

    match failure {
        None => Ok(()),
        Some((written, source)) => {
            let error = TransportError::Write {
                handle,
                written,
                total: message.len(),
                source,
            };
            warn!(%handle, %error, "write failed, closing connection");
            connection.events().publish(TransportEvent::WriteFailed {
                handle,
                error: error.to_string(),
            });
            connection.begin_close(CloseReason::WriteError);
            Err(error)
        }
    }
}
