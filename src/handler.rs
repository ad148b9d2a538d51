use std::sync::Arc;

use crate::net::tcp::connection::{Connection, ConnectionHandle};

/// The upper protocol layer the transport hands received bytes to.
///
/// `process` is called once for every non-empty read, with exactly the bytes
/// of that read, in order. It runs on the connection's reader: in single-loop
/// mode that is the event loop thread, so implementations must not block.
/// Replies go out through [`Connection::write_all`].
///
/// Returning an error from `process` closes the connection.
pub trait ProtocolProcessor: Send + Sync + 'static {
    fn process(&self, connection: &Arc<Connection>, data: &[u8]) -> anyhow::Result<()>;

    /// Called once the connection is registered, before its first read.
    fn on_connect(&self, connection: &Arc<Connection>) -> anyhow::Result<()> {
        let _ = connection;
        Ok(())
    }

    /// Called after the connection has been released and left the registry.
    fn on_disconnect(&self, handle: ConnectionHandle) {
        let _ = handle;
    }
}

impl<F> ProtocolProcessor for F
where
    F: Fn(&Arc<Connection>, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn process(&self, connection: &Arc<Connection>, data: &[u8]) -> anyhow::Result<()> {
        self(connection, data)
    }
}
