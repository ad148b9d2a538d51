//! # ua-transport
//! The TCP transport layer of an OPC UA binary server.
//!
//! `ua-transport` accepts client connections, tracks each one in a registry
//! and hands every chunk of received bytes to an upper protocol layer (the
//! [`ProtocolProcessor`]). Replies go back through [`Connection::write_all`].
//! It is built directly on [`mio`] and OS threads, without an async runtime.
//!
//! ## Execution modes
//!
//! - [`ExecutionMode::SingleLoop`]: one thread polls the listener and every
//!   connection, and calls a periodic worker whenever a poll times out.
//! - [`ExecutionMode::ThreadPerConnection`]: an acceptor thread admits clients
//!   and each connection gets a dedicated reader thread.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────┐    ┌──────────────┐    ┌────────────────────┐
//! │ TransportServer │───▶│   Listener   │───▶│ ConnectionRegistry │
//! └─────────────────┘    └──────────────┘    └────────────────────┘
//!          │                     │                      │
//!          ▼                     ▼                      ▼
//! ┌─────────────────┐    ┌──────────────┐    ┌────────────────────┐
//! │ EventLoop /     │───▶│    reader    │───▶│ ProtocolProcessor  │
//! │ Supervisor      │    └──────────────┘    └────────────────────┘
//! └─────────────────┘            │
//!                                ▼
//!                        ┌──────────────┐
//!                        │   EventBus   │
//!                        └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ua_transport::prelude::*;
//!
//! struct Echo;
//!
//! impl ProtocolProcessor for Echo {
//!     fn process(&self, connection: &Arc<Connection>, data: &[u8]) -> anyhow::Result<()> {
//!         connection.write_all(data)?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), TransportError> {
//!     let config = TransportConfig::builder()
//!         .mode(ExecutionMode::ThreadPerConnection)
//!         .max_connections(64)
//!         .build();
//!     let server = TransportServer::initialize(config, 4840, Echo)?;
//!     println!("listening on {}", server.endpoint_url());
//!
//!     server.start()?;
//!     // ... later, from any thread
//!     server.shutdown();
//!     server.join()
//! }
//! ```
//!
//! - [`TransportServer`]: initialization, mode entry points and shutdown
//! - [`Connection`]: per-connection state, buffer settings and the send path
//! - [`reactor`]: the single-loop event loop
//! - [`supervisor`]: ownership of acceptor and reader threads
//! - [`event`]: lifecycle events published to subscribers
//! - [`error`]: error types and result handling

pub mod error;
pub mod event;
pub mod handler;
pub mod net;
pub mod object_pool;
pub mod poll;
pub mod reactor;
pub mod supervisor;

pub use error::{Result, TransportError};
pub use event::{CloseReason, TransportEvent};
pub use handler::ProtocolProcessor;
pub use net::tcp::{
    TransportServer,
    config::{BufferConfig, ExecutionMode, TransportConfig},
    connection::{Connection, ConnectionHandle, ConnectionState},
};
pub use reactor::EventLoop;

/// Re-exports of the types most applications need.
///
/// ```rust
/// use ua_transport::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::TransportError;
    pub use crate::event::{CloseReason, TransportEvent};
    pub use crate::handler::ProtocolProcessor;
    pub use crate::net::tcp::{
        TransportServer,
        config::{BufferConfig, ExecutionMode, TransportConfig},
        connection::{Connection, ConnectionHandle, ConnectionState},
    };
}
