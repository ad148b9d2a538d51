use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

const DEFAULT_BACKLOG: i32 = 128;

/// How connections are serviced. Fixed for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// One thread multiplexes the listener and every connection.
    #[default]
    SingleLoop,
    /// An acceptor thread plus one blocking reader thread per connection.
    ThreadPerConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    #[default]
    TcpV4,
    TcpV6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    #[default]
    Binary,
    Xml,
}

/// Buffer sizes exchanged in the transport hello.
///
/// The server's local policy is copied into every accepted connection; the
/// remote side starts zeroed until the upper layer negotiates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub protocol_version: u32,
    pub recv_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl BufferConfig {
    /// All-zero sizes, the state of a peer that has not said hello yet.
    pub const fn unnegotiated() -> Self {
        Self {
            protocol_version: 0,
            recv_buffer_size: 0,
            send_buffer_size: 0,
            max_message_size: 0,
            max_chunk_count: 0,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            protocol_version: 0,
            recv_buffer_size: 8192,
            send_buffer_size: 8192,
            max_message_size: 16384,
            max_chunk_count: 1,
        }
    }
}

/// Configuration for the transport server.
///
/// Controls the execution model, admission and the buffer policy handed to
/// every connection. Use `TransportConfig::builder()` for programmatic
/// construction; the serde derives let an application embed it in its own
/// configuration file.
///
/// ## Resource Limits
///
/// - max_connections: hard limit on concurrently open connections (None for unlimited)
/// - backlog: kernel accept queue length; defaults to max_connections, or 128 when unbounded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: ExecutionMode,
    pub connection_kind: ConnectionKind,
    pub encoding: Encoding,
    pub max_connections: Option<usize>,
    pub backlog: Option<i32>,
    /// Host part of the published endpoint URL
    pub hostname: String,
    /// Enable TCP_NODELAY on accepted sockets
    pub no_delay: bool,
    /// How long a write may stall on a full socket buffer before it fails
    pub send_timeout_ms: u64,
    /// Readiness events drained per poll in single-loop mode
    pub events_capacity: usize,
    pub buffers: BufferConfig,
}

impl TransportConfig {
    /// Create a new builder for TransportConfig
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn effective_backlog(&self) -> i32 {
        self.backlog.unwrap_or_else(|| {
            self.max_connections
                .map(|max| i32::try_from(max).unwrap_or(i32::MAX))
                .unwrap_or(DEFAULT_BACKLOG)
        })
    }

    /// Rejects anything other than binary-encoded TCP over IPv4.
    pub fn validate(&self) -> Result<()> {
        if self.connection_kind != ConnectionKind::TcpV4 {
            return Err(TransportError::UnsupportedConfiguration(format!(
                "connection kind {:?} is not implemented",
                self.connection_kind
            )));
        }
        if self.encoding != Encoding::Binary {
            return Err(TransportError::UnsupportedConfiguration(format!(
                "encoding {:?} is not implemented",
                self.encoding
            )));
        }
        if self.max_connections == Some(0) {
            return Err(TransportError::UnsupportedConfiguration(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.buffers.recv_buffer_size == 0 {
            return Err(TransportError::UnsupportedConfiguration(
                "recv_buffer_size must be non-zero".into(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(TransportError::UnsupportedConfiguration(
                "events_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            connection_kind: ConnectionKind::default(),
            encoding: Encoding::default(),
            max_connections: None,
            backlog: None,
            hostname: "localhost".to_string(),
            no_delay: true,
            send_timeout_ms: 5_000,
            events_capacity: 1024,
            buffers: BufferConfig::default(),
        }
    }
}

/// Builder for TransportConfig.
///
/// All fields are optional and fall back to `TransportConfig::default()`.
#[derive(Default)]
pub struct TransportConfigBuilder {
    mode: Option<ExecutionMode>,
    connection_kind: Option<ConnectionKind>,
    encoding: Option<Encoding>,
    max_connections: Option<usize>,
    backlog: Option<i32>,
    hostname: Option<String>,
    no_delay: Option<bool>,
    send_timeout: Option<Duration>,
    events_capacity: Option<usize>,
    buffers: Option<BufferConfig>,
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn connection_kind(mut self, kind: ConnectionKind) -> Self {
        self.connection_kind = Some(kind);
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Set the maximum number of concurrently open connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn buffers(mut self, buffers: BufferConfig) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Set only the receive buffer size, keeping the other buffer defaults
    pub fn recv_buffer_size(mut self, size: u32) -> Self {
        let mut buffers = self.buffers.unwrap_or_default();
        buffers.recv_buffer_size = size;
        self.buffers = Some(buffers);
        self
    }

    pub fn build(self) -> TransportConfig {
        let default = TransportConfig::default();
        TransportConfig {
            mode: self.mode.unwrap_or(default.mode),
            connection_kind: self.connection_kind.unwrap_or(default.connection_kind),
            encoding: self.encoding.unwrap_or(default.encoding),
            max_connections: self.max_connections.or(default.max_connections),
            backlog: self.backlog.or(default.backlog),
            hostname: self.hostname.unwrap_or(default.hostname),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            send_timeout_ms: self
                .send_timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(default.send_timeout_ms),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            buffers: self.buffers.unwrap_or(default.buffers),
        }
    }
}
