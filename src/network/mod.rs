//! Network module - Handles TCP communication between peers
//!
//! Provides:
//! - Server for accepting incoming connections
//! - Client for connecting to servers
//! - Connection and session management with idle supervision

mod client;
mod connection;
mod idle;
mod server;
mod session;

pub use client::*;
pub use connection::*;
pub use idle::*;
pub use server::*;
pub use session::*;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::{DEFAULT_MAX_FRAME_LENGTH, DEFAULT_PORT};

/// What to do with a well-framed message whose payload fails to deserialize
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrorPolicy {
    /// Close the connection
    #[default]
    Close,
    /// Log the frame and keep reading
    Skip,
}

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Host to connect to (client)
    pub host: String,
    /// Port to listen on or connect to
    pub port: u16,
    /// Interface to bind to (server)
    pub bind_address: String,
    /// Listen backlog (server)
    pub backlog: u32,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Close the connection when nothing was received for this long (zero disables)
    pub reader_idle: Duration,
    /// Send a heartbeat when nothing was sent for this long (zero disables)
    pub writer_idle: Duration,
    /// SO_RCVBUF hint for new sockets
    pub recv_buffer_size: Option<u32>,
    /// SO_KEEPALIVE on accepted sockets (server)
    pub keepalive: bool,
    /// Bytes reserved in the frame buffer before each socket read
    pub read_chunk_size: usize,
    /// Maximum frame size, header included
    pub max_frame_length: usize,
    /// Text carried by generated heartbeats
    pub heartbeat_info: String,
    pub decode_error_policy: DecodeErrorPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            backlog: 128,
            connect_timeout_ms: 5000,
            reader_idle: Duration::ZERO,
            writer_idle: Duration::ZERO,
            recv_buffer_size: None,
            keepalive: false,
            read_chunk_size: 1024,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            heartbeat_info: "heartbeat".to_string(),
            decode_error_policy: DecodeErrorPolicy::Close,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Server role: drop peers that stay silent for 9 seconds, TCP keepalive on
    pub fn server(port: u16) -> Self {
        Self {
            keepalive: true,
            ..Self::new(port)
        }
        .with_reader_idle(Duration::from_secs(9))
    }

    /// Client role: send a heartbeat after 3 seconds without writes
    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            ..Self::new(port)
        }
        .with_writer_idle(Duration::from_secs(3))
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_reader_idle(mut self, timeout: Duration) -> Self {
        self.reader_idle = timeout;
        self
    }

    pub fn with_writer_idle(mut self, timeout: Duration) -> Self {
        self.writer_idle = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_heartbeat_info(mut self, info: impl Into<String>) -> Self {
        self.heartbeat_info = info.into();
        self
    }

    pub fn with_decode_error_policy(mut self, policy: DecodeErrorPolicy) -> Self {
        self.decode_error_policy = policy;
        self
    }

    /// Fresh idle timers for a new connection
    pub fn idle_supervisor(&self) -> IdleSupervisor {
        IdleSupervisor::new(self.reader_idle, self.writer_idle)
    }
}

/// Event queue feeding a server or client consumer.
///
/// Connection tasks must keep polling their session, so a full queue drops the
/// event and counts it instead of blocking.
#[derive(Debug)]
pub(crate) struct EventSender<E> {
    tx: mpsc::Sender<E>,
    dropped: Arc<AtomicU64>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<E: std::fmt::Debug> EventSender<E> {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<E>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sender = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sender, rx)
    }

    pub(crate) fn emit(&self, event: E) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(dropped = total, "Event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Events discarded because the consumer fell behind
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
