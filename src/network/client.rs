//! PulseWire Client
//!
//! Connects to a PulseWire server and keeps the connection alive with
//! heartbeats whenever it has had nothing else to send.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::Instrument;

use super::connection::{Connection, ConnectionError, ConnectionHandle};
use super::session::{DisconnectReason, Session, SessionStep};
use super::{EventSender, NetworkConfig};
use crate::protocol::{Message, MessageCodec, SerializerRegistry};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Successfully connected to server
    Connected { server_addr: SocketAddr },
    /// Disconnected from server
    Disconnected { reason: DisconnectReason },
    /// Received a message from the server
    MessageReceived { message: Message },
    /// Connection error
    Error { message: String },
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// PulseWire Client
pub struct Client {
    /// Client configuration
    config: NetworkConfig,
    /// Shared frame codec
    codec: MessageCodec,
    /// Current state
    state: Arc<RwLock<ClientState>>,
    /// Event sender
    event_tx: EventSender<ClientEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    /// Connection handle for sending messages
    connection_handle: Arc<RwLock<Option<ConnectionHandle>>>,
    /// Shutdown signal for the current session
    shutdown_tx: Arc<RwLock<Option<watch::Sender<bool>>>>,
}

impl Client {
    /// Create a new client with the standard serializers
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_registry(config, Arc::new(SerializerRegistry::standard()))
    }

    /// Create a new client with a custom serializer registry
    pub fn with_registry(config: NetworkConfig, registry: Arc<SerializerRegistry>) -> Self {
        let (event_tx, event_rx) = EventSender::channel(256);
        let codec = MessageCodec::new(registry).with_max_frame_length(config.max_frame_length);

        Self {
            config,
            codec,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            event_tx,
            event_rx: Some(event_rx),
            connection_handle: Arc::new(RwLock::new(None)),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to a server by address
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != ClientState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ClientState::Connecting;
        }

        tracing::info!("Connecting to {}", server_addr);

        // Connect with timeout
        let stream = match tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            self.open_stream(server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ClientState::Disconnected).await;
                self.event_tx.emit(ClientEvent::Error {
                    message: format!("Connect to {} failed: {}", server_addr, e),
                });
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                self.set_state(ClientState::Disconnected).await;
                self.event_tx.emit(ClientEvent::Error {
                    message: format!("Connect to {} timed out", server_addr),
                });
                return Err(ClientError::Timeout);
            }
        };

        let conn = Connection::new(stream, server_addr, self.codec.clone())
            .with_read_chunk_size(self.config.read_chunk_size);

        // Create message channel
        let (msg_tx, msg_rx) = mpsc::channel::<Message>(256);
        let handle = ConnectionHandle::new(server_addr, msg_tx, self.codec.clone());

        {
            let mut ch = self.connection_handle.write().await;
            *ch = Some(handle.clone());
        }

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut st = self.shutdown_tx.write().await;
            *st = Some(shutdown_tx);
        }

        self.set_state(ClientState::Connected).await;
        tracing::info!("Connected to {}", server_addr);

        self.event_tx.emit(ClientEvent::Connected { server_addr });

        let mut session = Session::new(conn, self.config.idle_supervisor(), msg_rx, shutdown_rx)
            .with_heartbeat_info(self.config.heartbeat_info.clone())
            .with_decode_error_policy(self.config.decode_error_policy);

        // Spawn the message loop
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connection_handle = self.connection_handle.clone();
        let span = tracing::info_span!("connection", peer = %server_addr);

        tokio::spawn(
            async move {
                let reason = loop {
                    match session.next().await {
                        SessionStep::Message(message) => {
                            tracing::debug!(
                                sequence_id = message.sequence_id(),
                                "Received {} message",
                                message.message_type()
                            );
                            event_tx.emit(ClientEvent::MessageReceived { message });
                        }
                        SessionStep::Closed(reason) => break reason,
                    }
                };

                // Clean up
                handle.mark_disconnected();

                {
                    let mut ch = connection_handle.write().await;
                    *ch = None;
                }

                {
                    let mut s = state.write().await;
                    *s = ClientState::Disconnected;
                }

                tracing::info!(reason = %reason, "Disconnected from server");

                event_tx.emit(ClientEvent::Disconnected { reason });
            }
            .instrument(span),
        );

        Ok(())
    }

    async fn open_stream(&self, server_addr: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = if server_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(size) = self.config.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }

        let stream = socket.connect(server_addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> ClientResult<()> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect(addr).await
    }

    /// Connect to the host and port from the configuration
    pub async fn connect_configured(&self) -> ClientResult<()> {
        let host = self.config.host.clone();
        self.connect_hostname(&host, self.config.port).await
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) -> ClientResult<()> {
        {
            let state = self.state.read().await;
            if *state == ClientState::Disconnected {
                return Err(ClientError::NotConnected);
            }
        }

        // Signal shutdown
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            tx.send_replace(true);
        }

        Ok(())
    }

    /// Send a message to the server
    pub async fn send(&self, message: Message) -> ClientResult<()> {
        let handle = self.connection_handle.read().await;
        if let Some(h) = &*handle {
            h.send(message).await?;
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Send a heartbeat now, numbered by the connection's generator
    pub async fn send_heartbeat(&self) -> ClientResult<()> {
        let handle = self.connection_handle.read().await;
        if let Some(h) = &*handle {
            h.send_heartbeat(&self.config.heartbeat_info).await?;
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Get the current state
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Connected
    }

    /// Events discarded because the receiver was not keeping up
    pub fn dropped_events(&self) -> u64 {
        self.event_tx.dropped()
    }

    async fn set_state(&self, new_state: ClientState) {
        let mut state = self.state.write().await;
        *state = new_state;
    }
}
