//! PulseWire Server
//!
//! Accepts client connections, runs one session task per client and drops
//! clients that stay silent longer than the reader idle timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::Instrument;

use super::connection::{Connection, ConnectionError, ConnectionHandle};
use super::session::{DisconnectReason, Session, SessionStep};
use super::{EventSender, NetworkConfig};
use crate::protocol::{Message, MessageCodec, SerializerRegistry};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Unknown client: {0}")]
    UnknownClient(SocketAddr),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new client has connected
    ClientConnected { addr: SocketAddr },
    /// A client has disconnected
    ClientDisconnected {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    /// Received a message from a client
    MessageReceived { addr: SocketAddr, message: Message },
    /// Server started
    Started { bind_addr: SocketAddr },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// Information about a connected client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client address
    pub addr: SocketAddr,
    /// Handle for sending messages to this client
    pub handle: ConnectionHandle,
}

/// PulseWire Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Shared frame codec
    codec: MessageCodec,
    /// Connected clients
    clients: Arc<RwLock<HashMap<SocketAddr, ClientInfo>>>,
    /// Event sender
    event_tx: EventSender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal, observed by the accept loop and every session
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
    /// Bound address once started
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server with the standard serializers
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_registry(config, Arc::new(SerializerRegistry::standard()))
    }

    /// Create a new server with a custom serializer registry
    pub fn with_registry(config: NetworkConfig, registry: Arc<SerializerRegistry>) -> Self {
        let (event_tx, event_rx) = EventSender::channel(256);
        let codec = MessageCodec::new(registry).with_max_frame_length(config.max_frame_length);

        Self {
            config,
            codec,
            clients: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start the server, returning the bound address
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        self.event_tx.emit(ServerEvent::Started { bind_addr: local_addr });

        let clients = self.clients.clone();
        let event_tx = self.event_tx.clone();
        let config = self.config.clone();
        let codec = self.codec.clone();
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);

                                let span = tracing::info_span!("connection", peer = %addr);
                                tokio::spawn(
                                    handle_client(
                                        stream,
                                        addr,
                                        clients.clone(),
                                        event_tx.clone(),
                                        config.clone(),
                                        codec.clone(),
                                        shutdown_rx.clone(),
                                    )
                                    .instrument(span),
                                );
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                event_tx.emit(ServerEvent::Error {
                                    message: format!("Accept error: {}", e),
                                });
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            event_tx.emit(ServerEvent::Stopped);
        });

        Ok(local_addr)
    }

    async fn bind(&self) -> ServerResult<TcpListener> {
        let bind_addr = super::resolve_host(&self.config.bind_address, self.config.port)
            .await
            .map_err(|e| ServerError::BindFailed(format!("{}: {}", self.config.bind_address, e)))?;

        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        // inherited by accepted sockets
        socket.set_keepalive(self.config.keepalive)?;
        if let Some(size) = self.config.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }

        socket
            .bind(bind_addr)
            .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(socket.listen(self.config.backlog)?)
    }

    /// Stop the server and close every client session
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            tx.send_replace(true);
        }

        Ok(())
    }

    /// Get the bound address (after start)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get a list of connected clients
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let clients = self.clients.read().await;
        clients.values().cloned().collect()
    }

    /// Send a message to a specific client
    pub async fn send_to(&self, addr: &SocketAddr, message: Message) -> ServerResult<()> {
        let clients = self.clients.read().await;
        if let Some(client) = clients.get(addr) {
            client.handle.send(message).await?;
            Ok(())
        } else {
            Err(ServerError::UnknownClient(*addr))
        }
    }

    /// Send a message to all connected clients
    pub async fn broadcast(&self, message: Message) {
        let clients = self.clients.read().await;
        for (_, client) in clients.iter() {
            let _ = client.handle.send(message.clone()).await;
        }
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Events discarded because the receiver was not keeping up
    pub fn dropped_events(&self) -> u64 {
        self.event_tx.dropped()
    }
}

/// Handle a client connection
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    clients: Arc<RwLock<HashMap<SocketAddr, ClientInfo>>>,
    event_tx: EventSender<ServerEvent>,
    config: NetworkConfig,
    codec: MessageCodec,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let conn = Connection::new(stream, addr, codec.clone())
        .with_read_chunk_size(config.read_chunk_size);

    // Create message channel for this client
    let (msg_tx, msg_rx) = mpsc::channel::<Message>(256);
    let handle = ConnectionHandle::new(addr, msg_tx, codec);

    // Store client info
    {
        let mut clients = clients.write().await;
        clients.insert(
            addr,
            ClientInfo {
                addr,
                handle: handle.clone(),
            },
        );
    }

    event_tx.emit(ServerEvent::ClientConnected { addr });

    let mut session = Session::new(conn, config.idle_supervisor(), msg_rx, shutdown)
        .with_heartbeat_info(config.heartbeat_info.clone())
        .with_decode_error_policy(config.decode_error_policy);

    // Main message loop
    let reason = loop {
        match session.next().await {
            SessionStep::Message(message) => {
                match &message {
                    Message::Heartbeat(packet) => tracing::info!(
                        sequence_id = packet.sequence_id,
                        info = %packet.info,
                        "Received heartbeat packet"
                    ),
                }
                event_tx.emit(ServerEvent::MessageReceived { addr, message });
            }
            SessionStep::Closed(reason) => break reason,
        }
    };

    // Clean up
    handle.mark_disconnected();

    {
        let mut clients = clients.write().await;
        clients.remove(&addr);
    }

    tracing::info!(reason = %reason, "Client disconnected");

    event_tx.emit(ServerEvent::ClientDisconnected { addr, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Client, ClientEvent};
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn local_server_config() -> NetworkConfig {
        NetworkConfig::server(0).with_bind_address("127.0.0.1")
    }

    async fn wait_for<E, F>(rx: &mut mpsc::Receiver<E>, mut pred: F) -> E
    where
        F: FnMut(&E) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(NetworkConfig::default());
        assert!(!server.is_running().await);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut server = Server::new(local_server_config());
        let mut events = server.take_event_receiver().unwrap();

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running().await);
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        server.stop().await.unwrap();
        wait_for(&mut events, |e| matches!(e, ServerEvent::Stopped)).await;
        assert!(!server.is_running().await);
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_client_heartbeats_reach_server() {
        let mut server = Server::new(local_server_config().with_reader_idle(Duration::from_secs(2)));
        let mut server_events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();

        let config = NetworkConfig::client("127.0.0.1", addr.port())
            .with_writer_idle(Duration::from_millis(100))
            .with_heartbeat_info("test client");
        let mut client = Client::new(config);
        let _client_events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();

        let mut last_seq = 0;
        for _ in 0..3 {
            let event = wait_for(&mut server_events, |e| {
                matches!(e, ServerEvent::MessageReceived { .. } | ServerEvent::ClientDisconnected { .. })
            })
            .await;
            match event {
                ServerEvent::MessageReceived { message: Message::Heartbeat(packet), .. } => {
                    assert_eq!(packet.info, "test client");
                    assert!(packet.sequence_id > last_seq);
                    last_seq = packet.sequence_id;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert_eq!(server.clients().await.len(), 1);
        client.disconnect().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped() {
        let mut server =
            Server::new(local_server_config().with_reader_idle(Duration::from_millis(200)));
        let mut server_events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();

        // no writer idle timer, so no heartbeats
        let config = NetworkConfig::client("127.0.0.1", addr.port()).with_writer_idle(Duration::ZERO);
        let mut client = Client::new(config);
        let mut client_events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();

        let event = wait_for(&mut server_events, |e| {
            matches!(e, ServerEvent::ClientDisconnected { .. })
        })
        .await;
        assert!(matches!(
            event,
            ServerEvent::ClientDisconnected { reason: DisconnectReason::ReaderIdle, .. }
        ));

        let event = wait_for(&mut client_events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
        assert!(matches!(
            event,
            ClientEvent::Disconnected { reason: DisconnectReason::PeerClosed }
        ));
        assert!(!client.is_connected().await);
        assert!(server.clients().await.is_empty());
    }

    #[tokio::test]
    async fn test_bad_peer_does_not_affect_others() {
        let mut server = Server::new(local_server_config());
        let mut server_events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();

        // a peer speaking the wrong protocol
        let mut rogue = TcpStream::connect(addr).await.unwrap();
        let rogue_addr = rogue.local_addr().unwrap();
        let mut frame = BytesMut::new();
        MessageCodec::default()
            .encode(&Message::heartbeat("rogue"), &mut frame)
            .unwrap();
        frame[6] = 99; // unknown message type
        rogue.write_all(&frame).await.unwrap();

        let event = wait_for(&mut server_events, |e| {
            matches!(e, ServerEvent::ClientDisconnected { .. })
        })
        .await;
        match event {
            ServerEvent::ClientDisconnected { addr, reason: DisconnectReason::Protocol(e) } => {
                assert_eq!(addr, rogue_addr);
                assert!(e.contains("Unknown message type"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // a well-behaved client still gets through
        let config = NetworkConfig::client("127.0.0.1", addr.port()).with_writer_idle(Duration::ZERO);
        let mut client = Client::new(config);
        let _client_events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();
        client.send_heartbeat().await.unwrap();

        let event = wait_for(&mut server_events, |e| {
            matches!(e, ServerEvent::MessageReceived { .. })
        })
        .await;
        assert!(matches!(event, ServerEvent::MessageReceived { message: Message::Heartbeat(_), .. }));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let server = Server::new(local_server_config());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(matches!(
            server.send_to(&addr, Message::heartbeat("x")).await,
            Err(ServerError::UnknownClient(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_stall_idle_close() {
        let mut server =
            Server::new(local_server_config().with_reader_idle(Duration::from_millis(300)));
        // held but never drained
        let _server_events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();

        let config = NetworkConfig::client("127.0.0.1", addr.port()).with_writer_idle(Duration::ZERO);
        let mut client = Client::new(config);
        let mut client_events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();
        for _ in 0..300 {
            client.send_heartbeat().await.unwrap();
        }

        // the client goes silent and must still be dropped
        let event = wait_for(&mut client_events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
        assert!(matches!(
            event,
            ClientEvent::Disconnected { reason: DisconnectReason::PeerClosed }
        ));
        assert!(server.dropped_events() > 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !server.clients().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_accepted_sockets_keep_alive() {
        let server = Server::new(local_server_config());
        assert!(server.config.keepalive);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let socket = TcpSocket::from_std_stream(accepted.into_std().unwrap());
        assert!(socket.keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_keepalive_can_be_disabled() {
        let server = Server::new(local_server_config().with_keepalive(false));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let socket = TcpSocket::from_std_stream(accepted.into_std().unwrap());
        assert!(!socket.keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_send_to_rejects_oversized_message() {
        let mut server = Server::new(local_server_config());
        let mut server_events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();

        let mut client = Client::new(
            NetworkConfig::client("127.0.0.1", addr.port()).with_writer_idle(Duration::ZERO),
        );
        let mut client_events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();

        let event = wait_for(&mut server_events, |e| matches!(e, ServerEvent::ClientConnected { .. })).await;
        let peer = match event {
            ServerEvent::ClientConnected { addr } => addr,
            other => panic!("unexpected event: {:?}", other),
        };

        let err = server
            .send_to(&peer, Message::heartbeat("x".repeat(2000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Connection(ConnectionError::Protocol(_))));

        // the connection survives and still carries traffic
        server.send_to(&peer, Message::heartbeat("after")).await.unwrap();
        let event = wait_for(&mut client_events, |e| matches!(e, ClientEvent::MessageReceived { .. })).await;
        match event {
            ClientEvent::MessageReceived { message: Message::Heartbeat(packet) } => {
                assert_eq!(packet.info, "after");
                assert_eq!(packet.sequence_id, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        server.stop().await.unwrap();
    }
}
