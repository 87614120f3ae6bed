//! Per-connection session loop
//!
//! A [`Session`] multiplexes inbound frames, queued outbound messages, idle
//! timers and the shutdown signal for one connection. Reader idleness closes
//! the connection; writer idleness sends a heartbeat.

use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::connection::{Connection, ConnectionError, ConnectionResult};
use super::idle::{IdleEvent, IdleSupervisor};
use super::DecodeErrorPolicy;
use crate::protocol::{HeartbeatPacket, Message};

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream
    PeerClosed,
    /// Nothing was received within the reader idle timeout
    ReaderIdle,
    /// Local shutdown was requested
    Shutdown,
    /// The peer violated the wire protocol
    Protocol(String),
    /// The transport failed
    Transport(String),
}

impl From<&ConnectionError> for DisconnectReason {
    fn from(error: &ConnectionError) -> Self {
        match error {
            ConnectionError::Protocol(e) => DisconnectReason::Protocol(e.to_string()),
            other => DisconnectReason::Transport(other.to_string()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "connection closed by peer"),
            DisconnectReason::ReaderIdle => write!(f, "read idle timed out"),
            DisconnectReason::Shutdown => write!(f, "shutdown requested"),
            DisconnectReason::Protocol(e) => write!(f, "protocol error: {}", e),
            DisconnectReason::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Outcome of driving a session one step
#[derive(Debug)]
pub enum SessionStep {
    /// A message arrived from the peer
    Message(Message),
    /// The connection is closed; every later call returns the same reason
    Closed(DisconnectReason),
}

/// Drives one connection
pub struct Session<S> {
    conn: Connection<S>,
    idle: IdleSupervisor,
    outbound: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
    heartbeat_info: String,
    decode_error_policy: DecodeErrorPolicy,
    closed: Option<DisconnectReason>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        conn: Connection<S>,
        idle: IdleSupervisor,
        outbound: mpsc::Receiver<Message>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            conn,
            idle,
            outbound,
            shutdown,
            heartbeat_info: "heartbeat".to_string(),
            decode_error_policy: DecodeErrorPolicy::Close,
            closed: None,
        }
    }

    pub fn with_heartbeat_info(mut self, info: impl Into<String>) -> Self {
        self.heartbeat_info = info.into();
        self
    }

    pub fn with_decode_error_policy(mut self, policy: DecodeErrorPolicy) -> Self {
        self.decode_error_policy = policy;
        self
    }

    pub fn connection(&self) -> &Connection<S> {
        &self.conn
    }

    /// Run until the next inbound message or until the connection closes
    pub async fn next(&mut self) -> SessionStep {
        if let Some(reason) = &self.closed {
            return SessionStep::Closed(reason.clone());
        }
        if *self.shutdown.borrow() {
            return self.finish(DisconnectReason::Shutdown).await;
        }

        let peer = self.conn.remote_addr();

        loop {
            tokio::select! {
                result = self.conn.recv() => {
                    match result {
                        Ok(Some(message)) => {
                            self.idle.record_read(Instant::now());
                            return SessionStep::Message(message);
                        }
                        Ok(None) => {
                            return self.finish(DisconnectReason::PeerClosed).await;
                        }
                        Err(ConnectionError::Protocol(e))
                            if e.is_payload_error()
                                && self.decode_error_policy == DecodeErrorPolicy::Skip =>
                        {
                            tracing::warn!(peer = %peer, error = %e, "Skipping undecodable frame");
                            self.idle.record_read(Instant::now());
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Closing connection");
                            return self.finish(DisconnectReason::from(&e)).await;
                        }
                    }
                }

                Some(message) = self.outbound.recv() => {
                    match self.send(&message).await {
                        Ok(_) => {}
                        // encode failure, nothing was written
                        Err(ConnectionError::Protocol(e)) => {
                            tracing::error!(peer = %peer, error = %e, "Dropping unencodable message");
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Send failed");
                            return self.finish(DisconnectReason::from(&e)).await;
                        }
                    }
                }

                event = self.idle.wait() => {
                    match event {
                        IdleEvent::ReaderIdle => {
                            tracing::info!(peer = %peer, "Read idle timed out, closing connection");
                            return self.finish(DisconnectReason::ReaderIdle).await;
                        }
                        IdleEvent::WriterIdle => {
                            let heartbeat =
                                Message::Heartbeat(HeartbeatPacket::new(0, self.heartbeat_info.clone()));
                            match self.send(&heartbeat).await {
                                Ok(sequence_id) => tracing::info!(
                                    peer = %peer,
                                    sequence_id,
                                    "No data sent within writer idle timeout, sent heartbeat"
                                ),
                                Err(ConnectionError::Protocol(e)) => {
                                    tracing::error!(peer = %peer, error = %e, "Heartbeat cannot be encoded");
                                }
                                Err(e) => {
                                    tracing::warn!(peer = %peer, error = %e, "Heartbeat failed");
                                    return self.finish(DisconnectReason::from(&e)).await;
                                }
                            }
                        }
                    }
                }

                _ = self.shutdown.changed() => {
                    return self.finish(DisconnectReason::Shutdown).await;
                }
            }
        }
    }

    /// Send a message right away, bypassing the outbound queue.
    /// Returns the sequence id it was sent with.
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<u32> {
        let sequence_id = self.conn.send(message).await?;
        self.idle.record_write(Instant::now());
        Ok(sequence_id)
    }

    async fn finish(&mut self, reason: DisconnectReason) -> SessionStep {
        if let Err(e) = self.conn.close().await {
            tracing::debug!(peer = %self.conn.remote_addr(), "Close failed: {}", e);
        }
        self.closed = Some(reason.clone());
        SessionStep::Closed(reason)
    }
}
