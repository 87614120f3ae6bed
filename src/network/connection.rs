//! Connection handling for PulseWire
//!
//! Manages individual peer connections, including:
//! - Message encoding/decoding
//! - Reassembly of fragmented frames
//! - Connection state management

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::protocol::{
    CodecError, FrameAccumulator, HeartbeatPacket, HexDump, Message, MessageCodec,
    SequenceGenerator,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection closed mid-frame with {0} bytes buffered")]
    ClosedMidFrame(usize),

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready for communication
    Connected,
    /// Connection has been closed
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A framed connection to a remote peer over any byte stream
pub struct Connection<S> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The underlying stream
    stream: S,
    /// Frame encoder/decoder
    codec: MessageCodec,
    /// Accumulates partial frames between reads
    framer: FrameAccumulator,
    /// Write buffer
    write_buf: BytesMut,
    /// Bytes reserved before each read
    read_chunk_size: usize,
    /// Numbers the messages this connection generates itself
    sequence: SequenceGenerator,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream
    pub fn new(stream: S, remote_addr: SocketAddr, codec: MessageCodec) -> Self {
        let framer = FrameAccumulator::with_max_frame_length(codec.max_frame_length());
        Self {
            remote_addr,
            stream,
            codec,
            framer,
            write_buf: BytesMut::with_capacity(1024),
            read_chunk_size: 1024,
            sequence: SequenceGenerator::new(),
            state: ConnectionState::Connected,
            stats: ConnectionStats::default(),
        }
    }

    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size.max(1);
        self
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the connection is still active
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// The per-connection sequence id generator
    pub fn sequence(&self) -> &SequenceGenerator {
        &self.sequence
    }

    /// Send a message, returning the sequence id it carried on the wire.
    ///
    /// Every outbound frame is numbered from this connection's generator, so
    /// ids increase across heartbeats and application messages alike. An id
    /// is only consumed once the message has encoded.
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<u32> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        let sequence_id = self.sequence.peek();
        let mut message = message.clone();
        message.set_sequence_id(sequence_id);

        self.write_buf.clear();
        self.codec.encode(&message, &mut self.write_buf)?;
        self.sequence.next_id();

        tracing::trace!(peer = %self.remote_addr, "Outbound frame\n{}", HexDump(&self.write_buf));

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        tracing::debug!(
            peer = %self.remote_addr,
            sequence_id,
            message_type = %message.message_type(),
            bytes = self.write_buf.len(),
            "Sent frame"
        );

        Ok(sequence_id)
    }

    /// Receive the next message. Returns `None` when the peer closed cleanly
    /// on a frame boundary.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Message>> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        loop {
            if let Some(mut frame) = self.framer.next_frame()? {
                tracing::trace!(peer = %self.remote_addr, "Inbound frame\n{}", HexDump(&frame));
                let message = self.codec.decode(&mut frame)?;
                self.stats.messages_received += 1;

                tracing::debug!(
                    peer = %self.remote_addr,
                    sequence_id = message.sequence_id(),
                    message_type = %message.message_type(),
                    "Received frame"
                );

                return Ok(Some(message));
            }

            // Read straight into the frame buffer
            let buffer = self.framer.buffer_mut();
            buffer.reserve(self.read_chunk_size);
            let n = self.stream.read_buf(buffer).await?;

            if n == 0 {
                if self.framer.is_empty() {
                    return Ok(None); // Clean close
                } else {
                    return Err(ConnectionError::ClosedMidFrame(self.framer.len()));
                }
            }

            self.stats.bytes_received += n as u64;
        }
    }

    /// Close the connection. Any partially received frame is discarded.
    /// Calling this more than once is harmless.
    pub async fn close(&mut self) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        self.state = ConnectionState::Closed;
        self.framer.clear();

        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(peer = %self.remote_addr, "Shutdown after close failed: {}", e);
        }

        Ok(())
    }
}

/// A handle for sending messages to a connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    remote_addr: SocketAddr,
    sender: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
    codec: MessageCodec,
}

impl ConnectionHandle {
    /// `codec` must match the connection's, so encode failures surface here
    pub fn new(remote_addr: SocketAddr, sender: mpsc::Sender<Message>, codec: MessageCodec) -> Self {
        Self {
            remote_addr,
            sender,
            connected: Arc::new(AtomicBool::new(true)),
            codec,
        }
    }

    /// Queue a message for this connection.
    ///
    /// Messages that cannot be encoded are rejected here and never reach the
    /// connection task. The sequence id is assigned when the frame is written.
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        let mut scratch = BytesMut::new();
        self.codec.encode(&message, &mut scratch)?;

        self.sender
            .send(message)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Queue a heartbeat
    pub async fn send_heartbeat(&self, info: &str) -> Result<(), ConnectionError> {
        self.send(Message::Heartbeat(HeartbeatPacket::new(0, info))).await
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use tokio::io::DuplexStream;
    use tokio_test::{assert_err, assert_ok};

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = tokio::io::duplex(4096);
        (
            Connection::new(a, peer(), MessageCodec::default()),
            Connection::new(b, peer(), MessageCodec::default()),
        )
    }

    fn heartbeat_bytes(sequence_id: u32, info: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        MessageCodec::default()
            .encode(&Message::Heartbeat(HeartbeatPacket::new(sequence_id, info)), &mut buf)
            .unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_send_recv_in_order() {
        let (mut left, mut right) = pair();

        for i in 1..=5 {
            let msg = Message::heartbeat(format!("beat {}", i));
            assert_eq!(assert_ok!(left.send(&msg).await), i);
        }
        for i in 1..=5 {
            let msg = right.recv().await.unwrap().unwrap();
            assert_eq!(msg, Message::Heartbeat(HeartbeatPacket::new(i, format!("beat {}", i))));
        }
        assert_eq!(left.stats().messages_sent, 5);
        assert_eq!(right.stats().messages_received, 5);
    }

    #[tokio::test]
    async fn test_send_writes_exact_frame() {
        let expected = heartbeat_bytes(1, "ping");
        let mock = tokio_test::io::Builder::new().write(&expected).build();

        let mut conn = Connection::new(mock, peer(), MessageCodec::default());
        let ping = Message::Heartbeat(HeartbeatPacket::new(0, "ping"));
        assert_ok!(conn.send(&ping).await);
        assert_eq!(conn.stats().bytes_sent, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_recv_reassembles_fragments() {
        let bytes = heartbeat_bytes(7, "fragmented");
        let mock = tokio_test::io::Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..17])
            .read(&bytes[17..])
            .build();

        let mut conn = Connection::new(mock, peer(), MessageCodec::default());
        let msg = conn.recv().await.unwrap().unwrap();
        assert_eq!(msg, Message::Heartbeat(HeartbeatPacket::new(7, "fragmented")));
        assert!(conn.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_pipelined_frames() {
        let mut bytes = heartbeat_bytes(1, "a");
        bytes.extend(heartbeat_bytes(2, "b"));
        bytes.extend(heartbeat_bytes(3, "c"));
        let mock = tokio_test::io::Builder::new().read(&bytes).build();

        let mut conn = Connection::new(mock, peer(), MessageCodec::default());
        for seq in 1..=3 {
            assert_eq!(conn.recv().await.unwrap().unwrap().sequence_id(), seq);
        }
        assert!(conn.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let bytes = heartbeat_bytes(1, "cut short");
        let mock = tokio_test::io::Builder::new().read(&bytes[..20]).build();

        let mut conn = Connection::new(mock, peer(), MessageCodec::default());
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ClosedMidFrame(20)));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let mut bytes = heartbeat_bytes(1, "x");
        bytes[12..16].copy_from_slice(&5000u32.to_be_bytes());
        let mock = tokio_test::io::Builder::new().read(&bytes).build();

        let mut conn = Connection::new(mock, peer(), MessageCodec::default());
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(CodecError::FrameTooLarge { size: 5016, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut left, mut right) = pair();

        assert_ok!(left.close().await);
        assert_ok!(left.close().await);
        assert_eq!(left.state(), ConnectionState::Closed);

        let msg = Message::heartbeat("late");
        assert!(matches!(left.send(&msg).await, Err(ConnectionError::Closed)));
        assert!(matches!(left.recv().await, Err(ConnectionError::Closed)));

        // the peer sees a clean end of stream
        assert!(right.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_restamps_sequence_ids() {
        let (mut left, mut right) = pair();

        // ids picked elsewhere are replaced by the connection's own
        for _ in 0..10 {
            Message::heartbeat("burn");
        }
        assert_eq!(assert_ok!(left.send(&Message::heartbeat("app")).await), 1);
        assert_eq!(
            assert_ok!(left.send(&Message::Heartbeat(HeartbeatPacket::new(500, "x"))).await),
            2
        );

        assert_eq!(right.recv().await.unwrap().unwrap().sequence_id(), 1);
        assert_eq!(right.recv().await.unwrap().unwrap().sequence_id(), 2);
        assert_eq!(left.sequence().peek(), 3);
    }

    #[tokio::test]
    async fn test_failed_encode_consumes_no_id() {
        let (mut left, mut right) = pair();

        let oversized = Message::heartbeat("x".repeat(2000));
        assert!(matches!(
            left.send(&oversized).await,
            Err(ConnectionError::Protocol(CodecError::FrameTooLarge { .. }))
        ));
        assert!(left.is_active());

        assert_eq!(assert_ok!(left.send(&Message::heartbeat("fits")).await), 1);
        assert_eq!(right.recv().await.unwrap().unwrap().sequence_id(), 1);
    }

    #[tokio::test]
    async fn test_handle_queues_messages() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(peer(), tx, MessageCodec::default());

        assert_ok!(handle.send_heartbeat("one").await);
        assert_ok!(handle.send(Message::heartbeat("two")).await);
        assert_eq!(rx.recv().await.unwrap(), Message::Heartbeat(HeartbeatPacket::new(0, "one")));
        assert_eq!(rx.recv().await.unwrap().message_type(), MessageType::Heartbeat);

        handle.mark_disconnected();
        assert!(!handle.is_connected());
        assert_err!(handle.send_heartbeat("three").await);
    }

    #[tokio::test]
    async fn test_handle_rejects_unencodable_message() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(peer(), tx, MessageCodec::default());

        let err = handle.send_heartbeat(&"x".repeat(2000)).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(CodecError::FrameTooLarge { size: 2024, max: 1024 })
        ));
        assert!(rx.try_recv().is_err());
        assert!(handle.is_connected());
    }
}
