//! Protocol message definitions
//!
//! Defines all message types exchanged between PulseWire peers and the
//! sequence id generators that number them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Wire tag identifying the shape of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 0,
}

impl MessageType {
    /// Every declared message type
    pub const ALL: [MessageType; 1] = [MessageType::Heartbeat];

    /// Get the wire tag
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Look up a message type by wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Heartbeat => write!(f, "Heartbeat"),
        }
    }
}

/// Keep-alive packet sent when a connection has been quiet for too long
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPacket {
    /// Carried in the frame header, not in the payload
    #[serde(skip)]
    pub sequence_id: u32,
    /// Free-form text describing the sender
    pub info: String,
}

impl HeartbeatPacket {
    pub fn new(sequence_id: u32, info: impl Into<String>) -> Self {
        Self {
            sequence_id,
            info: info.into(),
        }
    }
}

/// All possible protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Heartbeat to keep the connection alive
    Heartbeat(HeartbeatPacket),
}

impl Message {
    /// Build a heartbeat numbered from the process-wide generator.
    /// A connection renumbers it from its own generator when sending.
    pub fn heartbeat(info: impl Into<String>) -> Self {
        Message::Heartbeat(HeartbeatPacket::new(
            SequenceGenerator::global().next_id(),
            info,
        ))
    }

    /// Get the message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Heartbeat(_) => MessageType::Heartbeat,
        }
    }

    /// Get the sequence id
    pub fn sequence_id(&self) -> u32 {
        match self {
            Message::Heartbeat(packet) => packet.sequence_id,
        }
    }

    /// Overwrite the sequence id (used when restoring it from a frame header)
    pub fn set_sequence_id(&mut self, sequence_id: u32) {
        match self {
            Message::Heartbeat(packet) => packet.sequence_id = sequence_id,
        }
    }
}

static GLOBAL_SEQUENCE: SequenceGenerator = SequenceGenerator::new();

/// Monotonically increasing sequence id source, safe to share across tasks
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU32,
}

impl SequenceGenerator {
    /// Create a generator whose first id is 1
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// The process-wide generator
    pub fn global() -> &'static SequenceGenerator {
        &GLOBAL_SEQUENCE
    }

    /// Hand out the next id. Wraps around after `u32::MAX`.
    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Peek at the id the next call will return
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::Heartbeat.tag(), 0);
        assert_eq!(MessageType::from_tag(0), Some(MessageType::Heartbeat));
        assert_eq!(MessageType::from_tag(42), None);
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let seq = SequenceGenerator::new();
        assert_eq!(seq.next_id(), 1);
        assert_eq!(seq.next_id(), 2);
        assert_eq!(seq.peek(), 3);
    }

    #[test]
    fn test_sequence_ids_unique_across_threads() {
        let seq = Arc::new(SequenceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || (0..1000).map(|_| seq.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate sequence id {}", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn test_global_heartbeats_increase() {
        let first = Message::heartbeat("a");
        let second = Message::heartbeat("b");
        assert!(second.sequence_id() > first.sequence_id());
        assert_eq!(first.message_type(), MessageType::Heartbeat);
    }

    #[test]
    fn test_set_sequence_id() {
        let mut msg = Message::Heartbeat(HeartbeatPacket::new(1, "x"));
        msg.set_sequence_id(77);
        assert_eq!(msg.sequence_id(), 77);
    }
}
