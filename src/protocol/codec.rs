//! Protocol codec for encoding/decoding messages
//!
//! Handles the fixed 16-byte frame header and dispatches payloads to the
//! serializer selected by the header's algorithm tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::{
    Message, MessageType, SerializationError, SerializerAlgorithm, SerializerRegistry,
    DEFAULT_MAX_FRAME_LENGTH, HEADER_SENTINEL, HEADER_SIZE, MAGIC_BYTES, PROTOCOL_VERSION,
};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes: {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("Unsupported protocol version {0} (expected {})", PROTOCOL_VERSION)]
    UnsupportedVersion(u8),

    #[error("Invalid header sentinel {0:#04x}")]
    InvalidSentinel(u8),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown message type tag {0}")]
    UnknownMessageType(u8),

    #[error("Unsupported serialization algorithm tag {0}")]
    UnsupportedAlgorithm(u8),

    #[error("No serialization algorithm assigned to message type {0}")]
    UnassignedMessageType(MessageType),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),
}

impl CodecError {
    /// True when only the payload of an otherwise well-formed frame was bad.
    /// The frame has already been consumed, so the stream stays aligned.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, CodecError::Serialization(_))
    }
}

/// Parsed fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw serialization algorithm tag
    pub algorithm: u8,
    /// Raw message type tag
    pub message_type: u8,
    pub sequence_id: u32,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(
        algorithm: SerializerAlgorithm,
        message_type: MessageType,
        sequence_id: u32,
        payload_length: u32,
    ) -> Self {
        Self {
            algorithm: algorithm.tag(),
            message_type: message_type.tag(),
            sequence_id,
            payload_length,
        }
    }

    /// Total size of the frame this header describes
    pub fn frame_length(&self) -> usize {
        HEADER_SIZE.saturating_add(self.payload_length as usize)
    }

    /// Write the header
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.algorithm);
        dst.put_u8(self.message_type);
        dst.put_u32(self.sequence_id);
        dst.put_u8(HEADER_SENTINEL);
        dst.put_u32(self.payload_length);
    }

    /// Parse and validate a header from the start of `src`
    pub fn decode(src: &[u8]) -> Result<Self, CodecError> {
        if src.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                available: src.len(),
            });
        }

        let magic = [src[0], src[1], src[2], src[3]];
        if magic != MAGIC_BYTES {
            return Err(CodecError::InvalidMagic(magic));
        }
        if src[4] != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(src[4]));
        }
        if src[11] != HEADER_SENTINEL {
            return Err(CodecError::InvalidSentinel(src[11]));
        }

        Ok(Self {
            algorithm: src[5],
            message_type: src[6],
            sequence_id: u32::from_be_bytes([src[7], src[8], src[9], src[10]]),
            payload_length: u32::from_be_bytes([src[12], src[13], src[14], src[15]]),
        })
    }
}

/// Encodes messages into frames and decodes frames back into messages
#[derive(Debug, Clone)]
pub struct MessageCodec {
    registry: Arc<SerializerRegistry>,
    max_frame_length: usize,
}

impl MessageCodec {
    pub fn new(registry: Arc<SerializerRegistry>) -> Self {
        Self {
            registry,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Set the largest frame (header included) this codec will produce or accept
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn registry(&self) -> &Arc<SerializerRegistry> {
        &self.registry
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Encode a message with the algorithm assigned to its type
    pub fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let message_type = message.message_type();
        let algorithm = self
            .registry
            .default_algorithm(message_type)
            .ok_or(CodecError::UnassignedMessageType(message_type))?;
        self.encode_with(message, algorithm, dst)
    }

    /// Encode a message with an explicit algorithm. Nothing is written on error.
    pub fn encode_with(
        &self,
        message: &Message,
        algorithm: SerializerAlgorithm,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let serializer = self
            .registry
            .get(algorithm)
            .ok_or(CodecError::UnsupportedAlgorithm(algorithm.tag()))?;

        let payload = serializer.serialize(message)?;

        let size = HEADER_SIZE + payload.len();
        let payload_length = u32::try_from(payload.len())
            .ok()
            .filter(|_| size <= self.max_frame_length)
            .ok_or(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_length,
            })?;

        dst.reserve(size);
        FrameHeader::new(algorithm, message.message_type(), message.sequence_id(), payload_length)
            .encode(dst);
        dst.put_slice(&payload);

        Ok(())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Exactly one frame is consumed once the header and length check out;
    /// any bytes after it are left in `src`.
    pub fn decode(&self, src: &mut Bytes) -> Result<Message, CodecError> {
        let header = FrameHeader::decode(src)?;

        let frame_length = header.frame_length();
        if frame_length > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                size: frame_length,
                max: self.max_frame_length,
            });
        }
        if src.len() < frame_length {
            return Err(CodecError::Truncated {
                needed: frame_length,
                available: src.len(),
            });
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(header.payload_length as usize);

        let message_type = MessageType::from_tag(header.message_type)
            .ok_or(CodecError::UnknownMessageType(header.message_type))?;

        // The wire tag wins over the registry's default for this type
        let serializer = SerializerAlgorithm::from_tag(header.algorithm)
            .and_then(|algorithm| self.registry.get(algorithm))
            .ok_or(CodecError::UnsupportedAlgorithm(header.algorithm))?;

        let mut message = serializer.deserialize(message_type, &payload)?;
        message.set_sequence_id(header.sequence_id);

        Ok(message)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(Arc::new(SerializerRegistry::standard()))
    }
}

/// Formats bytes as an offset-prefixed hex dump, 16 bytes per row
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (row, chunk) in self.0.chunks(16).enumerate() {
            if row > 0 {
                writeln!(f)?;
            }
            write!(f, "{:08x}:", row * 16)?;
            for byte in chunk {
                write!(f, " {:02x}", byte)?;
            }
        }
        Ok(())
    }
}
