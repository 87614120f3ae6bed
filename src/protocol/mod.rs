//! Protocol module - Defines the PulseWire wire protocol
//!
//! Every frame carries a fixed 16-byte header followed by the payload:
//! - 4 bytes magic (`01 02 03 04`)
//! - 1 byte protocol version
//! - 1 byte serialization algorithm
//! - 1 byte message type
//! - 4 bytes sequence id (big-endian)
//! - 1 byte end-of-header sentinel (`0xFF`)
//! - 4 bytes payload length (big-endian)
//! - Variable length payload

mod codec;
mod framer;
mod message;
mod serializer;

pub use codec::*;
pub use framer::*;
pub use message::*;
pub use serializer::*;

/// Protocol version written into (and required from) every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port for PulseWire communication
pub const DEFAULT_PORT: u16 = 8080;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

/// Marks the end of the fixed header
pub const HEADER_SENTINEL: u8 = 0xFF;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Offset of the big-endian payload length field
pub const LENGTH_FIELD_OFFSET: usize = 12;

/// Default maximum frame length, header included
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024;
