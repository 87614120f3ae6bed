//! Pluggable payload serializers
//!
//! A [`Serializer`] turns a message body into payload bytes and back. The
//! [`SerializerRegistry`] maps the algorithm tag carried in each frame header
//! to its implementation, and every message type to the algorithm used by
//! default when encoding. Registries are built once and never mutated.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::{HeartbeatPacket, Message, MessageType};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Wire tag identifying a serialization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializerAlgorithm {
    /// Compact native binary encoding
    Bincode = 0,
    /// JSON text encoding
    Json = 1,
}

impl SerializerAlgorithm {
    pub const ALL: [SerializerAlgorithm; 2] =
        [SerializerAlgorithm::Bincode, SerializerAlgorithm::Json];

    /// Get the wire tag
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Look up an algorithm by wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.tag() == tag)
    }
}

impl fmt::Display for SerializerAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializerAlgorithm::Bincode => write!(f, "bincode"),
            SerializerAlgorithm::Json => write!(f, "json"),
        }
    }
}

/// Serializer errors
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("{algorithm} failed to serialize {message_type}: {source}")]
    Encode {
        algorithm: SerializerAlgorithm,
        message_type: MessageType,
        #[source]
        source: BoxError,
    },

    #[error("{algorithm} failed to deserialize {message_type}: {source}")]
    Decode {
        algorithm: SerializerAlgorithm,
        message_type: MessageType,
        #[source]
        source: BoxError,
    },
}

impl SerializationError {
    fn encode(algorithm: SerializerAlgorithm, message_type: MessageType, source: impl Into<BoxError>) -> Self {
        SerializationError::Encode {
            algorithm,
            message_type,
            source: source.into(),
        }
    }

    fn decode(algorithm: SerializerAlgorithm, message_type: MessageType, source: impl Into<BoxError>) -> Self {
        SerializationError::Decode {
            algorithm,
            message_type,
            source: source.into(),
        }
    }
}

/// Encodes and decodes message bodies for one algorithm
pub trait Serializer: Send + Sync {
    /// The tag this serializer is registered under
    fn algorithm(&self) -> SerializerAlgorithm;

    /// Serialize the body of a message (the header carries type and sequence id)
    fn serialize(&self, message: &Message) -> Result<Vec<u8>, SerializationError>;

    /// Rebuild a message of the given type from payload bytes
    fn deserialize(&self, message_type: MessageType, bytes: &[u8]) -> Result<Message, SerializationError>;
}

/// bincode-backed serializer, the default for every message type
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn algorithm(&self) -> SerializerAlgorithm {
        SerializerAlgorithm::Bincode
    }

    fn serialize(&self, message: &Message) -> Result<Vec<u8>, SerializationError> {
        let result = match message {
            Message::Heartbeat(packet) => bincode::serialize(packet),
        };
        result.map_err(|e| SerializationError::encode(self.algorithm(), message.message_type(), e))
    }

    fn deserialize(&self, message_type: MessageType, bytes: &[u8]) -> Result<Message, SerializationError> {
        let result = match message_type {
            MessageType::Heartbeat => bincode::deserialize::<HeartbeatPacket>(bytes).map(Message::Heartbeat),
        };
        result.map_err(|e| SerializationError::decode(self.algorithm(), message_type, e))
    }
}

/// JSON serializer
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn algorithm(&self) -> SerializerAlgorithm {
        SerializerAlgorithm::Json
    }

    fn serialize(&self, message: &Message) -> Result<Vec<u8>, SerializationError> {
        let result = match message {
            Message::Heartbeat(packet) => serde_json::to_vec(packet),
        };
        result.map_err(|e| SerializationError::encode(self.algorithm(), message.message_type(), e))
    }

    fn deserialize(&self, message_type: MessageType, bytes: &[u8]) -> Result<Message, SerializationError> {
        let result = match message_type {
            MessageType::Heartbeat => serde_json::from_slice::<HeartbeatPacket>(bytes).map(Message::Heartbeat),
        };
        result.map_err(|e| SerializationError::decode(self.algorithm(), message_type, e))
    }
}

/// Registry construction errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No serialization algorithm assigned to message type {0}")]
    MissingDefault(MessageType),

    #[error("Message type {message_type} is assigned to unregistered algorithm {algorithm}")]
    UnregisteredDefault {
        message_type: MessageType,
        algorithm: SerializerAlgorithm,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Immutable lookup tables from algorithm tag to serializer and from
/// message type to its default algorithm
pub struct SerializerRegistry {
    serializers: HashMap<SerializerAlgorithm, Arc<dyn Serializer>>,
    defaults: HashMap<MessageType, SerializerAlgorithm>,
}

impl SerializerRegistry {
    /// Start building a custom registry
    pub fn builder() -> SerializerRegistryBuilder {
        SerializerRegistryBuilder::default()
    }

    /// Registry with every built-in serializer; all message types default to bincode
    pub fn standard() -> Self {
        let mut serializers: HashMap<SerializerAlgorithm, Arc<dyn Serializer>> = HashMap::new();
        serializers.insert(SerializerAlgorithm::Bincode, Arc::new(BincodeSerializer));
        serializers.insert(SerializerAlgorithm::Json, Arc::new(JsonSerializer));

        let defaults = MessageType::ALL
            .into_iter()
            .map(|t| (t, SerializerAlgorithm::Bincode))
            .collect();

        Self { serializers, defaults }
    }

    /// Get the serializer registered for an algorithm
    pub fn get(&self, algorithm: SerializerAlgorithm) -> Option<&dyn Serializer> {
        self.serializers.get(&algorithm).map(|s| s.as_ref())
    }

    /// Get the algorithm used when encoding a message type
    pub fn default_algorithm(&self, message_type: MessageType) -> Option<SerializerAlgorithm> {
        self.defaults.get(&message_type).copied()
    }

    /// Check whether an algorithm is registered
    pub fn supports(&self, algorithm: SerializerAlgorithm) -> bool {
        self.serializers.contains_key(&algorithm)
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut algorithms: Vec<_> = self.serializers.keys().collect();
        algorithms.sort_by_key(|a| a.tag());
        f.debug_struct("SerializerRegistry")
            .field("algorithms", &algorithms)
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Builder for [`SerializerRegistry`]
#[derive(Default)]
pub struct SerializerRegistryBuilder {
    serializers: HashMap<SerializerAlgorithm, Arc<dyn Serializer>>,
    defaults: HashMap<MessageType, SerializerAlgorithm>,
}

impl SerializerRegistryBuilder {
    /// Register a serializer under its own algorithm tag, replacing any previous one
    pub fn register(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializers.insert(serializer.algorithm(), Arc::new(serializer));
        self
    }

    /// Assign the algorithm used when encoding a message type
    pub fn assign(mut self, message_type: MessageType, algorithm: SerializerAlgorithm) -> Self {
        self.defaults.insert(message_type, algorithm);
        self
    }

    /// Finish the registry. Every message type must have a default algorithm
    /// and that algorithm must be registered.
    pub fn build(self) -> RegistryResult<SerializerRegistry> {
        for message_type in MessageType::ALL {
            match self.defaults.get(&message_type) {
                None => return Err(RegistryError::MissingDefault(message_type)),
                Some(algorithm) if !self.serializers.contains_key(algorithm) => {
                    return Err(RegistryError::UnregisteredDefault {
                        message_type,
                        algorithm: *algorithm,
                    });
                }
                Some(_) => {}
            }
        }

        Ok(SerializerRegistry {
            serializers: self.serializers,
            defaults: self.defaults,
        })
    }
}
