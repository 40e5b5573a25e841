//! Binary wire protocol for live-feed frames.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌────────────┬───────────────┬───────┬──────────────┬─────────┐
//! │ frame_type │ collection_id │ seq   │ correlation? │ entity? │
//! │ 1 byte     │ 16 bytes      │ 8 B   │ 1+16 bytes   │ variable│
//! └────────────┴───────────────┴───────┴──────────────┴─────────┘
//! ```
//!
//! Entity payloads travel as opaque bincode bytes inside [`WireEntity`];
//! the feed adapter decodes them into the payload type it was opened for.
//! No other transport detail is mandated — any carrier of these frames
//! (or of equivalent events) satisfies the engine's [`crate::sources::LiveFeed`]
//! contract.

use crate::sources::{FeedEvent, FeedEventKind};
use agora_core::{Entity, Payload};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame types for the feed protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Client → server: open a subscription for `collection_id`.
    Subscribe = 1,
    /// Server → client: subscription is open; events will follow.
    SubscribeAck = 2,
    /// A new entity appeared in the collection.
    Insert = 3,
    /// An existing entity changed.
    Update = 4,
    /// An entity was deleted.
    Delete = 5,
    /// Heartbeat ping.
    Ping = 6,
    /// Heartbeat pong.
    Pong = 7,
}

/// An entity as it travels on the wire.
///
/// The body is the bincode encoding of the collection's payload type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntity {
    pub id: Uuid,
    pub version: u64,
    pub ordering_key: u64,
    pub deleted: bool,
    pub body: Vec<u8>,
}

impl WireEntity {
    /// Encode a typed entity for the wire.
    pub fn from_entity<P: Payload>(entity: &Entity<P>) -> Result<Self, ProtocolError> {
        let body = bincode::serde::encode_to_vec(&entity.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            id: entity.id,
            version: entity.version,
            ordering_key: entity.ordering_key,
            deleted: entity.deleted,
            body,
        })
    }

    /// Decode into a typed entity, validating the required fields.
    ///
    /// A nil id or a zero ordering key marks a malformed feed and is
    /// rejected here rather than merged downstream.
    pub fn into_entity<P: Payload>(self) -> Result<Entity<P>, ProtocolError> {
        if self.id.is_nil() {
            return Err(ProtocolError::MalformedEntity("nil entity id".to_string()));
        }
        if self.ordering_key == 0 {
            return Err(ProtocolError::MalformedEntity(
                "zero ordering key".to_string(),
            ));
        }
        let (payload, _) =
            bincode::serde::decode_from_slice(&self.body, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(Entity {
            id: self.id,
            version: self.version,
            ordering_key: self.ordering_key,
            deleted: self.deleted,
            provisional: false,
            payload,
        })
    }
}

/// Top-level feed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedFrame {
    pub frame_type: FrameType,
    pub collection_id: Uuid,
    /// Feed-assigned sequence number, for diagnostics.
    pub seq: u64,
    /// Echo of the client correlation id for locally-originated writes.
    pub correlation_id: Option<Uuid>,
    /// Present on Insert/Update/Delete frames.
    pub entity: Option<WireEntity>,
}

impl FeedFrame {
    /// Create a subscribe request.
    pub fn subscribe(collection_id: Uuid) -> Self {
        Self {
            frame_type: FrameType::Subscribe,
            collection_id,
            seq: 0,
            correlation_id: None,
            entity: None,
        }
    }

    /// Create a subscribe acknowledgement.
    pub fn subscribe_ack(collection_id: Uuid) -> Self {
        Self {
            frame_type: FrameType::SubscribeAck,
            collection_id,
            seq: 0,
            correlation_id: None,
            entity: None,
        }
    }

    /// Create an insert notification.
    pub fn insert(collection_id: Uuid, seq: u64, entity: WireEntity) -> Self {
        Self {
            frame_type: FrameType::Insert,
            collection_id,
            seq,
            correlation_id: None,
            entity: Some(entity),
        }
    }

    /// Create an update notification.
    pub fn update(collection_id: Uuid, seq: u64, entity: WireEntity) -> Self {
        Self {
            frame_type: FrameType::Update,
            collection_id,
            seq,
            correlation_id: None,
            entity: Some(entity),
        }
    }

    /// Create a delete notification.
    pub fn delete(collection_id: Uuid, seq: u64, entity: WireEntity) -> Self {
        Self {
            frame_type: FrameType::Delete,
            collection_id,
            seq,
            correlation_id: None,
            entity: Some(entity),
        }
    }

    /// Create a ping frame.
    pub fn ping(collection_id: Uuid) -> Self {
        Self {
            frame_type: FrameType::Ping,
            collection_id,
            seq: 0,
            correlation_id: None,
            entity: None,
        }
    }

    /// Create a pong frame.
    pub fn pong(collection_id: Uuid) -> Self {
        Self {
            frame_type: FrameType::Pong,
            collection_id,
            seq: 0,
            correlation_id: None,
            entity: None,
        }
    }

    /// Attach a correlation echo.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    /// Convert an Insert/Update/Delete frame into a typed feed event.
    pub fn feed_event<P: Payload>(self) -> Result<FeedEvent<P>, ProtocolError> {
        let kind = match self.frame_type {
            FrameType::Insert => FeedEventKind::Insert,
            FrameType::Update => FeedEventKind::Update,
            FrameType::Delete => FeedEventKind::Delete,
            _ => return Err(ProtocolError::InvalidFrameType),
        };
        let entity = self.entity.ok_or(ProtocolError::MissingEntity)?.into_entity()?;
        Ok(FeedEvent {
            kind,
            entity,
            correlation_id: self.correlation_id,
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidFrameType,
    MissingEntity,
    MalformedEntity(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::InvalidFrameType => write!(f, "invalid frame type"),
            Self::MissingEntity => write!(f, "frame is missing its entity"),
            Self::MalformedEntity(e) => write!(f, "malformed entity: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_entity(content: &str) -> Entity<String> {
        Entity::new(Uuid::new_v4(), 1, 1_700_000_000_000, content.to_string())
    }

    #[test]
    fn test_frame_roundtrip() {
        let collection = Uuid::new_v4();
        let entity = message_entity("hello");
        let wire = WireEntity::from_entity(&entity).unwrap();

        let frame = FeedFrame::insert(collection, 42, wire);
        let encoded = frame.encode().unwrap();
        let decoded = FeedFrame::decode(&encoded).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Insert);
        assert_eq!(decoded.collection_id, collection);
        assert_eq!(decoded.seq, 42);

        let event: FeedEvent<String> = decoded.feed_event().unwrap();
        assert_eq!(event.kind, FeedEventKind::Insert);
        assert_eq!(event.entity, entity);
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let collection = Uuid::new_v4();
        let frame = FeedFrame::subscribe(collection);
        let decoded = FeedFrame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Subscribe);
        assert_eq!(decoded.collection_id, collection);
        assert!(decoded.entity.is_none());
    }

    #[test]
    fn test_correlation_echo_roundtrip() {
        let collection = Uuid::new_v4();
        let correlation = Uuid::new_v4();
        let wire = WireEntity::from_entity(&message_entity("mine")).unwrap();

        let frame = FeedFrame::insert(collection, 1, wire).with_correlation(correlation);
        let decoded = FeedFrame::decode(&frame.encode().unwrap()).unwrap();

        let event: FeedEvent<String> = decoded.feed_event().unwrap();
        assert_eq!(event.correlation_id, Some(correlation));
    }

    #[test]
    fn test_delete_carries_tombstone() {
        let mut entity = message_entity("gone");
        entity.deleted = true;
        let wire = WireEntity::from_entity(&entity).unwrap();

        let frame = FeedFrame::delete(Uuid::new_v4(), 7, wire);
        let event: FeedEvent<String> = FeedFrame::decode(&frame.encode().unwrap())
            .unwrap()
            .feed_event()
            .unwrap();

        assert_eq!(event.kind, FeedEventKind::Delete);
        assert!(event.entity.deleted);
    }

    #[test]
    fn test_nil_id_rejected() {
        let wire = WireEntity {
            id: Uuid::nil(),
            version: 1,
            ordering_key: 100,
            deleted: false,
            body: Vec::new(),
        };
        assert!(matches!(
            wire.into_entity::<String>(),
            Err(ProtocolError::MalformedEntity(_))
        ));
    }

    #[test]
    fn test_zero_ordering_key_rejected() {
        let wire = WireEntity {
            id: Uuid::new_v4(),
            version: 1,
            ordering_key: 0,
            deleted: false,
            body: Vec::new(),
        };
        assert!(matches!(
            wire.into_entity::<String>(),
            Err(ProtocolError::MalformedEntity(_))
        ));
    }

    #[test]
    fn test_feed_event_requires_entity() {
        let frame = FeedFrame {
            frame_type: FrameType::Insert,
            collection_id: Uuid::new_v4(),
            seq: 0,
            correlation_id: None,
            entity: None,
        };
        assert!(matches!(
            frame.feed_event::<String>(),
            Err(ProtocolError::MissingEntity)
        ));
    }

    #[test]
    fn test_ping_is_not_a_feed_event() {
        let frame = FeedFrame::ping(Uuid::new_v4());
        assert!(matches!(
            frame.feed_event::<String>(),
            Err(ProtocolError::InvalidFrameType)
        ));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(FeedFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_frame_type_values() {
        assert_eq!(FrameType::Subscribe as u8, 1);
        assert_eq!(FrameType::SubscribeAck as u8, 2);
        assert_eq!(FrameType::Insert as u8, 3);
        assert_eq!(FrameType::Update as u8, 4);
        assert_eq!(FrameType::Delete as u8, 5);
        assert_eq!(FrameType::Ping as u8, 6);
        assert_eq!(FrameType::Pong as u8, 7);
    }
}
