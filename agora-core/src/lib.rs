//! # agora-core — entity model for the agora chat data layer
//!
//! Defines the generic unit of synchronization: an [`Entity`] carrying a
//! server-assigned id, a monotonic revision counter, a creation-ordered
//! sort position, and an entity-kind payload. The sync engine in
//! `agora-sync` is generic over the payload type, so one reconciliation
//! algorithm serves every collection kind (channel messages, DM threads,
//! server rosters, online presence).
//!
//! Total order: entities sort by `(ordering_key, id)` ascending. The id
//! tiebreak makes the order independent of arrival sequence when two
//! entities share a creation instant.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use uuid::Uuid;

pub mod chat;

pub use chat::{MemberBody, MemberRole, MessageBody, PresenceBody, PresenceStatus, ReactionMap};

/// Bounds required of an entity-kind payload.
///
/// Payloads cross task boundaries and the wire, so they must be owned,
/// thread-safe, and serde-encodable.
pub trait Payload:
    Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Payload for T where
    T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Payloads that carry a reaction map (messages do, roster rows don't).
///
/// The engine's reaction-toggle path goes through this seam so it never
/// needs to know the payload's concrete shape.
pub trait Reactable {
    /// Add or remove `user` from the reaction identified by `key`.
    fn toggle_reaction(&mut self, key: &str, user: Uuid, add: bool);
}

/// Total-order position of an entity within its collection.
///
/// Derived `Ord` compares `ordering_key` first, then the id's bytes —
/// the tiebreak that keeps the order stable across network paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SortKey {
    /// Creation timestamp in milliseconds.
    pub ordering_key: u64,
    /// Entity id, byte-ordered.
    pub id: Uuid,
}

/// The generic unit held in a synchronized collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity<P> {
    /// Stable server-assigned id, unique within the collection.
    pub id: Uuid,
    /// Monotonic per-entity revision counter.
    pub version: u64,
    /// Creation timestamp in milliseconds; ties broken by id.
    pub ordering_key: u64,
    /// Tombstone flag — hidden from snapshots when set.
    pub deleted: bool,
    /// Local, not-yet-confirmed write. Never set on wire entities.
    #[serde(default, skip_serializing_if = "is_false")]
    pub provisional: bool,
    /// Entity-kind fields (message content, roster row, presence record).
    pub payload: P,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl<P> Entity<P> {
    /// A confirmed entity as the server describes it.
    pub fn new(id: Uuid, version: u64, ordering_key: u64, payload: P) -> Self {
        Self {
            id,
            version,
            ordering_key,
            deleted: false,
            provisional: false,
            payload,
        }
    }

    /// A provisional entity for an unconfirmed local create.
    ///
    /// The id is the client-generated correlation id and the version is 0;
    /// both are replaced wholesale when the server confirms.
    pub fn provisional(correlation_id: Uuid, ordering_key: u64, payload: P) -> Self {
        Self {
            id: correlation_id,
            version: 0,
            ordering_key,
            deleted: false,
            provisional: true,
            payload,
        }
    }

    /// Sort position of this entity.
    pub fn sort_key(&self) -> SortKey {
        SortKey {
            ordering_key: self.ordering_key,
            id: self.id,
        }
    }

    /// A well-formed entity has a real id and a real creation time.
    ///
    /// Feeds that deliver anything else are buggy; the store drops such
    /// events rather than merging them.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_nil() && self.ordering_key != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid_from_byte(b: u8) -> Uuid {
        Uuid::from_bytes([b; 16])
    }

    #[test]
    fn test_sort_key_orders_by_time_then_id() {
        let early = SortKey {
            ordering_key: 10,
            id: uuid_from_byte(9),
        };
        let late = SortKey {
            ordering_key: 20,
            id: uuid_from_byte(1),
        };
        assert!(early < late);

        let tie_low = SortKey {
            ordering_key: 10,
            id: uuid_from_byte(1),
        };
        let tie_high = SortKey {
            ordering_key: 10,
            id: uuid_from_byte(2),
        };
        assert!(tie_low < tie_high);
    }

    #[test]
    fn test_provisional_entity_shape() {
        let correlation = Uuid::new_v4();
        let entity = Entity::provisional(correlation, 42, "hello".to_string());

        assert_eq!(entity.id, correlation);
        assert_eq!(entity.version, 0);
        assert!(entity.provisional);
        assert!(!entity.deleted);
    }

    #[test]
    fn test_well_formedness() {
        let ok = Entity::new(Uuid::new_v4(), 1, 100, ());
        assert!(ok.is_well_formed());

        let nil_id = Entity::new(Uuid::nil(), 1, 100, ());
        assert!(!nil_id.is_well_formed());

        let zero_key = Entity::new(Uuid::new_v4(), 1, 0, ());
        assert!(!zero_key.is_well_formed());
    }

    #[test]
    fn test_entity_serde_roundtrip() {
        let entity = Entity::new(Uuid::new_v4(), 3, 1_700_000_000_000, "payload".to_string());
        let json = serde_json::to_string(&entity).unwrap();
        let back: Entity<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entity);
        // The provisional flag is local-only and defaults to false on decode.
        assert!(!back.provisional);
    }
}
