//! Collaborator seams — the four interfaces the engine consumes.
//!
//! The engine never talks to a network or a store directly; it is generic
//! over implementations of these traits:
//!
//! - [`PageFetcher`] — bounded, cursor-ordered slices of a collection
//! - [`LiveFeed`] — push stream of change notifications
//! - [`Mutator`] — authoritative create/edit/delete/reaction calls
//! - [`IdentityProvider`] — stable identity of the local caller
//!
//! Any transport satisfying these contracts is conformant; the bundled
//! [`crate::feed::WebSocketFeed`] is one `LiveFeed` implementation.

use agora_core::{Entity, Payload};
use std::future::Future;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What a feed notification says happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEventKind {
    Insert,
    Update,
    Delete,
}

/// One change notification from the live feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent<P> {
    pub kind: FeedEventKind,
    pub entity: Entity<P>,
    /// Correlation id echoed by transports that round-trip it; lets the
    /// engine bind a confirmation to its pending local mutation directly.
    pub correlation_id: Option<Uuid>,
}

impl<P: Payload> FeedEvent<P> {
    pub fn insert(entity: Entity<P>) -> Self {
        Self {
            kind: FeedEventKind::Insert,
            entity,
            correlation_id: None,
        }
    }

    pub fn update(entity: Entity<P>) -> Self {
        Self {
            kind: FeedEventKind::Update,
            entity,
            correlation_id: None,
        }
    }

    pub fn delete(entity: Entity<P>) -> Self {
        Self {
            kind: FeedEventKind::Delete,
            entity,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// An open live-feed subscription for one collection.
///
/// Events arrive on `events` until the feed ends (connection lost or
/// unsubscribed); the engine treats a closed channel as feed loss.
pub struct FeedSubscription<P> {
    pub subscription_id: Uuid,
    pub events: mpsc::Receiver<FeedEvent<P>>,
}

/// Pulls a bounded, cursor-ordered slice of a collection.
pub trait PageFetcher<P: Payload>: Send + Sync + 'static {
    /// Fetch up to `limit` entities older than `before` (exclusive), or the
    /// newest page when `before` is `None`. Returned order is irrelevant;
    /// the store sorts.
    fn fetch(
        &self,
        collection_id: Uuid,
        before: Option<u64>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Entity<P>>, SyncError>> + Send;
}

/// Delivers a stream of change notifications for a collection.
pub trait LiveFeed<P: Payload>: Send + Sync + 'static {
    /// Open a subscription. Resolves once the feed has acknowledged it.
    fn subscribe(
        &self,
        collection_id: Uuid,
    ) -> impl Future<Output = Result<FeedSubscription<P>, SyncError>> + Send;

    /// Tear down a subscription opened by [`LiveFeed::subscribe`].
    fn unsubscribe(&self, subscription_id: Uuid) -> impl Future<Output = ()> + Send;
}

/// Issues authoritative mutations; each call returns the confirmed entity.
pub trait Mutator<P: Payload>: Send + Sync + 'static {
    /// Create an entity. `correlation_id` is offered to the transport so
    /// the feed can echo it back on the matching insert event.
    fn create(
        &self,
        collection_id: Uuid,
        payload: P,
        correlation_id: Uuid,
    ) -> impl Future<Output = Result<Entity<P>, SyncError>> + Send;

    fn edit(
        &self,
        collection_id: Uuid,
        target: Uuid,
        payload: P,
    ) -> impl Future<Output = Result<Entity<P>, SyncError>> + Send;

    /// Delete an entity; the confirmation is the tombstoned entity.
    fn delete(
        &self,
        collection_id: Uuid,
        target: Uuid,
    ) -> impl Future<Output = Result<Entity<P>, SyncError>> + Send;

    fn toggle_reaction(
        &self,
        collection_id: Uuid,
        target: Uuid,
        reaction: String,
        add: bool,
    ) -> impl Future<Output = Result<Entity<P>, SyncError>> + Send;
}

/// Supplies the stable identity of the local caller.
pub trait IdentityProvider: Send + Sync + 'static {
    fn caller_id(&self) -> Uuid;
}

/// Engine error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Feed, page, or mutator call failed. Retryable.
    Transport(String),
    /// Mutation target no longer exists. Surfaced to the caller, not retried.
    Conflict(String),
    /// Event missing required fields. Dropped, counted, never merged.
    Malformed(String),
    /// Operation requires the session to be `Live`.
    NotLive,
    /// An older-page request is already outstanding; rejected, not queued.
    PageInFlight,
    /// The session handle refers to a closed or unknown session.
    Closed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Conflict(e) => write!(f, "conflict: {e}"),
            Self::Malformed(e) => write!(f, "malformed event: {e}"),
            Self::NotLive => write!(f, "session is not live"),
            Self::PageInFlight => write!(f, "an older-page request is already in flight"),
            Self::Closed => write!(f, "session is closed"),
        }
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_event_constructors() {
        let entity = Entity::new(Uuid::new_v4(), 1, 100, "m".to_string());

        let insert = FeedEvent::insert(entity.clone());
        assert_eq!(insert.kind, FeedEventKind::Insert);
        assert!(insert.correlation_id.is_none());

        let correlation = Uuid::new_v4();
        let update = FeedEvent::update(entity.clone()).with_correlation(correlation);
        assert_eq!(update.kind, FeedEventKind::Update);
        assert_eq!(update.correlation_id, Some(correlation));

        let delete = FeedEvent::delete(entity);
        assert_eq!(delete.kind, FeedEventKind::Delete);
    }

    #[test]
    fn test_sync_error_display() {
        let e = SyncError::Transport("connection refused".to_string());
        assert_eq!(e.to_string(), "transport error: connection refused");
        assert_eq!(SyncError::PageInFlight.to_string(), "an older-page request is already in flight");
        assert_eq!(SyncError::NotLive.to_string(), "session is not live");
    }
}
