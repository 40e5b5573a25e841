//! # agora-sync — live collection synchronization engine
//!
//! Keeps one authoritative, ordered, de-duplicated view of a collection
//! (a channel's messages, a DM thread, a server roster, online members)
//! consistent across three asynchronous, out-of-order input sources:
//! the initial page load, the live push feed, and local optimistic writes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  open/close/submit   ┌─────────────────────┐
//! │  consumers   │ ◄──────────────────► │     SyncEngine      │
//! │ (UI surfaces)│   snapshot/changes   │  (per-collection    │
//! └──────────────┘                      │   sessions)         │
//!                                       └─────┬─────────┬─────┘
//!                             page fetch      │         │ live feed
//!                          ┌──────────────────┘         │
//!                          ▼                            ▼
//!                 ┌─────────────────┐        ┌─────────────────────┐
//!                 │ Reconciliation  │ ◄───── │  OptimisticQueue    │
//!                 │ Store (ordered, │ merge  │  (pending local     │
//!                 │ deduplicated)   │        │   intents)          │
//!                 └─────────────────┘        └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`sources`] — collaborator seams (page fetcher, live feed, mutator,
//!   identity) and the error taxonomy
//! - [`store`] — the reconciliation store and merge algorithm
//! - [`optimistic`] — the pending-mutation queue and binding rules
//! - [`session`] — reference-counted session lifecycle and the engine API
//! - [`protocol`] — binary wire frames for the live feed (bincode)
//! - [`feed`] — WebSocket live-feed adapter
//!
//! ## Guarantees
//!
//! | Property | How |
//! |----------|-----|
//! | No duplicate rows | merge keyed by entity id |
//! | At-most-once apply | events idempotent by `(id, version)` |
//! | Stable total order | `(ordering_key, id)` ascending, always |
//! | No lost updates | versions never downgrade, tombstones reject replays |
//! | Optimistic UX | provisional rows superseded atomically on confirm |

pub mod feed;
pub mod optimistic;
pub mod protocol;
pub mod session;
pub mod sources;
pub mod store;

// Re-exports for convenience
pub use feed::{ConnectionState, FeedConfig, WebSocketFeed};
pub use optimistic::{MutationKind, MutationStatus, OptimisticQueue, PendingMutation};
pub use protocol::{FeedFrame, FrameType, ProtocolError, WireEntity};
pub use session::{EngineConfig, SessionHandle, SessionState, SyncEngine, ViewChanged};
pub use sources::{
    FeedEvent, FeedEventKind, FeedSubscription, IdentityProvider, LiveFeed, Mutator, PageFetcher,
    SyncError,
};
pub use store::{ReconciliationStore, StoreStats, DEFAULT_TOMBSTONE_HORIZON};
