//! Collection sessions — lifecycle, live feed pump, and mutation entry points.
//!
//! ```text
//! open(collection_id)                close(handle)
//!       │                                  ▲
//!       ▼                                  │ last handle
//! ┌──────────┐  page + sub ack  ┌──────┐   │
//! │ Opening  │ ───────────────► │ Live │ ──┴──► Closing → gone
//! └──────────┘                  └──────┘
//!       │        adapter error      │  feed lost
//!       └──────────► ┌──────────┐ ◄─┘
//!                    │ Degraded │ ── backoff resubscribe ──► Live
//!                    └──────────┘
//! ```
//!
//! One session per collection id, reference-counted by open handles. The
//! session owns the store, the optimistic queue, the feed subscription,
//! and a broadcast channel telling consumers when `snapshot()` has new
//! data or freshness changed.
//!
//! Lock discipline: the optimistic queue is always taken before the store,
//! and no lock is ever held across a collaborator await — results are
//! applied under a short write guard after the I/O resolves.

use crate::optimistic::{MutationKind, OptimisticQueue, PendingMutation};
use crate::sources::{FeedEvent, FeedEventKind, IdentityProvider, LiveFeed, Mutator, PageFetcher, SyncError};
use crate::store::{ReconciliationStore, DEFAULT_TOMBSTONE_HORIZON};
use agora_core::{Entity, Payload, Reactable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Entities per page request.
    pub page_size: usize,
    /// Buffered change notifications per consumer.
    pub change_capacity: usize,
    /// How long delete markers are retained.
    pub tombstone_horizon: Duration,
    /// First retry delay while degraded.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            change_capacity: 64,
            tombstone_horizon: DEFAULT_TOMBSTONE_HORIZON,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Lifecycle state of one collection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// First page and subscription are in flight.
    Opening,
    /// Page loaded and feed acknowledged; fully synchronized.
    Live,
    /// An adapter failed; serving the last-known view while retrying.
    Degraded,
    /// Tear-down in progress.
    Closing,
}

/// What a change notification tells a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChanged {
    /// `snapshot()` has new data.
    Data,
    /// Freshness lost; the view may be stale while the session retries.
    Degraded,
    /// Freshness restored.
    Live,
}

/// A consumer's claim on one collection session.
///
/// Not cloneable; every `open` hands out exactly one, and `close`
/// consumes it, which keeps the reference count honest.
#[derive(Debug)]
pub struct SessionHandle {
    collection_id: Uuid,
}

impl SessionHandle {
    pub fn collection_id(&self) -> Uuid {
        self.collection_id
    }
}

/// Exponential backoff for resubscription attempts.
struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    fn next(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Everything one collection owns while open.
struct CollectionSession<P> {
    collection_id: Uuid,
    store: RwLock<ReconciliationStore<P>>,
    queue: Mutex<OptimisticQueue<P>>,
    state: RwLock<SessionState>,
    changes: broadcast::Sender<ViewChanged>,
    /// Open handles; the session dies when this reaches zero.
    handles: AtomicUsize,
    /// Single-flight guard for older-page requests.
    older_in_flight: AtomicBool,
    /// Set at tear-down; in-flight results observing it are discarded.
    closed: AtomicBool,
    subscription_id: Mutex<Option<Uuid>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Payload> CollectionSession<P> {
    fn new(collection_id: Uuid, config: &EngineConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_capacity);
        Self {
            collection_id,
            store: RwLock::new(ReconciliationStore::with_horizon(
                collection_id,
                config.tombstone_horizon,
            )),
            queue: Mutex::new(OptimisticQueue::new()),
            state: RwLock::new(SessionState::Opening),
            changes,
            handles: AtomicUsize::new(0),
            older_in_flight: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            subscription_id: Mutex::new(None),
            runner: Mutex::new(None),
        }
    }

    fn notify(&self, change: ViewChanged) {
        // No receivers is fine; consumers subscribe when they care.
        let _ = self.changes.send(change);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    async fn current_state(&self) -> SessionState {
        *self.state.read().await
    }
}

/// The engine: one session per collection id, one backend for all of them.
///
/// `B` bundles the four collaborator seams; a real deployment implements
/// them over its transport, tests implement them in memory.
pub struct SyncEngine<P: Payload, B> {
    backend: Arc<B>,
    config: EngineConfig,
    sessions: Arc<RwLock<HashMap<Uuid, Arc<CollectionSession<P>>>>>,
}

impl<P, B> SyncEngine<P, B>
where
    P: Payload,
    B: PageFetcher<P> + LiveFeed<P> + Mutator<P> + IdentityProvider,
{
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: B, config: EngineConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register interest in a collection.
    ///
    /// The first open creates the session and starts the first-page fetch
    /// and the feed subscription concurrently; later opens share it.
    pub async fn open(&self, collection_id: Uuid) -> SessionHandle {
        let mut sessions = self.sessions.write().await;
        let session = match sessions.get(&collection_id) {
            Some(existing) => existing.clone(),
            None => {
                let session = Arc::new(CollectionSession::new(collection_id, &self.config));
                sessions.insert(collection_id, session.clone());
                let runner = tokio::spawn(Self::run_session(
                    self.backend.clone(),
                    session.clone(),
                    self.config.clone(),
                ));
                *session.runner.lock().await = Some(runner);
                log::info!("collection {collection_id}: session opened");
                session
            }
        };
        session.handles.fetch_add(1, Ordering::SeqCst);
        SessionHandle { collection_id }
    }

    /// Release a handle; the last one tears the session down.
    ///
    /// Store contents are discarded — a reopen always refetches.
    pub async fn close(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(&handle.collection_id).cloned() else {
            return;
        };
        if session.handles.fetch_sub(1, Ordering::SeqCst) > 1 {
            return;
        }
        sessions.remove(&handle.collection_id);
        drop(sessions);

        session.closed.store(true, Ordering::SeqCst);
        session.set_state(SessionState::Closing).await;
        if let Some(runner) = session.runner.lock().await.take() {
            runner.abort();
        }
        if let Some(subscription) = session.subscription_id.lock().await.take() {
            self.backend.unsubscribe(subscription).await;
        }
        log::info!("collection {}: session closed", handle.collection_id);
    }

    /// The current visible view, sorted by `(ordering_key, id)`.
    pub async fn snapshot(&self, handle: &SessionHandle) -> Result<Vec<Entity<P>>, SyncError> {
        let session = self.session(handle).await?;
        let store = session.store.read().await;
        Ok(store.snapshot())
    }

    /// Subscribe to change notifications for this session.
    pub async fn subscribe_changes(
        &self,
        handle: &SessionHandle,
    ) -> Result<broadcast::Receiver<ViewChanged>, SyncError> {
        let session = self.session(handle).await?;
        Ok(session.changes.subscribe())
    }

    pub async fn session_state(&self, handle: &SessionHandle) -> Result<SessionState, SyncError> {
        let session = self.session(handle).await?;
        Ok(session.current_state().await)
    }

    /// Reconciliation counters for this session's store.
    pub async fn store_stats(
        &self,
        handle: &SessionHandle,
    ) -> Result<crate::store::StoreStats, SyncError> {
        let session = self.session(handle).await?;
        let stats = session.store.read().await.stats();
        Ok(stats)
    }

    /// Number of local mutations still awaiting confirmation.
    pub async fn pending_mutations(&self, handle: &SessionHandle) -> Result<usize, SyncError> {
        let session = self.session(handle).await?;
        let len = session.queue.lock().await.len();
        Ok(len)
    }

    /// Number of local mutations that failed and were rolled back. The
    /// caller owns representing failures to the user.
    pub async fn failed_mutations(&self, handle: &SessionHandle) -> Result<u64, SyncError> {
        let session = self.session(handle).await?;
        let failed = session.queue.lock().await.failed_count();
        Ok(failed)
    }

    /// Fetch the page older than everything currently loaded.
    ///
    /// Only valid while `Live`; a second call while one is outstanding is
    /// rejected, not queued. Returns whether more older data may exist.
    pub async fn load_older_page(&self, handle: &SessionHandle) -> Result<bool, SyncError> {
        let session = self.session(handle).await?;
        if session.current_state().await != SessionState::Live {
            return Err(SyncError::NotLive);
        }
        if session
            .older_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::PageInFlight);
        }

        let before = session.store.read().await.oldest_ordering_key();
        let result = self
            .backend
            .fetch(session.collection_id, before, self.config.page_size)
            .await;
        session.older_in_flight.store(false, Ordering::SeqCst);

        if session.is_closed() {
            return Err(SyncError::Closed);
        }
        let page = result?;
        let has_more = page.len() == self.config.page_size;
        let changed = session.store.write().await.load_page(page, false) > 0;
        if changed {
            session.notify(ViewChanged::Data);
        }
        Ok(has_more)
    }

    /// Submit a create; the provisional entity is visible immediately.
    pub async fn submit_create(
        &self,
        handle: &SessionHandle,
        payload: P,
    ) -> Result<Uuid, SyncError> {
        let session = self.session(handle).await?;
        let correlation = Uuid::new_v4();
        let provisional = Entity::provisional(correlation, now_ms(), payload.clone());
        {
            let mut queue = session.queue.lock().await;
            let mut store = session.store.write().await;
            store.apply_optimistic(provisional.clone(), correlation);
            queue.track(PendingMutation::create(correlation, provisional));
        }
        session.notify(ViewChanged::Data);

        let backend = self.backend.clone();
        let collection = session.collection_id;
        let session = session.clone();
        tokio::spawn(async move {
            match backend.create(collection, payload, correlation).await {
                Ok(confirmed) => Self::apply_confirmation(&session, correlation, confirmed).await,
                Err(err) => Self::apply_mutation_failure(&session, correlation, err).await,
            }
        });
        Ok(correlation)
    }

    /// Submit an edit of `target`'s payload.
    pub async fn submit_edit(
        &self,
        handle: &SessionHandle,
        target: Uuid,
        payload: P,
    ) -> Result<Uuid, SyncError> {
        let session = self.session(handle).await?;
        let correlation = Uuid::new_v4();
        {
            let mut queue = session.queue.lock().await;
            let mut store = session.store.write().await;
            let Some(current) = store.get(target).filter(|e| !e.deleted).cloned() else {
                return Err(SyncError::Conflict(format!("edit target {target} not found")));
            };
            let mut provisional = current.clone();
            provisional.payload = payload.clone();
            provisional.provisional = true;
            store.apply_optimistic(provisional.clone(), correlation);
            queue.track(PendingMutation::edit(correlation, target, current, provisional));
        }
        session.notify(ViewChanged::Data);

        let backend = self.backend.clone();
        let collection = session.collection_id;
        let session = session.clone();
        tokio::spawn(async move {
            match backend.edit(collection, target, payload).await {
                Ok(confirmed) => Self::apply_confirmation(&session, correlation, confirmed).await,
                Err(err) => Self::apply_mutation_failure(&session, correlation, err).await,
            }
        });
        Ok(correlation)
    }

    /// Submit a delete; the entity disappears from snapshots immediately.
    pub async fn submit_delete(
        &self,
        handle: &SessionHandle,
        target: Uuid,
    ) -> Result<Uuid, SyncError> {
        let session = self.session(handle).await?;
        let correlation = Uuid::new_v4();
        {
            let mut queue = session.queue.lock().await;
            let mut store = session.store.write().await;
            let Some(prior) = store.apply_optimistic_delete(target, correlation) else {
                return Err(SyncError::Conflict(format!(
                    "delete target {target} not found"
                )));
            };
            queue.track(PendingMutation::delete(correlation, target, prior));
        }
        session.notify(ViewChanged::Data);

        let backend = self.backend.clone();
        let collection = session.collection_id;
        let session = session.clone();
        tokio::spawn(async move {
            match backend.delete(collection, target).await {
                Ok(mut confirmed) => {
                    // The confirmation of a delete is the tombstoned entity.
                    confirmed.deleted = true;
                    Self::apply_confirmation(&session, correlation, confirmed).await;
                }
                Err(err) => Self::apply_mutation_failure(&session, correlation, err).await,
            }
        });
        Ok(correlation)
    }

    /// Toggle the caller's reaction on `target`.
    pub async fn submit_reaction_toggle(
        &self,
        handle: &SessionHandle,
        target: Uuid,
        reaction: impl Into<String>,
        add: bool,
    ) -> Result<Uuid, SyncError>
    where
        P: Reactable,
    {
        let session = self.session(handle).await?;
        let correlation = Uuid::new_v4();
        let reaction = reaction.into();
        let caller = self.backend.caller_id();
        {
            let mut queue = session.queue.lock().await;
            let mut store = session.store.write().await;
            let Some(current) = store.get(target).filter(|e| !e.deleted).cloned() else {
                return Err(SyncError::Conflict(format!(
                    "reaction target {target} not found"
                )));
            };
            let mut provisional = current.clone();
            provisional.payload.toggle_reaction(&reaction, caller, add);
            provisional.provisional = true;
            store.apply_optimistic(provisional.clone(), correlation);
            queue.track(PendingMutation::reaction(
                correlation,
                target,
                current,
                provisional,
                add,
            ));
        }
        session.notify(ViewChanged::Data);

        let backend = self.backend.clone();
        let collection = session.collection_id;
        let session = session.clone();
        tokio::spawn(async move {
            match backend.toggle_reaction(collection, target, reaction, add).await {
                Ok(confirmed) => Self::apply_confirmation(&session, correlation, confirmed).await,
                Err(err) => Self::apply_mutation_failure(&session, correlation, err).await,
            }
        });
        Ok(correlation)
    }

    async fn session(&self, handle: &SessionHandle) -> Result<Arc<CollectionSession<P>>, SyncError> {
        self.sessions
            .read()
            .await
            .get(&handle.collection_id)
            .cloned()
            .ok_or(SyncError::Closed)
    }

    /// Drives one session: open, pump the feed, degrade and retry on loss.
    async fn run_session(
        backend: Arc<B>,
        session: Arc<CollectionSession<P>>,
        config: EngineConfig,
    ) {
        let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);
        loop {
            if session.is_closed() {
                return;
            }
            // Subscription ack and first page may land in either order; the
            // merge is arrival-order independent, so fire both at once.
            let (page, subscription) = tokio::join!(
                backend.fetch(session.collection_id, None, config.page_size),
                backend.subscribe(session.collection_id),
            );
            match (page, subscription) {
                (Ok(page), Ok(mut subscription)) => {
                    if session.is_closed() {
                        backend.unsubscribe(subscription.subscription_id).await;
                        return;
                    }
                    *session.subscription_id.lock().await = Some(subscription.subscription_id);
                    let changed = session.store.write().await.load_page(page, true) > 0;
                    session.set_state(SessionState::Live).await;
                    backoff.reset();
                    session.notify(ViewChanged::Live);
                    if changed {
                        session.notify(ViewChanged::Data);
                    }
                    log::info!("collection {}: live", session.collection_id);

                    while let Some(event) = subscription.events.recv().await {
                        Self::process_feed_event(&session, event).await;
                    }

                    session.subscription_id.lock().await.take();
                    if session.is_closed() {
                        return;
                    }
                    log::warn!("collection {}: live feed lost", session.collection_id);
                }
                (page, subscription) => {
                    if let Err(err) = &page {
                        log::warn!(
                            "collection {}: first page failed: {err}",
                            session.collection_id
                        );
                    }
                    match subscription {
                        // Half-open: drop the feed, retry both together.
                        Ok(subscription) => {
                            backend.unsubscribe(subscription.subscription_id).await
                        }
                        Err(err) => log::warn!(
                            "collection {}: subscribe failed: {err}",
                            session.collection_id
                        ),
                    }
                    if session.is_closed() {
                        return;
                    }
                }
            }
            session.set_state(SessionState::Degraded).await;
            session.notify(ViewChanged::Degraded);
            tokio::time::sleep(backoff.next()).await;
        }
    }

    /// Apply one feed event: bind it to a pending mutation if it confirms
    /// one, merge it, and keep any later optimistic overlay visible.
    async fn process_feed_event(session: &Arc<CollectionSession<P>>, event: FeedEvent<P>) {
        let target = event.entity.id;
        let mut queue = session.queue.lock().await;
        let resolved = queue.match_feed_event(&event);
        let mut store = session.store.write().await;

        let changed = match resolved {
            Some(pending) => {
                let mut confirmed = event.entity;
                if event.kind == FeedEventKind::Delete {
                    confirmed.deleted = true;
                }
                store.resolve_provisional(pending.correlation_id, confirmed)
            }
            None => store.apply_feed_event(event),
        };

        if changed {
            Self::reapply_overlay(&mut queue, &mut store, target);
        }
        drop(store);
        drop(queue);
        if changed {
            session.notify(ViewChanged::Data);
        }
    }

    /// Call-response path of the binding rule: the mutator confirmed first.
    async fn apply_confirmation(
        session: &Arc<CollectionSession<P>>,
        correlation: Uuid,
        confirmed: Entity<P>,
    ) {
        if session.is_closed() {
            return;
        }
        let target = confirmed.id;
        let mut queue = session.queue.lock().await;
        // The feed echo may have bound this mutation already; then the
        // response is a plain duplicate and the store suppresses it.
        let still_pending = queue.resolve(correlation).is_some();
        let mut store = session.store.write().await;
        let changed = if still_pending {
            store.resolve_provisional(correlation, confirmed)
        } else {
            false
        };
        if changed {
            Self::reapply_overlay(&mut queue, &mut store, target);
        }
        drop(store);
        drop(queue);
        if changed {
            session.notify(ViewChanged::Data);
        }
    }

    /// Failure path: roll the optimistic effect back and flag the mutation.
    async fn apply_mutation_failure(
        session: &Arc<CollectionSession<P>>,
        correlation: Uuid,
        err: SyncError,
    ) {
        if session.is_closed() {
            return;
        }
        log::warn!(
            "collection {}: mutation {correlation} failed: {err}",
            session.collection_id
        );
        let mut queue = session.queue.lock().await;
        let Some(failed) = queue.mark_failed(correlation) else {
            return;
        };
        let mut store = session.store.write().await;
        let changed = match failed.kind {
            MutationKind::Create => store.remove_provisional(correlation),
            _ => match failed.prior {
                Some(prior) => store.restore(correlation, prior),
                None => false,
            },
        };
        drop(store);
        drop(queue);
        if changed {
            session.notify(ViewChanged::Data);
        }
    }

    /// After a confirmed write lands on `target`, re-apply the newest
    /// still-pending optimistic overlay so a later local edit stays
    /// visible, and repoint rollback state at the confirmed entity.
    fn reapply_overlay(
        queue: &mut OptimisticQueue<P>,
        store: &mut ReconciliationStore<P>,
        target: Uuid,
    ) {
        let Some(confirmed) = store.get(target).cloned() else {
            return;
        };
        queue.refresh_prior(target, &confirmed);
        if let Some((correlation, mut overlay)) = queue.latest_provisional_entity(target) {
            overlay.version = confirmed.version;
            overlay.provisional = true;
            store.apply_optimistic(overlay, correlation);
        }
    }
}

/// Wall-clock milliseconds for provisional ordering keys.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
}
