//! Reconciliation store — one authoritative ordered view per collection.
//!
//! Three sources write into the store: page fetches, live feed events, and
//! optimistic local mutations. Arrival order across sources is arbitrary;
//! correctness is keyed on `(id, version)`, never on arrival sequence.
//!
//! ```text
//! page fetch ──┐
//! live feed  ──┼──► ReconciliationStore ──► snapshot(): ordered view
//! optimistic ──┘         │
//!                        └── tombstones (bounded horizon) reject
//!                            late events for deleted ids
//! ```
//!
//! Internal shape: a `BTreeMap` keyed by `(ordering_key, id)` gives the
//! iteration order for free, and an id index makes every merge an O(log n)
//! upsert — repeated `snapshot()` calls during an event burst never re-sort.

use crate::sources::{FeedEvent, FeedEventKind};
use agora_core::{Entity, Payload, SortKey};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default retention for delete markers.
///
/// Long enough to outlive any realistic page-fetch/feed race, short enough
/// that the marker map stays bounded.
pub const DEFAULT_TOMBSTONE_HORIZON: Duration = Duration::from_secs(120);

/// Reconciliation counters, snapshotted via [`ReconciliationStore::stats`].
///
/// `duplicates_suppressed` is the expected idempotent discard, not an
/// error; `malformed_dropped` is the error-sink count for events that
/// could not be merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub pages_merged: u64,
    pub feed_applied: u64,
    pub optimistic_applied: u64,
    pub duplicates_suppressed: u64,
    pub malformed_dropped: u64,
    pub tombstone_rejections: u64,
    pub rollbacks: u64,
}

/// A retained delete marker.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    version: u64,
    at: Instant,
}

/// The canonical in-memory ordered set for one collection instance.
pub struct ReconciliationStore<P> {
    collection_id: Uuid,
    /// Ordered view, keyed by `(ordering_key, id)`.
    entities: BTreeMap<SortKey, Entity<P>>,
    /// Entity id → current sort position.
    by_id: HashMap<Uuid, SortKey>,
    /// Correlation id → entity id of the provisional write it produced.
    provisional: HashMap<Uuid, Uuid>,
    /// Deleted ids, retained for the horizon to reject late events.
    tombstones: HashMap<Uuid, Tombstone>,
    tombstone_horizon: Duration,
    /// Bumped on every visible change; cheap change detection for readers.
    revision: u64,
    stats: StoreStats,
}

impl<P: Payload> ReconciliationStore<P> {
    pub fn new(collection_id: Uuid) -> Self {
        Self::with_horizon(collection_id, DEFAULT_TOMBSTONE_HORIZON)
    }

    pub fn with_horizon(collection_id: Uuid, tombstone_horizon: Duration) -> Self {
        Self {
            collection_id,
            entities: BTreeMap::new(),
            by_id: HashMap::new(),
            provisional: HashMap::new(),
            tombstones: HashMap::new(),
            tombstone_horizon,
            revision: 0,
            stats: StoreStats::default(),
        }
    }

    /// Merge a fetched page.
    ///
    /// Entities not present are inserted; present ones are upgraded only if
    /// the incoming version is strictly newer. Ids with an active tombstone
    /// are never resurrected by a page, no matter how fresh the page looks.
    /// Returns the number of entities that changed the view.
    pub fn load_page(&mut self, entities: Vec<Entity<P>>, is_first_page: bool) -> usize {
        self.purge_expired_tombstones();
        log::debug!(
            "collection {}: merging {} page of {} entities",
            self.collection_id,
            if is_first_page { "first" } else { "older" },
            entities.len()
        );

        let mut changed = 0;
        for entity in entities {
            if !entity.is_well_formed() {
                self.stats.malformed_dropped += 1;
                log::warn!(
                    "collection {}: dropping malformed page entity (id={}, ordering_key={})",
                    self.collection_id,
                    entity.id,
                    entity.ordering_key
                );
                continue;
            }
            if self.tombstones.contains_key(&entity.id) {
                self.stats.tombstone_rejections += 1;
                continue;
            }
            if entity.deleted {
                // The page itself can carry tombstoned rows.
                self.record_tombstone(entity.id, entity.version);
                if self.remove_row(entity.id).is_some() {
                    changed += 1;
                }
                continue;
            }
            match self.by_id.get(&entity.id) {
                Some(key) => {
                    let current = &self.entities[key];
                    if entity.version > current.version {
                        self.upsert(entity);
                        changed += 1;
                    } else {
                        self.stats.duplicates_suppressed += 1;
                    }
                }
                None => {
                    self.upsert(entity);
                    changed += 1;
                }
            }
        }

        self.stats.pages_merged += 1;
        if changed > 0 {
            self.revision += 1;
        }
        changed
    }

    /// Apply one live feed event. Idempotent by `(id, version)`.
    ///
    /// Returns true when the visible view changed.
    pub fn apply_feed_event(&mut self, event: FeedEvent<P>) -> bool {
        self.purge_expired_tombstones();

        let entity = event.entity;
        if !entity.is_well_formed() {
            self.stats.malformed_dropped += 1;
            log::warn!(
                "collection {}: dropping malformed feed event (id={}, ordering_key={})",
                self.collection_id,
                entity.id,
                entity.ordering_key
            );
            return false;
        }

        if event.kind == FeedEventKind::Delete || entity.deleted {
            return self.apply_confirmed_delete(entity.id, entity.version);
        }

        if self.tombstones.contains_key(&entity.id) {
            self.stats.tombstone_rejections += 1;
            return false;
        }

        match self.by_id.get(&entity.id) {
            Some(key) => {
                let current = &self.entities[key];
                if entity.version <= current.version {
                    self.stats.duplicates_suppressed += 1;
                    return false;
                }
                // An id under a pending optimistic delete stays hidden until
                // that delete is confirmed or rolled back.
                let mut entity = entity;
                if current.deleted && current.provisional {
                    entity.deleted = true;
                    entity.provisional = true;
                }
                self.upsert(entity);
            }
            // An insert for an unknown id — or an update arriving before its
            // insert — both land as a plain insert.
            None => self.upsert(entity),
        }

        self.stats.feed_applied += 1;
        self.revision += 1;
        true
    }

    /// Insert or update a provisional entity for an unconfirmed local write.
    pub fn apply_optimistic(&mut self, entity: Entity<P>, correlation_id: Uuid) {
        self.provisional.insert(correlation_id, entity.id);
        self.upsert(entity);
        self.stats.optimistic_applied += 1;
        self.revision += 1;
    }

    /// Optimistically hide `target` pending a delete confirmation.
    ///
    /// Returns the prior entity for rollback, or `None` when the target is
    /// unknown or already hidden.
    pub fn apply_optimistic_delete(
        &mut self,
        target: Uuid,
        correlation_id: Uuid,
    ) -> Option<Entity<P>> {
        let key = *self.by_id.get(&target)?;
        let row = self.entities.get_mut(&key)?;
        if row.deleted {
            return None;
        }
        let prior = row.clone();
        row.deleted = true;
        row.provisional = true;
        self.provisional.insert(correlation_id, target);
        self.stats.optimistic_applied += 1;
        self.revision += 1;
        Some(prior)
    }

    /// Binding step: supersede the provisional write behind `correlation_id`
    /// with the confirmed entity, atomically from any reader's view.
    ///
    /// Returns true when the visible view changed.
    pub fn resolve_provisional(&mut self, correlation_id: Uuid, confirmed: Entity<P>) -> bool {
        self.purge_expired_tombstones();

        let mut changed = false;
        if let Some(provisional_id) = self.provisional.remove(&correlation_id) {
            // A provisional create lives under its correlation id; drop that
            // row before inserting the confirmed one.
            if provisional_id != confirmed.id && self.remove_row(provisional_id).is_some() {
                changed = true;
            }
        }

        if !confirmed.is_well_formed() {
            self.stats.malformed_dropped += 1;
            return changed;
        }

        if confirmed.deleted {
            return self.apply_confirmed_delete(confirmed.id, confirmed.version) || changed;
        }

        if self.tombstones.contains_key(&confirmed.id) {
            self.stats.tombstone_rejections += 1;
            return changed;
        }

        match self.by_id.get(&confirmed.id) {
            Some(key) => {
                let current = &self.entities[key];
                // A later feed update may already have moved past the
                // confirmation; never downgrade a confirmed version.
                if confirmed.version > current.version
                    || (current.provisional && confirmed.version >= current.version)
                {
                    self.upsert(confirmed);
                    changed = true;
                } else {
                    self.stats.duplicates_suppressed += 1;
                }
            }
            None => {
                self.upsert(confirmed);
                changed = true;
            }
        }

        if changed {
            self.revision += 1;
        }
        changed
    }

    /// Failure path for an optimistic create: drop the provisional row.
    pub fn remove_provisional(&mut self, correlation_id: Uuid) -> bool {
        let Some(provisional_id) = self.provisional.remove(&correlation_id) else {
            return false;
        };
        // Only a row still marked provisional may be dropped; a confirmed
        // row under the same id means the binding already happened.
        let is_provisional_row = self
            .by_id
            .get(&provisional_id)
            .is_some_and(|key| self.entities[key].provisional);
        let removed = is_provisional_row && self.remove_row(provisional_id).is_some();
        if removed {
            self.stats.rollbacks += 1;
            self.revision += 1;
        }
        removed
    }

    /// Failure path for an optimistic edit/delete/reaction: restore the
    /// pre-mutation entity.
    ///
    /// If the server has meanwhile confirmed a newer version, that newer
    /// state wins and the restore is a no-op.
    pub fn restore(&mut self, correlation_id: Uuid, prior: Entity<P>) -> bool {
        self.provisional.remove(&correlation_id);
        if self.tombstones.contains_key(&prior.id) {
            return false;
        }
        if let Some(key) = self.by_id.get(&prior.id) {
            let current = &self.entities[key];
            if current.version > prior.version && !current.provisional {
                return false;
            }
        }
        self.upsert(prior);
        self.stats.rollbacks += 1;
        self.revision += 1;
        true
    }

    /// The current visible view: non-tombstoned entities, sorted by
    /// `(ordering_key, id)` ascending. O(n).
    pub fn snapshot(&self) -> Vec<Entity<P>> {
        self.entities
            .values()
            .filter(|e| !e.deleted)
            .cloned()
            .collect()
    }

    /// Look up an entity by id, hidden rows included.
    pub fn get(&self, id: Uuid) -> Option<&Entity<P>> {
        self.by_id.get(&id).map(|key| &self.entities[key])
    }

    /// Ordering key of the oldest currently-loaded entity — the exclusive
    /// upper bound for an older-page request.
    pub fn oldest_ordering_key(&self) -> Option<u64> {
        self.entities.keys().next().map(|k| k.ordering_key)
    }

    /// Number of visible entities.
    pub fn visible_len(&self) -> usize {
        self.entities.values().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn collection_id(&self) -> Uuid {
        self.collection_id
    }

    /// Monotonic change counter; bumps on every visible change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.clone()
    }

    /// Number of active delete markers.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    fn apply_confirmed_delete(&mut self, id: Uuid, version: u64) -> bool {
        if let Some(existing) = self.tombstones.get(&id) {
            if version <= existing.version {
                self.stats.duplicates_suppressed += 1;
                return false;
            }
        }
        self.record_tombstone(id, version);
        if self.remove_row(id).is_some() {
            self.stats.feed_applied += 1;
            self.revision += 1;
            true
        } else {
            // Delete for an id never seen: the marker still matters — it
            // must reject the page that is about to deliver this entity.
            false
        }
    }

    fn record_tombstone(&mut self, id: Uuid, version: u64) {
        self.tombstones.insert(
            id,
            Tombstone {
                version,
                at: Instant::now(),
            },
        );
    }

    fn purge_expired_tombstones(&mut self) {
        let horizon = self.tombstone_horizon;
        self.tombstones.retain(|_, t| t.at.elapsed() < horizon);
    }

    fn upsert(&mut self, entity: Entity<P>) {
        let key = entity.sort_key();
        if let Some(old_key) = self.by_id.insert(entity.id, key) {
            if old_key != key {
                self.entities.remove(&old_key);
            }
        }
        self.entities.insert(key, entity);
    }

    fn remove_row(&mut self, id: Uuid) -> Option<Entity<P>> {
        let key = self.by_id.remove(&id)?;
        self.entities.remove(&key)
    }
}
