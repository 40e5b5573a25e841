//! Optimistic mutation queue — local intents awaiting confirmation.
//!
//! Every local write (send/edit/delete/react) is recorded here under a
//! client-generated correlation id before the round trip completes. A
//! pending mutation resolves on the **first** confirmation observed for
//! it — the mutator call response, or a feed event that either echoes the
//! correlation id or targets the same entity — and rolls back when the
//! call itself fails.
//!
//! Ties between pending mutations on one target resolve in submission
//! order; a later pending edit is never clobbered by an earlier
//! mutation's confirmation (the session re-applies the later overlay
//! after each confirmed write).

use crate::sources::{FeedEvent, FeedEventKind};
use agora_core::{Entity, Payload};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use uuid::Uuid;

/// What the local intent was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Edit,
    Delete,
    ReactionAdd,
    ReactionRemove,
}

/// Lifecycle state of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    InFlight,
    Failed,
}

/// A local, not-yet-confirmed intent.
#[derive(Debug, Clone)]
pub struct PendingMutation<P> {
    pub correlation_id: Uuid,
    pub kind: MutationKind,
    /// Entity the mutation targets; `None` for creates (no server id yet).
    pub target: Option<Uuid>,
    pub submitted_at: Instant,
    /// Pre-mutation entity, for rollback. `None` for creates.
    pub prior: Option<Entity<P>>,
    /// The provisional entity as applied to the store, for re-overlay.
    /// `None` for deletes (their optimistic effect is a hidden row).
    pub provisional: Option<Entity<P>>,
    pub status: MutationStatus,
}

impl<P: Payload> PendingMutation<P> {
    pub fn create(correlation_id: Uuid, provisional: Entity<P>) -> Self {
        Self {
            correlation_id,
            kind: MutationKind::Create,
            target: None,
            submitted_at: Instant::now(),
            prior: None,
            provisional: Some(provisional),
            status: MutationStatus::InFlight,
        }
    }

    pub fn edit(correlation_id: Uuid, target: Uuid, prior: Entity<P>, provisional: Entity<P>) -> Self {
        Self {
            correlation_id,
            kind: MutationKind::Edit,
            target: Some(target),
            submitted_at: Instant::now(),
            prior: Some(prior),
            provisional: Some(provisional),
            status: MutationStatus::InFlight,
        }
    }

    pub fn delete(correlation_id: Uuid, target: Uuid, prior: Entity<P>) -> Self {
        Self {
            correlation_id,
            kind: MutationKind::Delete,
            target: Some(target),
            submitted_at: Instant::now(),
            prior: Some(prior),
            provisional: None,
            status: MutationStatus::InFlight,
        }
    }

    pub fn reaction(
        correlation_id: Uuid,
        target: Uuid,
        prior: Entity<P>,
        provisional: Entity<P>,
        add: bool,
    ) -> Self {
        Self {
            correlation_id,
            kind: if add {
                MutationKind::ReactionAdd
            } else {
                MutationKind::ReactionRemove
            },
            target: Some(target),
            submitted_at: Instant::now(),
            prior: Some(prior),
            provisional: Some(provisional),
            status: MutationStatus::InFlight,
        }
    }

    /// Whether a feed event of `kind` can confirm this mutation.
    ///
    /// A pending delete is confirmed only by a delete; an edit or reaction
    /// is confirmed by any authoritative write to its target. Creates bind
    /// by correlation echo only — their provisional id never matches a
    /// server id.
    fn resolves_on(&self, kind: FeedEventKind) -> bool {
        match self.kind {
            MutationKind::Create => false,
            MutationKind::Delete => kind == FeedEventKind::Delete,
            MutationKind::Edit | MutationKind::ReactionAdd | MutationKind::ReactionRemove => {
                matches!(
                    kind,
                    FeedEventKind::Insert | FeedEventKind::Update | FeedEventKind::Delete
                )
            }
        }
    }
}

/// The pending set, with FIFO resolution for same-target ties.
pub struct OptimisticQueue<P> {
    pending: HashMap<Uuid, PendingMutation<P>>,
    /// Correlation ids in submission order.
    order: VecDeque<Uuid>,
    resolved_count: u64,
    failed_count: u64,
}

impl<P: Payload> OptimisticQueue<P> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            resolved_count: 0,
            failed_count: 0,
        }
    }

    /// Record a newly submitted mutation.
    pub fn track(&mut self, mutation: PendingMutation<P>) {
        self.order.push_back(mutation.correlation_id);
        self.pending.insert(mutation.correlation_id, mutation);
    }

    /// Find and remove the pending mutation this feed event confirms.
    ///
    /// A correlation echo binds directly; otherwise the oldest pending
    /// mutation targeting the event's entity wins.
    pub fn match_feed_event(&mut self, event: &FeedEvent<P>) -> Option<PendingMutation<P>> {
        if let Some(correlation) = event.correlation_id {
            if self.pending.contains_key(&correlation) {
                return self.resolve(correlation);
            }
        }
        let target = event.entity.id;
        let correlation = self.order.iter().copied().find(|c| {
            self.pending
                .get(c)
                .is_some_and(|m| m.target == Some(target) && m.resolves_on(event.kind))
        })?;
        self.resolve(correlation)
    }

    /// Resolve a pending mutation (confirmed); removes and returns it.
    pub fn resolve(&mut self, correlation_id: Uuid) -> Option<PendingMutation<P>> {
        let mutation = self.take(correlation_id)?;
        self.resolved_count += 1;
        Some(mutation)
    }

    /// Flag a pending mutation failed and remove it, returning it so the
    /// caller can roll back its provisional effect.
    pub fn mark_failed(&mut self, correlation_id: Uuid) -> Option<PendingMutation<P>> {
        let mut mutation = self.take(correlation_id)?;
        mutation.status = MutationStatus::Failed;
        self.failed_count += 1;
        Some(mutation)
    }

    /// The most recently submitted provisional overlay for `target`, if
    /// any pending mutation still carries one.
    pub fn latest_provisional_entity(&self, target: Uuid) -> Option<(Uuid, Entity<P>)> {
        self.order.iter().rev().find_map(|c| {
            let m = self.pending.get(c)?;
            if m.target == Some(target) {
                m.provisional.clone().map(|e| (m.correlation_id, e))
            } else {
                None
            }
        })
    }

    /// Point every pending mutation on `target` at the newest confirmed
    /// entity, so a later rollback restores current server state.
    pub fn refresh_prior(&mut self, target: Uuid, confirmed: &Entity<P>) {
        for mutation in self.pending.values_mut() {
            if mutation.target == Some(target) && mutation.prior.is_some() {
                mutation.prior = Some(confirmed.clone());
            }
        }
    }

    pub fn has(&self, correlation_id: Uuid) -> bool {
        self.pending.contains_key(&correlation_id)
    }

    /// Number of pending mutations targeting `target`.
    pub fn pending_for(&self, target: Uuid) -> usize {
        self.pending
            .values()
            .filter(|m| m.target == Some(target))
            .count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn resolved_count(&self) -> u64 {
        self.resolved_count
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_count
    }

    fn take(&mut self, correlation_id: Uuid) -> Option<PendingMutation<P>> {
        let mutation = self.pending.remove(&correlation_id)?;
        self.order.retain(|c| *c != correlation_id);
        Some(mutation)
    }
}

impl<P: Payload> Default for OptimisticQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}
