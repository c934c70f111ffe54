//! Per-unit-of-work change tracker.
//!
//! Owns every aggregate staged through a repository, in staging order, keyed by
//! `(aggregate type, id)`. Aggregates of different types live side by side behind
//! the object-safe [`TrackedAggregate`] trait.

use std::any::Any;
use std::collections::HashMap;

use bizhub_core::{EntityId, ExpectedVersion, TransactionId, VersionToken};
use bizhub_events::{EventEnvelope, JsonEnvelope};

use crate::store::{Persistable, RowWrite, StoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TrackingKey {
    pub kind: &'static str,
    pub id: EntityId,
}

/// Type-erased view of one tracked aggregate.
pub(crate) trait TrackedAggregate: Send + Sync {
    fn key(&self) -> TrackingKey;

    /// Staged since the last successful flush.
    fn is_dirty(&self) -> bool;

    fn row_write(&self) -> Result<RowWrite, StoreError>;

    /// The store accepted the row at `version`.
    fn mark_flushed(&mut self, version: VersionToken);

    /// Forget flushes that belonged to a transaction which did not commit.
    fn reset_flush(&mut self);

    /// The row is durable: adopt the flushed token as the loaded one.
    fn confirm(&mut self);

    fn pending_event_count(&self) -> usize;

    /// Envelopes for every pending event, numbered from `first_sequence`.
    fn envelopes(
        &self,
        transaction_id: TransactionId,
        first_sequence: u32,
    ) -> Result<Vec<JsonEnvelope>, StoreError>;

    fn clear_events(&mut self) -> usize;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct Tracked<T> {
    entity: T,
    /// Token the entity carried when first staged; `UNSAVED` for creations.
    base: VersionToken,
    /// Token assigned by the latest flush in the current store transaction.
    flushed: Option<VersionToken>,
    dirty: bool,
}

impl<T: Persistable> Tracked<T> {
    fn new(entity: T, base: VersionToken) -> Self {
        Self {
            entity,
            base,
            flushed: None,
            dirty: true,
        }
    }

    fn current_token(&self) -> VersionToken {
        self.flushed.unwrap_or(self.base)
    }
}

impl<T: Persistable> TrackedAggregate for Tracked<T> {
    fn key(&self) -> TrackingKey {
        TrackingKey {
            kind: T::AGGREGATE_TYPE,
            id: self.entity.id(),
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn row_write(&self) -> Result<RowWrite, StoreError> {
        Ok(RowWrite {
            kind: T::AGGREGATE_TYPE,
            id: self.entity.id(),
            expected: ExpectedVersion::for_token(self.current_token()),
            deleted: self.entity.is_deleted(),
            document: serde_json::to_value(&self.entity)?,
        })
    }

    fn mark_flushed(&mut self, version: VersionToken) {
        self.flushed = Some(version);
        self.dirty = false;
    }

    fn reset_flush(&mut self) {
        if self.flushed.take().is_some() {
            self.dirty = true;
        }
    }

    fn confirm(&mut self) {
        if let Some(version) = self.flushed.take() {
            self.base = version;
            self.entity.metadata_mut().assign_version(version);
        }
    }

    fn pending_event_count(&self) -> usize {
        self.entity.events().len()
    }

    fn envelopes(
        &self,
        transaction_id: TransactionId,
        first_sequence: u32,
    ) -> Result<Vec<JsonEnvelope>, StoreError> {
        let mut envelopes = Vec::with_capacity(self.entity.events().len());
        for (sequence, event) in (first_sequence..).zip(self.entity.events()) {
            let envelope = EventEnvelope::wrap(
                transaction_id,
                sequence,
                self.entity.id(),
                T::AGGREGATE_TYPE,
                event.clone(),
            );
            envelopes.push(envelope.to_json()?);
        }
        Ok(envelopes)
    }

    fn clear_events(&mut self) -> usize {
        self.entity.clear_events().len()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Aggregates staged by the repositories of one unit of work.
#[derive(Default)]
pub(crate) struct ChangeTracker {
    entries: Vec<Box<dyn TrackedAggregate>>,
    index: HashMap<TrackingKey, usize>,
}

impl ChangeTracker {
    /// Stage `entity` for writing, expecting the stored row at `base`.
    ///
    /// Re-staging a tracked aggregate keeps its position, its flush state and its
    /// original base token. Its still-pending events are moved in front of the new
    /// copy's events, except those the new copy already carries because it was
    /// cloned from the staged one.
    pub fn stage<T: Persistable>(&mut self, mut entity: T, base: VersionToken) {
        let key = TrackingKey {
            kind: T::AGGREGATE_TYPE,
            id: entity.id(),
        };

        if let Some(&position) = self.index.get(&key) {
            // Keys embed the aggregate type, so the downcast only fails on a
            // type reusing another's AGGREGATE_TYPE; that entry is replaced.
            if let Some(existing) = self.entries[position].as_any_mut().downcast_mut::<Tracked<T>>() {
                let earlier = existing.entity.clear_events();
                entity.event_queue_mut().prepend(earlier);
                existing.entity = entity;
                existing.dirty = true;
                return;
            }
            self.entries[position] = Box::new(Tracked::new(entity, base));
            return;
        }

        self.index.insert(key, self.entries.len());
        self.entries.push(Box::new(Tracked::new(entity, base)));
    }

    pub fn is_tracked(&self, kind: &'static str, id: EntityId) -> bool {
        self.index.contains_key(&TrackingKey { kind, id })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_dirty()).count()
    }

    pub fn pending_event_count(&self) -> usize {
        self.entries.iter().map(|e| e.pending_event_count()).sum()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn TrackedAggregate>> {
        self.entries.iter_mut()
    }

    /// Every pending event of every tracked aggregate: aggregates in staging order,
    /// then each aggregate's events in the order they were raised.
    pub fn collect_events(&self, transaction_id: TransactionId) -> Result<Vec<JsonEnvelope>, StoreError> {
        let mut collected = Vec::with_capacity(self.pending_event_count());
        for entry in &self.entries {
            let envelopes = entry.envelopes(transaction_id, collected.len() as u32)?;
            collected.extend(envelopes);
        }
        Ok(collected)
    }

    pub fn reset_flushes(&mut self) {
        for entry in &mut self.entries {
            entry.reset_flush();
        }
    }

    /// After a durable commit: adopt flushed tokens and empty every event queue.
    pub fn confirm_commit(&mut self) -> usize {
        let mut cleared = 0;
        for entry in &mut self.entries {
            entry.confirm();
            cleared += entry.clear_events();
        }
        cleared
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

impl core::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let keys: Vec<_> = self.entries.iter().map(|e| e.key()).collect();
        f.debug_struct("ChangeTracker").field("entries", &keys).finish()
    }
}
