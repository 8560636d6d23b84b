//! In-memory StateStore implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{DesiredSpec, ObservedStatus, ResourceId, ResourceRecord};

use super::event::{ChangeKind, WatchEvent};
use super::traits::StateStore;

/// Default capacity of the change-event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// In-memory store backed by a sharded concurrent map.
///
/// Each identity's record sits behind its own entry lock. Change events are
/// broadcast while that lock is held, so events for one identity are observed
/// in the order the mutations happened.
pub struct InMemoryStore {
    records: DashMap<ResourceId, ResourceRecord>,
    events: broadcast::Sender<WatchEvent>,
    revision: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a store whose event channel buffers `capacity` events per
    /// subscriber before lagging.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            records: DashMap::new(),
            events,
            revision: AtomicU64::new(0),
        }
    }

    /// Number of identities currently tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn emit(&self, id: &ResourceId, kind: ChangeKind) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(id = %id, ?kind, revision, "Store change");
        // No subscribers is fine; the controller may not be running yet.
        let _ = self.events.send(WatchEvent::new(id.clone(), kind, revision));
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, id: &ResourceId) -> Option<ResourceRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    async fn put_desired(&self, id: &ResourceId, spec: DesiredSpec) -> Result<u64> {
        spec.validate()?;

        let mut record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| ResourceRecord {
                desired: None,
                generation: 0,
                observed: None,
            });

        let kind = if record.desired.is_some() {
            ChangeKind::Updated
        } else {
            ChangeKind::Created
        };
        record.generation += 1;
        record.desired = Some(spec);
        let generation = record.generation;

        self.emit(id, kind);
        Ok(generation)
    }

    async fn delete_desired(&self, id: &ResourceId) -> bool {
        let Some(mut record) = self.records.get_mut(id) else {
            return false;
        };
        if record.desired.is_none() {
            return false;
        }

        record.desired = None;
        record.generation += 1;
        self.emit(id, ChangeKind::Deleted);
        true
    }

    async fn put_observed(&self, id: &ResourceId, status: ObservedStatus) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        record.observed = Some(status);
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> bool {
        self.records.remove(id).is_some()
    }

    async fn purge_tombstone(&self, id: &ResourceId, generation: u64) -> bool {
        self.records
            .remove_if(id, |_, r| r.desired.is_none() && r.generation == generation)
            .is_some()
    }

    async fn list(&self) -> Vec<(ResourceId, bool)> {
        let mut ids: Vec<(ResourceId, bool)> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().desired.is_some()))
            .collect();
        ids.sort();
        ids
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}
