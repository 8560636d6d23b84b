//! Test store whose event feed can be cut.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{DesiredSpec, ObservedStatus, ResourceId, ResourceRecord};

use super::event::WatchEvent;
use super::memory::InMemoryStore;
use super::traits::StateStore;

/// Wraps an [`InMemoryStore`] but hands subscribers a private channel that
/// carries no live events and closes on [`ClosingStore::close_feed`].
/// Only snapshots reach a watcher.
#[derive(Default)]
pub struct ClosingStore {
    inner: InMemoryStore,
    feed: Mutex<Option<broadcast::Sender<WatchEvent>>>,
    subscriptions: AtomicUsize,
}

impl ClosingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the sender of the latest subscription, ending its feed.
    pub fn close_feed(&self) {
        self.feed.lock().unwrap().take();
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for ClosingStore {
    async fn get(&self, id: &ResourceId) -> Option<ResourceRecord> {
        self.inner.get(id).await
    }

    async fn put_desired(&self, id: &ResourceId, spec: DesiredSpec) -> Result<u64> {
        self.inner.put_desired(id, spec).await
    }

    async fn delete_desired(&self, id: &ResourceId) -> bool {
        self.inner.delete_desired(id).await
    }

    async fn put_observed(&self, id: &ResourceId, status: ObservedStatus) -> Result<()> {
        self.inner.put_observed(id, status).await
    }

    async fn delete(&self, id: &ResourceId) -> bool {
        self.inner.delete(id).await
    }

    async fn purge_tombstone(&self, id: &ResourceId, generation: u64) -> bool {
        self.inner.purge_tombstone(id, generation).await
    }

    async fn list(&self) -> Vec<(ResourceId, bool)> {
        self.inner.list().await
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        let (tx, rx) = broadcast::channel(16);
        *self.feed.lock().unwrap() = Some(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        rx
    }

    fn revision(&self) -> u64 {
        self.inner.revision()
    }
}
