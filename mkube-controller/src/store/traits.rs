//! StateStore trait definition.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{DesiredSpec, ObservedStatus, ResourceId, ResourceRecord};

use super::event::WatchEvent;

/// Store trait for desired and observed resource state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get everything known about an identity, `None` if unknown.
    async fn get(&self, id: &ResourceId) -> Option<ResourceRecord>;

    /// Register or replace the desired spec. Returns the new generation.
    async fn put_desired(&self, id: &ResourceId, spec: DesiredSpec) -> Result<u64>;

    /// Request deletion by clearing the desired spec.
    ///
    /// Returns `false` when the identity is unknown or already marked for
    /// deletion; both count as converged.
    async fn delete_desired(&self, id: &ResourceId) -> bool;

    /// Record the observed status. Fails with `NotFound` for unknown ids.
    async fn put_observed(&self, id: &ResourceId, status: ObservedStatus) -> Result<()>;

    /// Drop desired and observed state together.
    async fn delete(&self, id: &ResourceId) -> bool;

    /// Drop the record only if it is still a deletion tombstone at `generation`.
    async fn purge_tombstone(&self, id: &ResourceId, generation: u64) -> bool;

    /// All known identities, with whether each still has a desired spec.
    async fn list(&self) -> Vec<(ResourceId, bool)>;

    /// Subscribe to live change events.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;

    /// Current store revision.
    fn revision(&self) -> u64;
}
