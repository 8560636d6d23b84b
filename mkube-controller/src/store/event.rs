//! Change notifications emitted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ResourceId;

/// Kind of change applied to a resource's desired spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// First desired spec registered (or re-registered after a delete).
    Created,
    /// Desired spec replaced.
    Updated,
    /// Caller requested deletion.
    Deleted,
}

/// Event delivered on the watch feed.
///
/// Delivery is at-least-once: the same identity may be reported more than
/// once, e.g. in a snapshot and again as a live event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub id: ResourceId,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
    /// Store revision at the time the event was produced.
    pub revision: u64,
}

impl WatchEvent {
    pub fn new(id: ResourceId, kind: ChangeKind, revision: u64) -> Self {
        Self {
            id,
            kind,
            timestamp: Utc::now(),
            revision,
        }
    }
}
