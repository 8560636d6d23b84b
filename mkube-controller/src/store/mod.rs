//! State store for the controller.
//!
//! The store is the single source of truth the control loop reads from. It
//! keeps, per resource identity, the caller's desired spec, a generation
//! counter and the controller-owned observed status.
//!
//! # Architecture
//!
//! ```text
//! caller ──put_desired()──► Arc<dyn StateStore> ──WatchEvent──► watch() ──► Controller
//!                                 ▲                                              │
//!                                 └──────────────── put_observed() ◄─────────────┘
//! ```
//!
//! Writes to one identity are serialized by that identity's entry lock; writes
//! to different identities proceed in parallel.

#[cfg(test)]
pub(crate) mod closing;
mod event;
mod memory;
mod traits;

pub use event::{ChangeKind, WatchEvent};
pub use memory::InMemoryStore;
pub use traits::StateStore;
