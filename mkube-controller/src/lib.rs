//! mkube-controller: a declarative reconciliation engine.
//!
//! Callers declare a desired replica set for a resource; the controller
//! watches the store, plans convergence actions and applies them through an
//! [`ActionExecutor`] backend.
//!
//! ```text
//! StateStore ──watch()──► Controller ──plan()──► ReconcileAction* ──► ActionExecutor
//!      ▲                      │
//!      └──── put_observed ────┘
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod reconciler;
pub mod store;
pub mod types;
pub mod watch;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerStats};
pub use error::{Error, Result};
pub use executor::{ActionExecutor, ExecutorError, InjectedFault, ProcessExecutor, SimulatedExecutor};
pub use store::{ChangeKind, InMemoryStore, StateStore, WatchEvent};
pub use types::{
    DesiredSpec, ObservedStatus, Phase, ReconcileAction, ResourceId, ResourceStatus,
    RolloutStrategy, Unit, UnitId, UnitTemplate,
};
