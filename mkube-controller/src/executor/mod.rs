//! Action executors.
//!
//! An executor is the backend that actually runs units. The controller only
//! talks to it through [`ActionExecutor`]; which backend is used is decided
//! when the controller is built.
//!
//! - [`SimulatedExecutor`]: in-memory units, with latency and fault injection
//! - [`ProcessExecutor`]: one local OS process per unit

mod process;
mod simulated;

pub use process::ProcessExecutor;
pub use simulated::{InjectedFault, SimulatedExecutor, SimulatedUnit};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Error;
use crate::types::{ResourceId, UnitId, UnitTemplate};

/// Errors reported by an executor backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// Temporary failure; the call may succeed if retried.
    #[error("transient: {0}")]
    Transient(String),

    /// The backend rejected the request.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The unit does not exist in the backend.
    #[error("unit not found: {0}")]
    UnitNotFound(UnitId),
}

impl From<ExecutorError> for Error {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Transient(msg) => Error::ExecutorTransient(msg),
            ExecutorError::Permanent(msg) => Error::ExecutorPermanent(msg),
            ExecutorError::UnitNotFound(unit) => {
                Error::ExecutorPermanent(format!("unit {} not found", unit))
            }
        }
    }
}

/// Trait for unit backends.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Start a unit from `template` on behalf of `owner`.
    async fn create(&self, owner: &ResourceId, template: &UnitTemplate)
    -> Result<UnitId, ExecutorError>;

    /// Stop and remove a unit.
    async fn delete(&self, owner: &ResourceId, unit: &UnitId) -> Result<(), ExecutorError>;

    /// Replace a unit's template, keeping its id.
    async fn update(
        &self,
        owner: &ResourceId,
        unit: &UnitId,
        template: &UnitTemplate,
    ) -> Result<(), ExecutorError>;
}
