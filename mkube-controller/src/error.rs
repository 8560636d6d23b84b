//! Controller error types.

use thiserror::Error;

use crate::types::ResourceId;

/// Errors surfaced by the store and the controller loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Identity unknown to the store.
    #[error("not found: {0}")]
    NotFound(ResourceId),

    /// Timeout or temporary backend unavailability; retried with backoff.
    #[error("executor transient: {0}")]
    ExecutorTransient(String),

    /// Backend rejected the request; not retried.
    #[error("executor permanent: {0}")]
    ExecutorPermanent(String),

    /// Desired spec changed while a pass was running.
    #[error("conflicting update on {id}: planned against generation {expected}, now {actual}")]
    ConflictingUpdate {
        id: ResourceId,
        expected: u64,
        actual: u64,
    },

    /// Desired spec rejected by validation.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Malformed resource identity.
    #[error("invalid resource id: {0:?}")]
    InvalidResourceId(String),
}

impl Error {
    /// Whether the controller should retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ExecutorTransient(_))
    }
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, Error>;
