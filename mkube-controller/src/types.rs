//! Resource model shared by the store, the reconciler and the controller.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Namespace used when a resource id is given without one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identifier assigned to a unit by the executor backend.
pub type UnitId = String;

// =============================================================================
// Identity
// =============================================================================

/// Identity of a managed resource, unique within its namespace.
///
/// Serialized as `namespace/name`; deserialization goes through the same
/// validation as parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    /// Build an id from its parts. Fails on empty parts or embedded `/`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();

        for part in [&namespace, &name] {
            if part.is_empty() || part.contains('/') {
                return Err(Error::InvalidResourceId(format!("{}/{}", namespace, name)));
            }
        }

        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new(DEFAULT_NAMESPACE, s),
        }
    }
}

impl TryFrom<String> for ResourceId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

// =============================================================================
// Desired state
// =============================================================================

/// Template every unit of a resource is started from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitTemplate {
    /// Image reference (or program path for process backends)
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl UnitTemplate {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

/// How stale units are brought to a new template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Update existing units one at a time, keeping their ids
    #[default]
    InPlace,
    /// Create a replacement, then delete the stale unit (needs `max_surge >= 1`)
    Replace,
}

/// DesiredSpec - target configuration declared by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSpec {
    pub replicas: u32,
    pub template: UnitTemplate,
    /// Units allowed above `replicas` during a rolling update
    #[serde(default = "default_max_surge")]
    pub max_surge: u32,
    /// Units allowed below `replicas` during a rolling update
    #[serde(default)]
    pub max_unavailable: u32,
    #[serde(default)]
    pub strategy: RolloutStrategy,
}

fn default_max_surge() -> u32 {
    1
}

impl DesiredSpec {
    /// Spec with default rolling-update bounds (surge 1, unavailable 0).
    pub fn new(replicas: u32, template: UnitTemplate) -> Self {
        Self {
            replicas,
            template,
            max_surge: default_max_surge(),
            max_unavailable: 0,
            strategy: RolloutStrategy::InPlace,
        }
    }

    pub fn with_rollout(mut self, max_surge: u32, max_unavailable: u32) -> Self {
        self.max_surge = max_surge;
        self.max_unavailable = max_unavailable;
        self
    }

    pub fn with_strategy(mut self, strategy: RolloutStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Reject specs the controller could never converge.
    pub fn validate(&self) -> Result<()> {
        if self.template.image.trim().is_empty() {
            return Err(Error::InvalidSpec("template image must not be empty".into()));
        }
        if self.strategy == RolloutStrategy::Replace && self.max_surge == 0 {
            return Err(Error::InvalidSpec(
                "replace rollout needs max_surge of at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Observed state
// =============================================================================

/// A unit known to exist in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub template: UnitTemplate,
    pub created_at: DateTime<Utc>,
}

/// Resource lifecycle phase as seen by the controller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Phase {
    /// Actions are being applied
    #[default]
    Progressing,
    /// Observed state matches the desired spec
    Ready,
    /// Create/Update gave up; waits for the next event
    Degraded,
    /// Desired spec was deleted, units are being torn down
    Terminating,
}

/// ObservedStatus - last-known real state, written only by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedStatus {
    /// Units in creation order, oldest first
    pub units: Vec<Unit>,
    pub phase: Phase,
    pub last_error: Option<String>,
    /// Generation of the desired spec last acted upon
    pub observed_generation: u64,
    pub updated_at: DateTime<Utc>,
}

impl ObservedStatus {
    pub fn empty(observed_generation: u64) -> Self {
        Self {
            units: Vec::new(),
            phase: Phase::Progressing,
            last_error: None,
            observed_generation,
            updated_at: Utc::now(),
        }
    }

    pub fn count(&self) -> usize {
        self.units.len()
    }

    /// Whether this status already satisfies `spec`.
    pub fn satisfies(&self, spec: &DesiredSpec) -> bool {
        self.units.len() == spec.replicas as usize
            && self.units.iter().all(|u| u.template == spec.template)
    }
}

// =============================================================================
// Actions
// =============================================================================

/// Convergence step produced by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileAction {
    Create { template: UnitTemplate },
    Delete { unit_id: UnitId },
    Update { unit_id: UnitId, template: UnitTemplate },
}

impl ReconcileAction {
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileAction::Create { .. } => "create",
            ReconcileAction::Delete { .. } => "delete",
            ReconcileAction::Update { .. } => "update",
        }
    }
}

// =============================================================================
// Query results
// =============================================================================

/// Everything the store knows about one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub desired: Option<DesiredSpec>,
    /// Bumped on every desired-spec write, including deletion requests
    pub generation: u64,
    pub observed: Option<ObservedStatus>,
}

/// Per-identity status surfaced to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub id: ResourceId,
    pub phase: Phase,
    pub desired_replicas: Option<u32>,
    /// Units running the desired template
    pub ready_replicas: usize,
    /// All units the controller knows about, stale ones included
    pub observed_replicas: usize,
    pub generation: u64,
    pub observed_generation: u64,
    pub last_error: Option<String>,
    pub reconciling: bool,
}
