//! Process executor - runs each unit as a local child process.
//!
//! The template image is the program to execute, with `args` and `env`
//! passed through. Children are killed when dropped, so stopping the
//! controller does not leak units.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ActionExecutor, ExecutorError};
use crate::types::{ResourceId, UnitId, UnitTemplate};

/// How long a fresh process must stay up to count as started.
const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(100);

struct ProcessUnit {
    owner: ResourceId,
    child: Child,
}

/// Backend that maps units to OS processes.
pub struct ProcessExecutor {
    processes: Mutex<HashMap<UnitId, ProcessUnit>>,
    startup_grace: Duration,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// PIDs of the running units owned by `owner`.
    pub async fn pids_of(&self, owner: &ResourceId) -> Vec<u32> {
        self.processes
            .lock()
            .await
            .values()
            .filter(|p| &p.owner == owner)
            .filter_map(|p| p.child.id())
            .collect()
    }

    async fn start(&self, owner: &ResourceId, template: &UnitTemplate) -> Result<Child, ExecutorError> {
        let mut cmd = Command::new(&template.image);
        cmd.args(&template.args)
            .envs(&template.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        info!(owner = %owner, cmd = ?cmd.as_std(), "Spawning unit process");

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                ExecutorError::Permanent(format!("cannot execute {}: {}", template.image, e))
            }
            _ => ExecutorError::Transient(format!("spawn {} failed: {}", template.image, e)),
        })?;

        // Wait briefly to catch immediate failure
        tokio::time::sleep(self.startup_grace).await;
        match child.try_wait() {
            Ok(None) => Ok(child),
            Ok(Some(status)) => Err(ExecutorError::Transient(format!(
                "{} exited during startup: {}",
                template.image, status
            ))),
            Err(e) => Err(ExecutorError::Transient(format!(
                "cannot poll {}: {}",
                template.image, e
            ))),
        }
    }

    async fn stop(unit: &UnitId, mut child: Child) -> Result<(), ExecutorError> {
        match child.kill().await {
            Ok(()) => {
                debug!(unit = %unit, "Unit process terminated");
                Ok(())
            }
            // Already exited and reaped
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(ExecutorError::Transient(format!(
                "kill {} failed: {}",
                unit, e
            ))),
        }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionExecutor for ProcessExecutor {
    async fn create(
        &self,
        owner: &ResourceId,
        template: &UnitTemplate,
    ) -> Result<UnitId, ExecutorError> {
        let child = self.start(owner, template).await?;
        let id = uuid::Uuid::new_v4().to_string();
        info!(owner = %owner, unit = %id, pid = ?child.id(), "Unit process started");

        self.processes.lock().await.insert(
            id.clone(),
            ProcessUnit {
                owner: owner.clone(),
                child,
            },
        );
        Ok(id)
    }

    async fn delete(&self, owner: &ResourceId, unit: &UnitId) -> Result<(), ExecutorError> {
        let Some(process) = self.processes.lock().await.remove(unit) else {
            return Err(ExecutorError::UnitNotFound(unit.clone()));
        };

        info!(owner = %owner, unit = %unit, "Stopping unit process");
        // The child is consumed either way; kill_on_drop covers a failed kill.
        if let Err(e) = Self::stop(unit, process.child).await {
            warn!(owner = %owner, unit = %unit, error = %e, "Unit process did not stop cleanly");
        }
        Ok(())
    }

    async fn update(
        &self,
        owner: &ResourceId,
        unit: &UnitId,
        template: &UnitTemplate,
    ) -> Result<(), ExecutorError> {
        if !self.processes.lock().await.contains_key(unit) {
            return Err(ExecutorError::UnitNotFound(unit.clone()));
        }

        // Start the replacement first so a bad template leaves the old process running.
        let child = self.start(owner, template).await?;

        let previous = self.processes.lock().await.insert(
            unit.clone(),
            ProcessUnit {
                owner: owner.clone(),
                child,
            },
        );
        if let Some(previous) = previous
            && let Err(e) = Self::stop(unit, previous.child).await
        {
            warn!(owner = %owner, unit = %unit, error = %e, "Previous unit process did not stop cleanly");
        }

        info!(owner = %owner, unit = %unit, image = %template.image, "Unit process restarted");
        Ok(())
    }
}
