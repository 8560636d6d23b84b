//! Controller loop - drives the reconciler against the watch feed.
//!
//! Each identity is either idle or has exactly one reconciliation task.
//! Events for an identity that is already reconciling are coalesced into a
//! single follow-up pass, never dropped and never run concurrently.
//!
//! A pass reads the store, asks the reconciler for a plan and executes the
//! actions in order:
//!
//! - before every attempt the desired generation is re-checked; a change
//!   aborts the pass and schedules a fresh one (a deletion therefore replaces
//!   any remaining Create/Update actions with teardown)
//! - Create/Update failures are retried with exponential backoff up to
//!   `max_attempts`, after which the identity is marked Degraded
//! - Delete failures are retried without limit
//! - the observed status is written back after every completed call

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, Interval};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::executor::{ActionExecutor, ExecutorError};
use crate::reconciler;
use crate::store::StateStore;
use crate::types::{
    DesiredSpec, ObservedStatus, Phase, ReconcileAction, ResourceId, ResourceStatus, Unit, UnitId,
};
use crate::watch::watch;

/// Counters for reconciliation activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    /// Passes started.
    pub passes: u64,
    /// Events folded into an already running pass.
    pub coalesced: u64,
    /// Passes cut short by a desired-spec change.
    pub aborted: u64,
    /// Passes that ended with the identity Degraded.
    pub degraded: u64,
}

#[derive(Default)]
struct Counters {
    passes: AtomicU64,
    coalesced: AtomicU64,
    aborted: AtomicU64,
    degraded: AtomicU64,
}

/// Bookkeeping for an identity with a running pass.
struct Slot {
    /// Another pass is needed once the current one ends.
    pending: bool,
    /// Wakes the running pass out of a backoff sleep.
    wake: Arc<Notify>,
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Done,
    Requeue,
    Degraded,
}

/// Result of executing one action including its retries.
enum Execution {
    Applied(Option<UnitId>),
    /// Update target disappeared from the backend.
    UnitGone,
    Aborted(Error),
    Failed(Error),
}

/// The reconciliation controller.
pub struct Controller {
    store: Arc<dyn StateStore>,
    executor: Arc<dyn ActionExecutor>,
    config: ControllerConfig,
    slots: DashMap<ResourceId, Slot>,
    counters: Counters,
}

impl Controller {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: Arc<dyn ActionExecutor>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            slots: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // =========================================================================
    // Caller API
    // =========================================================================

    /// Declare the desired spec for `id`. Returns the new generation.
    pub async fn apply(&self, id: &ResourceId, spec: DesiredSpec) -> Result<u64> {
        let generation = self.store.put_desired(id, spec).await?;
        info!(id = %id, generation, "Desired spec applied");
        Ok(generation)
    }

    /// Request deletion of `id`. Unknown identities are already converged.
    pub async fn delete(&self, id: &ResourceId) {
        if self.store.delete_desired(id).await {
            info!(id = %id, "Deletion requested");
        } else {
            debug!(id = %id, "Delete of unknown or already deleted resource");
        }
    }

    /// Current status of `id`.
    pub async fn status(&self, id: &ResourceId) -> Result<ResourceStatus> {
        let record = self
            .store
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let observed = record.observed.as_ref();

        let phase = match (observed, &record.desired) {
            (Some(status), _) => status.phase,
            (None, Some(_)) => Phase::Progressing,
            (None, None) => Phase::Terminating,
        };

        // Only units already on the desired template count as ready
        let ready_replicas = match (observed, &record.desired) {
            (Some(status), Some(spec)) => status
                .units
                .iter()
                .filter(|u| u.template == spec.template)
                .count(),
            _ => 0,
        };

        Ok(ResourceStatus {
            id: id.clone(),
            phase,
            desired_replicas: record.desired.as_ref().map(|d| d.replicas),
            ready_replicas,
            observed_replicas: observed.map(ObservedStatus::count).unwrap_or(0),
            generation: record.generation,
            observed_generation: observed.map(|o| o.observed_generation).unwrap_or(0),
            last_error: observed.and_then(|o| o.last_error.clone()),
            reconciling: self.is_reconciling(id),
        })
    }

    /// Status of every known identity.
    pub async fn list_status(&self) -> Vec<ResourceStatus> {
        let mut statuses = Vec::new();
        for (id, _) in self.store.list().await {
            // Purged between list and get
            if let Ok(status) = self.status(&id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    pub fn is_reconciling(&self, id: &ResourceId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            passes: self.counters.passes.load(Ordering::SeqCst),
            coalesced: self.counters.coalesced.load(Ordering::SeqCst),
            aborted: self.counters.aborted.load(Ordering::SeqCst),
            degraded: self.counters.degraded.load(Ordering::SeqCst),
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Follow the watch feed until `stop` fires or its sender is dropped.
    ///
    /// A feed that ends is reopened after `watch_restart_delay`. When
    /// `resync_interval` is set every known identity is re-enqueued on that
    /// period, which also retries Degraded identities.
    pub async fn run(self: Arc<Self>, mut stop: mpsc::Receiver<()>) {
        info!("Controller started");

        let mut resync = self
            .config
            .resync_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        'outer: loop {
            let mut feed = Box::pin(watch(Arc::clone(&self.store)));

            loop {
                tokio::select! {
                    event = feed.next() => match event {
                        Some(event) => {
                            debug!(id = %event.id, kind = ?event.kind, revision = event.revision, "Watch event");
                            self.enqueue(&event.id);
                        }
                        None => break,
                    },
                    _ = tick(&mut resync) => self.resync().await,
                    _ = stop.recv() => break 'outer,
                }
            }

            warn!(
                "Watch feed ended, reopening in {:?}",
                self.config.watch_restart_delay
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.watch_restart_delay) => {}
                _ = stop.recv() => break 'outer,
            }
        }

        info!("Controller stopped");
    }

    /// Re-enqueue every identity the store knows.
    pub async fn resync(self: &Arc<Self>) {
        let ids = self.store.list().await;
        debug!(count = ids.len(), "Resync");
        for (id, _) in ids {
            self.enqueue(&id);
        }
    }

    /// Schedule a pass for `id`, or fold the request into the running one.
    pub fn enqueue(self: &Arc<Self>, id: &ResourceId) {
        let wake = match self.slots.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().pending = true;
                slot.get().wake.notify_one();
                self.counters.coalesced.fetch_add(1, Ordering::SeqCst);
                debug!(id = %id, "Pass already running, coalesced");
                return;
            }
            Entry::Vacant(vacant) => {
                let wake = Arc::new(Notify::new());
                vacant.insert(Slot {
                    pending: false,
                    wake: Arc::clone(&wake),
                });
                wake
            }
        };

        let this = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            this.drive(id, wake).await;
        });
    }

    /// Run passes for `id` until nothing is pending, then release the slot.
    async fn drive(&self, id: ResourceId, wake: Arc<Notify>) {
        loop {
            self.counters.passes.fetch_add(1, Ordering::SeqCst);
            let outcome = self.reconcile_pass(&id, &wake).await;
            debug!(id = %id, ?outcome, "Pass finished");

            let again = match self.slots.entry(id.clone()) {
                Entry::Occupied(mut slot) => {
                    if slot.get().pending || outcome == PassOutcome::Requeue {
                        slot.get_mut().pending = false;
                        true
                    } else {
                        slot.remove();
                        false
                    }
                }
                Entry::Vacant(_) => false,
            };

            if !again {
                break;
            }
        }
    }

    // =========================================================================
    // Reconciliation pass
    // =========================================================================

    async fn reconcile_pass(&self, id: &ResourceId, wake: &Notify) -> PassOutcome {
        let Some(record) = self.store.get(id).await else {
            debug!(id = %id, "Resource unknown, nothing to reconcile");
            return PassOutcome::Done;
        };
        let generation = record.generation;
        let actions = reconciler::plan(record.desired.as_ref(), record.observed.as_ref());
        let mut status = record
            .observed
            .unwrap_or_else(|| ObservedStatus::empty(generation));

        if actions.is_empty() {
            return self
                .finish(id, generation, record.desired.is_some(), status)
                .await;
        }

        let (low, high) = reconciler::live_count_bounds(status.count(), &actions);
        info!(
            id = %id,
            generation,
            actions = actions.len(),
            current = status.count(),
            desired = ?record.desired.as_ref().map(|d| d.replicas),
            low,
            high,
            "Reconciling"
        );

        status.phase = if record.desired.is_some() {
            Phase::Progressing
        } else {
            Phase::Terminating
        };
        status.observed_generation = generation;
        if !self.write_status(id, &mut status).await {
            return PassOutcome::Done;
        }

        for action in &actions {
            if let Err(e) = self.check_generation(id, generation).await {
                info!(id = %id, error = %e, "Aborting pass");
                return self.aborted(e);
            }

            match self.execute(id, action, generation, wake).await {
                Execution::Applied(created) => {
                    apply_effect(&mut status, action, created);
                    status.last_error = None;
                    if !self.write_status(id, &mut status).await {
                        return PassOutcome::Done;
                    }
                }
                Execution::UnitGone => {
                    if let ReconcileAction::Update { unit_id, .. } = action {
                        warn!(id = %id, unit = %unit_id, "Unit vanished during update, replanning");
                        status.units.retain(|u| &u.id != unit_id);
                    }
                    self.write_status(id, &mut status).await;
                    return PassOutcome::Requeue;
                }
                Execution::Aborted(e) => {
                    info!(id = %id, error = %e, "Aborting pass");
                    return self.aborted(e);
                }
                Execution::Failed(e) => {
                    error!(id = %id, action = action.kind(), error = %e, "Action failed, resource degraded");
                    status.phase = Phase::Degraded;
                    status.last_error = Some(e.to_string());
                    self.write_status(id, &mut status).await;
                    self.counters.degraded.fetch_add(1, Ordering::SeqCst);
                    return PassOutcome::Degraded;
                }
            }
        }

        self.finish(id, generation, record.desired.is_some(), status)
            .await
    }

    /// Close out a pass whose plan fully applied.
    async fn finish(
        &self,
        id: &ResourceId,
        generation: u64,
        live: bool,
        mut status: ObservedStatus,
    ) -> PassOutcome {
        if !live {
            return if self.store.purge_tombstone(id, generation).await {
                info!(id = %id, "Resource torn down and purged");
                PassOutcome::Done
            } else {
                // Re-created while tearing down
                PassOutcome::Requeue
            };
        }

        if status.phase == Phase::Ready
            && status.observed_generation == generation
            && status.last_error.is_none()
        {
            return PassOutcome::Done;
        }

        status.phase = Phase::Ready;
        status.observed_generation = generation;
        status.last_error = None;
        if self.write_status(id, &mut status).await {
            info!(id = %id, generation, replicas = status.count(), "Resource ready");
        }
        PassOutcome::Done
    }

    fn aborted(&self, e: Error) -> PassOutcome {
        self.counters.aborted.fetch_add(1, Ordering::SeqCst);
        match e {
            // Purged under us; nothing left to converge
            Error::NotFound(_) => PassOutcome::Done,
            _ => PassOutcome::Requeue,
        }
    }

    /// Persist `status`. Returns false when the record no longer exists.
    async fn write_status(&self, id: &ResourceId, status: &mut ObservedStatus) -> bool {
        status.updated_at = Utc::now();
        match self.store.put_observed(id, status.clone()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %id, error = %e, "Dropping status write");
                false
            }
        }
    }

    /// Fail with `ConflictingUpdate` if the desired spec moved past `generation`.
    async fn check_generation(&self, id: &ResourceId, generation: u64) -> Result<()> {
        let record = self
            .store
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        if record.generation != generation {
            return Err(Error::ConflictingUpdate {
                id: id.clone(),
                expected: generation,
                actual: record.generation,
            });
        }
        Ok(())
    }

    /// Execute one action, retrying per the failure policy.
    async fn execute(
        &self,
        id: &ResourceId,
        action: &ReconcileAction,
        generation: u64,
        wake: &Notify,
    ) -> Execution {
        let is_delete = matches!(action, ReconcileAction::Delete { .. });
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);

            let err: Error = match self.call(id, action).await {
                Ok(created) => return Execution::Applied(created),
                Err(ExecutorError::UnitNotFound(unit)) if is_delete => {
                    debug!(id = %id, unit = %unit, "Unit already gone");
                    return Execution::Applied(None);
                }
                Err(ExecutorError::UnitNotFound(_)) => return Execution::UnitGone,
                Err(e) => e.into(),
            };

            let retry = is_delete || (err.is_transient() && attempt < self.config.max_attempts);
            if !retry {
                return Execution::Failed(err);
            }

            let backoff = self.config.backoff(attempt);
            warn!(
                id = %id,
                action = action.kind(),
                attempt,
                backoff = ?backoff,
                error = %err,
                "Action failed, retrying"
            );

            if let Err(e) = self.wait_backoff(id, generation, backoff, wake).await {
                return Execution::Aborted(e);
            }
        }
    }

    /// One bounded executor call.
    async fn call(
        &self,
        id: &ResourceId,
        action: &ReconcileAction,
    ) -> std::result::Result<Option<UnitId>, ExecutorError> {
        let timeout = self.config.action_timeout;
        let call = async {
            match action {
                ReconcileAction::Create { template } => {
                    self.executor.create(id, template).await.map(Some)
                }
                ReconcileAction::Delete { unit_id } => {
                    self.executor.delete(id, unit_id).await.map(|()| None)
                }
                ReconcileAction::Update { unit_id, template } => self
                    .executor
                    .update(id, unit_id, template)
                    .await
                    .map(|()| None),
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Transient(format!(
                "{} timed out after {:?}",
                action.kind(),
                timeout
            ))),
        }
    }

    /// Sleep for `backoff`, waking early to abort if the spec changes.
    async fn wait_backoff(
        &self,
        id: &ResourceId,
        generation: u64,
        backoff: Duration,
        wake: &Notify,
    ) -> Result<()> {
        let deadline = Instant::now() + backoff;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = wake.notified() => self.check_generation(id, generation).await?,
            }
        }
        self.check_generation(id, generation).await
    }
}

/// Record a successful action in `status`.
fn apply_effect(status: &mut ObservedStatus, action: &ReconcileAction, created: Option<UnitId>) {
    match action {
        ReconcileAction::Create { template } => {
            if let Some(unit_id) = created {
                status.units.push(Unit {
                    id: unit_id,
                    template: template.clone(),
                    created_at: Utc::now(),
                });
            }
        }
        ReconcileAction::Delete { unit_id } => status.units.retain(|u| &u.id != unit_id),
        ReconcileAction::Update { unit_id, template } => {
            if let Some(unit) = status.units.iter_mut().find(|u| &u.id == unit_id) {
                unit.template = template.clone();
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
