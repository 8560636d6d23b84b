//! Simulated executor - keeps units in memory.
//!
//! Used by the demo binary and the tests. Faults can be queued per operation
//! to exercise the controller's retry paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ActionExecutor, ExecutorError};
use crate::types::{ResourceId, UnitId, UnitTemplate};

/// Failure to return from the next call of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Transient,
    Permanent,
    /// Never returns; the caller's timeout has to fire.
    Hang,
}

#[derive(Default)]
struct Faults {
    create: VecDeque<InjectedFault>,
    delete: VecDeque<InjectedFault>,
    update: VecDeque<InjectedFault>,
}

/// A unit living in the simulated backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedUnit {
    pub owner: ResourceId,
    pub template: UnitTemplate,
}

/// In-memory backend.
#[derive(Default)]
pub struct SimulatedExecutor {
    units: Mutex<HashMap<UnitId, SimulatedUnit>>,
    faults: Mutex<Faults>,
    rejected_images: Mutex<HashSet<String>>,
    latency: Duration,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    updates: AtomicUsize,
    in_flight: DashMap<ResourceId, usize>,
    peak_in_flight: DashMap<ResourceId, usize>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `n` creates with `fault`.
    pub async fn fail_creates(&self, n: usize, fault: InjectedFault) {
        self.faults.lock().await.create.extend(std::iter::repeat_n(fault, n));
    }

    /// Fail the next `n` deletes with `fault`.
    pub async fn fail_deletes(&self, n: usize, fault: InjectedFault) {
        self.faults.lock().await.delete.extend(std::iter::repeat_n(fault, n));
    }

    /// Fail the next `n` updates with `fault`.
    pub async fn fail_updates(&self, n: usize, fault: InjectedFault) {
        self.faults.lock().await.update.extend(std::iter::repeat_n(fault, n));
    }

    /// Reject any template using `image` as a permanent error.
    pub async fn reject_image(&self, image: impl Into<String>) {
        self.rejected_images.lock().await.insert(image.into());
    }

    /// Units currently owned by `owner`.
    pub async fn units_of(&self, owner: &ResourceId) -> Vec<(UnitId, SimulatedUnit)> {
        let mut units: Vec<_> = self
            .units
            .lock()
            .await
            .iter()
            .filter(|(_, u)| &u.owner == owner)
            .map(|(id, u)| (id.clone(), u.clone()))
            .collect();
        units.sort_by(|a, b| a.0.cmp(&b.0));
        units
    }

    pub async fn unit_count(&self) -> usize {
        self.units.lock().await.len()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Highest number of calls ever in flight at once for `owner`.
    pub fn peak_in_flight(&self, owner: &ResourceId) -> usize {
        self.peak_in_flight.get(owner).map(|p| *p).unwrap_or(0)
    }

    fn enter<'a>(&'a self, owner: &'a ResourceId) -> InFlight<'a> {
        let mut current = self.in_flight.entry(owner.clone()).or_insert(0);
        *current += 1;
        let mut peak = self.peak_in_flight.entry(owner.clone()).or_insert(0);
        *peak = (*peak).max(*current);
        InFlight { exec: self, owner }
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    async fn check_fault(fault: Option<InjectedFault>, op: &str) -> Result<(), ExecutorError> {
        match fault {
            None => Ok(()),
            Some(InjectedFault::Transient) => {
                Err(ExecutorError::Transient(format!("injected {} failure", op)))
            }
            Some(InjectedFault::Permanent) => {
                Err(ExecutorError::Permanent(format!("injected {} rejection", op)))
            }
            Some(InjectedFault::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn check_image(&self, template: &UnitTemplate) -> Result<(), ExecutorError> {
        if self.rejected_images.lock().await.contains(&template.image) {
            return Err(ExecutorError::Permanent(format!(
                "image {} rejected",
                template.image
            )));
        }
        Ok(())
    }

    async fn do_create(
        &self,
        owner: &ResourceId,
        template: &UnitTemplate,
    ) -> Result<UnitId, ExecutorError> {
        self.delay().await;
        let fault = self.faults.lock().await.create.pop_front();
        Self::check_fault(fault, "create").await?;
        self.check_image(template).await?;

        let simple = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", owner.name, &simple[..8]);
        self.units.lock().await.insert(
            id.clone(),
            SimulatedUnit {
                owner: owner.clone(),
                template: template.clone(),
            },
        );
        debug!(owner = %owner, unit = %id, image = %template.image, "Simulated unit created");
        Ok(id)
    }

    async fn do_delete(&self, owner: &ResourceId, unit: &UnitId) -> Result<(), ExecutorError> {
        self.delay().await;
        let fault = self.faults.lock().await.delete.pop_front();
        Self::check_fault(fault, "delete").await?;

        match self.units.lock().await.remove(unit) {
            Some(_) => {
                debug!(owner = %owner, unit = %unit, "Simulated unit deleted");
                Ok(())
            }
            None => Err(ExecutorError::UnitNotFound(unit.clone())),
        }
    }

    async fn do_update(
        &self,
        owner: &ResourceId,
        unit: &UnitId,
        template: &UnitTemplate,
    ) -> Result<(), ExecutorError> {
        self.delay().await;
        let fault = self.faults.lock().await.update.pop_front();
        Self::check_fault(fault, "update").await?;
        self.check_image(template).await?;

        let mut units = self.units.lock().await;
        let existing = units
            .get_mut(unit)
            .ok_or_else(|| ExecutorError::UnitNotFound(unit.clone()))?;
        existing.template = template.clone();
        debug!(owner = %owner, unit = %unit, image = %template.image, "Simulated unit updated");
        Ok(())
    }
}

/// Decrements the in-flight count when a call finishes or is cancelled.
struct InFlight<'a> {
    exec: &'a SimulatedExecutor,
    owner: &'a ResourceId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut current) = self.exec.in_flight.get_mut(self.owner) {
            *current = current.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ActionExecutor for SimulatedExecutor {
    async fn create(
        &self,
        owner: &ResourceId,
        template: &UnitTemplate,
    ) -> Result<UnitId, ExecutorError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let _in_flight = self.enter(owner);
        self.do_create(owner, template).await
    }

    async fn delete(&self, owner: &ResourceId, unit: &UnitId) -> Result<(), ExecutorError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let _in_flight = self.enter(owner);
        self.do_delete(owner, unit).await
    }

    async fn update(
        &self,
        owner: &ResourceId,
        unit: &UnitId,
        template: &UnitTemplate,
    ) -> Result<(), ExecutorError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let _in_flight = self.enter(owner);
        self.do_update(owner, unit, template).await
    }
}
