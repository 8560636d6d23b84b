//! Shared test utilities for mkube-controller integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mkube_controller::{
    Controller, ControllerConfig, DesiredSpec, InMemoryStore, Phase, ResourceId, ResourceStatus,
    SimulatedExecutor, StateStore, UnitTemplate,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Retry settings small enough to keep tests fast.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        action_timeout: Duration::from_millis(500),
        resync_interval: None,
        watch_restart_delay: Duration::from_millis(10),
    }
}

pub fn rid(name: &str) -> ResourceId {
    ResourceId::new("test", name).expect("valid resource id")
}

pub fn spec(replicas: u32, image: &str) -> DesiredSpec {
    DesiredSpec::new(replicas, UnitTemplate::new(image))
}

/// A controller running its watch loop over an in-memory store and a
/// simulated backend.
pub struct TestController {
    pub controller: Arc<Controller>,
    pub store: Arc<InMemoryStore>,
    pub executor: Arc<SimulatedExecutor>,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestController {
    /// Spawn with the fast test config.
    pub async fn spawn(executor: SimulatedExecutor) -> Self {
        Self::spawn_with(executor, fast_config()).await
    }

    /// Spawn with an explicit config.
    pub async fn spawn_with(executor: SimulatedExecutor, config: ControllerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let executor = Arc::new(executor);
        let controller = Arc::new(Controller::new(
            store.clone() as Arc<dyn StateStore>,
            executor.clone(),
            config,
        ));

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(controller.clone().run(stop_rx));

        // Let the loop subscribe before the test starts writing
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            controller,
            store,
            executor,
            stop_tx,
            handle,
        }
    }

    pub async fn status(&self, id: &ResourceId) -> ResourceStatus {
        self.controller.status(id).await.expect("status")
    }

    /// Wait until `id` reaches `phase` for `generation` with no pass running.
    pub async fn wait_for_phase(&self, id: &ResourceId, phase: Phase, generation: u64) {
        let controller = self.controller.clone();
        let id = id.clone();
        wait_until(&format!("{} {:?}@{}", id, phase, generation), move || {
            let controller = controller.clone();
            let id = id.clone();
            async move {
                match controller.status(&id).await {
                    Ok(s) => {
                        s.phase == phase && s.observed_generation == generation && !s.reconciling
                    }
                    Err(_) => false,
                }
            }
        })
        .await;
    }

    /// Wait until `id` has been purged from the store.
    pub async fn wait_for_purge(&self, id: &ResourceId) {
        let store = self.store.clone();
        let id = id.clone();
        wait_until(&format!("{} purged", id), move || {
            let store = store.clone();
            let id = id.clone();
            async move { store.get(&id).await.is_none() }
        })
        .await;
    }

    /// Stop the controller loop.
    pub async fn shutdown(self) {
        drop(self.stop_tx);
        let _ = self.handle.await;
    }
}

/// Poll `check` until it returns true, panicking after five seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Timed out waiting for {}", what);
}
