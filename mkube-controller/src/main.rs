//! mkube-controller: runs the reconciliation loop against a local backend.
//!
//! This daemon:
//! - Registers the deployments given on the command line
//! - Watches the store and reconciles each deployment
//! - Periodically logs per-deployment status as JSON
//! - Optionally tears everything down on SIGINT/SIGTERM

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mkube_controller::{
    ActionExecutor, Controller, ControllerConfig, DesiredSpec, InMemoryStore, ProcessExecutor,
    ResourceId, SimulatedExecutor, StateStore, UnitTemplate,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-memory units
    Simulated,
    /// One local process per unit (image = program path)
    Process,
}

/// mkube controller
#[derive(Parser, Debug)]
#[command(name = "mkube-controller", version, about)]
struct Args {
    /// Deployment to manage (format: [namespace/]name=replicas:image, repeatable)
    #[arg(long = "deployment", value_parser = parse_deployment)]
    deployments: Vec<(ResourceId, DesiredSpec)>,

    /// Unit backend
    #[arg(long, value_enum, default_value = "simulated")]
    backend: Backend,

    /// Controller name used in logs (defaults to hostname)
    #[arg(long)]
    name: Option<String>,

    /// Attempts per create/update before a deployment is marked degraded
    #[arg(long, default_value = "5")]
    max_attempts: u32,

    /// Backoff after the first failed attempt, in milliseconds
    #[arg(long, default_value = "100")]
    initial_backoff_ms: u64,

    /// Maximum backoff between attempts, in milliseconds
    #[arg(long, default_value = "10000")]
    max_backoff_ms: u64,

    /// Timeout for a single backend call, in milliseconds
    #[arg(long, default_value = "30000")]
    action_timeout_ms: u64,

    /// Resync interval in seconds (0 disables)
    #[arg(long, default_value = "60")]
    resync_secs: u64,

    /// Status log interval in seconds
    #[arg(long, default_value = "10")]
    status_interval: u64,

    /// Delete all deployments and wait for teardown on shutdown
    #[arg(long)]
    teardown_on_exit: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            action_timeout: Duration::from_millis(self.action_timeout_ms),
            resync_interval: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            ..Default::default()
        }
    }
}

fn parse_deployment(s: &str) -> Result<(ResourceId, DesiredSpec), String> {
    let (id, rest) = s
        .split_once('=')
        .ok_or("Expected format: [namespace/]name=replicas:image")?;
    let (replicas, image) = rest
        .split_once(':')
        .ok_or("Expected format: [namespace/]name=replicas:image")?;

    let id: ResourceId = id.parse().map_err(|e| format!("{}", e))?;
    let replicas: u32 = replicas
        .parse()
        .map_err(|_| format!("Invalid replica count: {}", replicas))?;

    let spec = DesiredSpec::new(replicas, UnitTemplate::new(image));
    spec.validate().map_err(|e| e.to_string())?;
    Ok((id, spec))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mkube_controller=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let name = args.name.clone().unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    info!("Starting mkube-controller: {}", name);
    info!("Backend: {:?}", args.backend);

    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    let executor: Arc<dyn ActionExecutor> = match args.backend {
        Backend::Simulated => Arc::new(SimulatedExecutor::new()),
        Backend::Process => Arc::new(ProcessExecutor::new()),
    };
    let controller = Arc::new(Controller::new(
        Arc::clone(&store),
        executor,
        args.controller_config(),
    ));

    for (id, spec) in &args.deployments {
        controller
            .apply(id, spec.clone())
            .await
            .with_context(|| format!("Failed to register deployment {}", id))?;
    }

    let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
    let run_handle = tokio::spawn(Arc::clone(&controller).run(stop_rx));

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    let mut status_tick = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = status_tick.tick() => log_status(&controller).await,
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
        }
    }

    if args.teardown_on_exit {
        teardown(&controller).await;
    }

    drop(stop_tx);
    run_handle.await.context("Controller task panicked")?;

    Ok(())
}

async fn log_status(controller: &Controller) {
    for status in controller.list_status().await {
        match serde_json::to_string(&status) {
            Ok(json) => info!(target: "mkube_controller::status", "{}", json),
            Err(e) => warn!("Failed to encode status for {}: {}", status.id, e),
        }
    }
}

/// Delete every deployment and wait until the store is empty.
async fn teardown(controller: &Controller) {
    for (id, _) in controller.store().list().await {
        controller.delete(&id).await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let remaining = controller.store().list().await.len();
        if remaining == 0 {
            info!("All deployments torn down");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Timeout waiting for teardown, {} deployments left", remaining);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
