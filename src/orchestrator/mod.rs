//! Application-level orchestration.
//!
//! This module owns run lifecycle control (admission, start, stop, terminal events).
//! Callers only ever hold a `RunClient`; the controller task runs on its own and talks
//! back through the event bus.

mod client;
mod controller;

pub use client::RunClient;
pub use controller::ControlCommand;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::channel::EventBus;
use crate::engine::JobCatalog;
use crate::registry::RunRegistry;
use controller::{run_controller, ControllerDeps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// How long a stopping job may take before the controller warns about it.
    pub stop_grace: Duration,
    /// Give up waiting for a stop acknowledgement after this long. `None` waits forever.
    pub stop_timeout: Option<Duration>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(3),
            stop_timeout: None,
        }
    }
}

/// Spawn a controller with a fresh bus and registry.
pub fn launch(catalog: JobCatalog, opts: ControllerOptions) -> (RunClient, JoinHandle<Result<()>>) {
    launch_with(
        EventBus::new(),
        Arc::new(RunRegistry::new()),
        catalog,
        opts,
    )
}

/// Spawn a controller over an existing bus and registry.
pub fn launch_with(
    bus: EventBus,
    registry: Arc<RunRegistry>,
    catalog: JobCatalog,
    opts: ControllerOptions,
) -> (RunClient, JoinHandle<Result<()>>) {
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
    tracing::debug!(jobs = ?catalog, "launching run controller");
    let deps = ControllerDeps {
        bus: bus.clone(),
        registry: Arc::clone(&registry),
        catalog,
        stop_grace: opts.stop_grace,
    };
    let handle = tokio::spawn(run_controller(deps, cmd_rx));
    let client = RunClient::new(bus, registry, cmd_tx, opts.stop_timeout);
    (client, handle)
}
