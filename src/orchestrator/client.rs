//! Caller-facing handle to the run controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use super::controller::ControlCommand;
use crate::channel::EventBus;
use crate::error::{StartError, StopError};
use crate::listener::{ContextScope, RunWatch};
use crate::model::{RunCategory, RunDescriptor, StopAck};
use crate::registry::RunRegistry;

#[derive(Debug, Clone)]
pub struct RunClient {
    bus: EventBus,
    registry: Arc<RunRegistry>,
    cmd_tx: UnboundedSender<ControlCommand>,
    stop_timeout: Option<Duration>,
}

impl RunClient {
    pub(crate) fn new(
        bus: EventBus,
        registry: Arc<RunRegistry>,
        cmd_tx: UnboundedSender<ControlCommand>,
        stop_timeout: Option<Duration>,
    ) -> Self {
        Self {
            bus,
            registry,
            cmd_tx,
            stop_timeout,
        }
    }

    /// Open a caller context whose subscriptions end with it.
    pub fn enter_context(&self, name: impl Into<String>) -> ContextScope {
        ContextScope::enter(self.bus.clone(), name)
    }

    pub fn subscribe_to_run(&self, scope: &ContextScope, category: RunCategory) -> RunWatch {
        scope.watch(category)
    }

    pub fn unsubscribe(&self, watch: RunWatch) {
        watch.release();
    }

    /// Ask the controller to start `run`.
    ///
    /// `watch` must be a live subscription for the run's category, so no early event
    /// is missed. The outcome (`started` or a rejection) arrives on that watch.
    pub fn start_run(&self, watch: &RunWatch, run: RunDescriptor) -> Result<(), StartError> {
        if watch.category() != run.category || !watch.is_live() {
            return Err(StartError::NotSubscribed {
                category: run.category,
            });
        }
        if let Some(active) = self.registry.current() {
            return Err(StartError::AlreadyRunning { active });
        }
        tracing::debug!(run = %run, channel = run.category.binding().request, "requesting run");
        self.cmd_tx
            .send(ControlCommand::Continue { run })
            .map_err(|_| StartError::ControllerGone)
    }

    /// Stop the active run and wait for the controller to acknowledge it.
    ///
    /// Safe to call when nothing runs: that resolves to `StopAck::Idle`.
    pub async fn stop_run(&self) -> Result<StopAck, StopError> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(ControlCommand::Stop { ack })
            .map_err(|_| StopError::ControllerGone)?;
        match self.stop_timeout {
            Some(limit) => match tokio::time::timeout(limit, ack_rx).await {
                Ok(res) => res.map_err(|_| StopError::ControllerGone),
                Err(_) => {
                    tracing::warn!(timeout = %humantime::format_duration(limit), "stop not acknowledged in time");
                    Err(StopError::TimedOut(limit))
                }
            },
            None => ack_rx.await.map_err(|_| StopError::ControllerGone),
        }
    }

    /// Advisory snapshot of the active run.
    pub fn active_run(&self) -> Option<RunDescriptor> {
        self.registry.current()
    }

    /// Ask the controller to wind down. Returns false if it is already gone.
    pub fn shutdown(&self) -> bool {
        self.cmd_tx.send(ControlCommand::Shutdown).is_ok()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }
}
