//! Run lifecycle controller.
//!
//! Owns admission, job spawning, stop handling, and the single terminal event of each
//! run attempt. Callers talk to it through `ControlCommand`s and observe it through the
//! event bus.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::channel::EventBus;
use crate::engine::{JobCatalog, JobContext, ProgressEmitter};
use crate::model::{ChannelBinding, Rejection, RunDescriptor, RunEvent, StopAck};
use crate::registry::RunRegistry;

/// Commands sent by callers to control background runs.
#[derive(Debug)]
pub enum ControlCommand {
    /// Start `run`. The outcome arrives on the run's reply channel.
    Continue { run: RunDescriptor },
    /// Stop the active run, if any, and acknowledge once it is terminal.
    Stop { ack: oneshot::Sender<StopAck> },
    /// Cancel the active run, wait for it, and exit.
    Shutdown,
}

/// Collaborators the controller needs.
pub(crate) struct ControllerDeps {
    pub bus: EventBus,
    pub registry: Arc<RunRegistry>,
    pub catalog: JobCatalog,
    pub stop_grace: Duration,
}

/// Internal handle for a running job task.
struct RunCtx {
    run: RunDescriptor,
    binding: ChannelBinding,
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<Result<()>>>,
    stop_waiters: Vec<oneshot::Sender<StopAck>>,
}

impl RunCtx {
    fn request_cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(run = %self.run, "cancelling run");
            self.cancel.cancel();
        }
    }
}

fn publish(bus: &EventBus, channel: &'static str, event: RunEvent) {
    let tag = event.tag();
    if let Err(e) = bus.publish(channel, event) {
        // The run is process-wide; losing an observer does not stop it.
        tracing::warn!(error = %e, event = tag, "run event not delivered");
    }
}

/// Admit and spawn `run`, or publish why it cannot start.
fn start_run(deps: &ControllerDeps, run: RunDescriptor) -> Option<RunCtx> {
    let binding = run.category.binding();
    let Some(job) = deps.catalog.get(run.category) else {
        tracing::error!(run = %run, "no job registered for category");
        publish(
            &deps.bus,
            binding.reply,
            RunEvent::Error {
                message: format!("no job available for {}", run.category),
            },
        );
        return None;
    };

    if let Err(reason) = job.preflight(&run) {
        tracing::info!(run = %run, reason = ?reason, "run rejected by preflight");
        publish(&deps.bus, binding.reply, RunEvent::Rejected { reason });
        return None;
    }

    if let Err(e) = deps.registry.try_admit(run) {
        tracing::info!(run = %run, error = %e, "run not admitted");
        let crate::error::AdmissionError::AlreadyRunning { active } = e;
        publish(
            &deps.bus,
            binding.reply,
            RunEvent::Rejected {
                reason: Rejection::AlreadyRunning { active },
            },
        );
        return None;
    }

    publish(&deps.bus, binding.reply, RunEvent::Started { run });

    let cancel = CancellationToken::new();
    let ctx = JobContext {
        run,
        progress: ProgressEmitter::new(deps.bus.clone(), binding.progress_channel()),
        cancel: cancel.clone(),
    };
    let handle = tokio::spawn(async move { job.execute(ctx).await });
    Some(RunCtx {
        run,
        binding,
        cancel,
        handle: Some(handle),
        stop_waiters: Vec::new(),
    })
}

/// Map a job outcome to the terminal event of its attempt.
fn terminal_event(
    run: &RunDescriptor,
    cancelled: bool,
    join_res: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> RunEvent {
    match join_res {
        Ok(Ok(())) if cancelled => RunEvent::Stopped,
        Ok(Ok(())) => RunEvent::Finished,
        Ok(Err(e)) if cancelled => {
            tracing::debug!(run = %run, error = %e, "job failed while stopping");
            RunEvent::Stopped
        }
        Ok(Err(e)) => RunEvent::Error {
            message: format!("{e:#}"),
        },
        Err(e) => RunEvent::Error {
            message: format!("run task failed: {e}"),
        },
    }
}

/// Process commands one at a time until shutdown, driving at most one job.
pub(crate) async fn run_controller(
    deps: ControllerDeps,
    mut cmd_rx: UnboundedReceiver<ControlCommand>,
) -> Result<()> {
    let mut run_ctx: Option<RunCtx> = None;
    let mut quit_pending = false;
    // Stop watchdog: warn once if a cancelled job is slow to wind down.
    let mut stop_deadline: Option<Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(ControlCommand::Continue { run }) => {
                        if let Some(ctx) = &run_ctx {
                            // The registry is the authority; this only short-circuits.
                            tracing::info!(run = %run, active = %ctx.run, "run not admitted");
                            publish(
                                &deps.bus,
                                run.category.binding().reply,
                                RunEvent::Rejected {
                                    reason: Rejection::AlreadyRunning { active: ctx.run },
                                },
                            );
                        } else {
                            run_ctx = start_run(&deps, run);
                        }
                    }
                    Some(ControlCommand::Stop { ack }) => {
                        if let Some(ctx) = &mut run_ctx {
                            ctx.request_cancel();
                            ctx.stop_waiters.push(ack);
                            stop_deadline.get_or_insert(Instant::now() + deps.stop_grace);
                        } else {
                            tracing::debug!("stop requested with no active run");
                            let _ = ack.send(StopAck::Idle);
                        }
                    }
                    Some(ControlCommand::Shutdown) | None => {
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            ctx.request_cancel();
                            stop_deadline.get_or_insert(Instant::now() + deps.stop_grace);
                        } else {
                            break;
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    if let Some(mut ctx) = run_ctx.take() {
                        ctx.handle.take();
                        let event = terminal_event(&ctx.run, ctx.cancel.is_cancelled(), join_res);
                        tracing::info!(run = %ctx.run, outcome = event.tag(), "run ended");
                        deps.registry.release(&ctx.run);
                        publish(&deps.bus, ctx.binding.reply, event);
                        for waiter in ctx.stop_waiters.drain(..) {
                            let _ = waiter.send(StopAck::Stopped(ctx.run));
                        }
                    }
                    stop_deadline = None;
                    if quit_pending {
                        break;
                    }
                }
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = stop_deadline {
                    if Instant::now() >= deadline {
                        if let Some(ctx) = &run_ctx {
                            tracing::warn!(
                                run = %ctx.run,
                                grace = %humantime::format_duration(deps.stop_grace),
                                "still stopping, waiting for the job to wind down"
                            );
                        }
                        stop_deadline = None;
                    }
                }
            }
        }
    }

    tracing::debug!("run controller exited");
    Ok(())
}
