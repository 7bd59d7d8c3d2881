//! Text and JSON-lines front-end for a single run.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::error::{StartError, StopError};
use crate::model::{ActiveRun, Rejection, RunDescriptor, RunEvent, StopAck};
use crate::orchestrator::RunClient;
use crate::session::{Notice, NoticeLevel, RunPhase, RunSession};

/// Events are the program's output and go to stdout; status chatter goes to stderr.
enum Line {
    Event(String),
    Status(String),
}

/// Drain `rx` into the two writers. Event lines are flushed one by one so a pipe reader
/// sees each event as it happens.
fn write_lines(
    mut rx: mpsc::UnboundedReceiver<Line>,
    out: &mut impl Write,
    err: &mut impl Write,
) {
    while let Some(line) = rx.blocking_recv() {
        let res = match &line {
            Line::Event(text) => writeln!(out, "{text}").and_then(|()| out.flush()),
            Line::Status(text) => writeln!(err, "{text}"),
        };
        if let Err(e) = res {
            tracing::debug!(error = %e, "console output closed");
            return;
        }
    }
}

/// Console output written from a blocking thread, so terminal writes never stall the
/// runtime.
struct LineSink {
    tx: mpsc::UnboundedSender<Line>,
    writer: tokio::task::JoinHandle<()>,
}

impl LineSink {
    fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::task::spawn_blocking(move || {
            let mut out = std::io::BufWriter::new(std::io::stdout().lock());
            let mut err = std::io::stderr().lock();
            write_lines(rx, &mut out, &mut err);
        });
        Self { tx, writer }
    }

    fn event(&self, text: String) {
        let _ = self.tx.send(Line::Event(text));
    }

    fn status(&self, text: String) {
        let _ = self.tx.send(Line::Status(text));
    }

    /// Wait until everything sent so far is written.
    async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.writer.await {
            tracing::warn!(error = %e, "console writer failed");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleOptions {
    /// Print every event as a JSON line on stdout.
    pub json: bool,
    /// Request a stop after this long.
    pub stop_after: Option<Duration>,
}

/// How a watched run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    Stopped,
    Failed(String),
    Rejected(Rejection),
}

impl RunOutcome {
    fn from_event(ev: &RunEvent) -> Option<Self> {
        match ev {
            RunEvent::Finished => Some(RunOutcome::Finished),
            RunEvent::Stopped => Some(RunOutcome::Stopped),
            RunEvent::Error { message } => Some(RunOutcome::Failed(message.clone())),
            RunEvent::Rejected { reason } => Some(RunOutcome::Rejected(*reason)),
            RunEvent::Started { .. } | RunEvent::Progress { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Finished | RunOutcome::Stopped)
    }
}

struct Printer {
    sink: LineSink,
    json: bool,
    run: RunDescriptor,
}

impl Printer {
    fn event(&self, ev: &RunEvent, session: &RunSession) -> Result<()> {
        if self.json {
            let line = ev.encode().context("failed to encode run event")?;
            self.sink.event(line);
            return Ok(());
        }
        let msg = match ev {
            RunEvent::Started { run } => format!("== {run} started =="),
            RunEvent::Progress { current, total } => {
                format!(
                    "{}: {} ({current}/{total})",
                    self.run,
                    session.progress().label()
                )
            }
            RunEvent::Finished => format!("{} finished", self.run),
            RunEvent::Stopped => format!("{} stopped", self.run),
            RunEvent::Error { message } => format!("{} failed: {message}", self.run),
            RunEvent::Rejected { reason } => format!("{} rejected: {}", self.run, reason.title()),
        };
        if ev.is_terminal() {
            self.sink.event(msg);
        } else {
            self.sink.status(msg);
        }
        Ok(())
    }

    fn notices(&self, notices: Vec<Notice>) {
        for notice in notices {
            let prefix = match notice.level {
                NoticeLevel::Warning => "warning",
                NoticeLevel::Error => "error",
            };
            self.sink
                .status(format!("{prefix}: {}", notice.to_message()));
        }
    }

    fn info(&self, msg: impl Into<String>) {
        if !self.json {
            self.sink.status(msg.into());
        }
    }
}

/// Start `run`, print its events until it ends, and stop it on Ctrl-C or after
/// `stop_after`.
pub async fn watch_run(
    client: &RunClient,
    run: RunDescriptor,
    opts: ConsoleOptions,
) -> Result<RunOutcome> {
    let printer = Printer {
        sink: LineSink::spawn(),
        json: opts.json,
        run,
    };
    let res = drive(client, run, opts, &printer).await;
    printer.sink.finish().await;
    res
}

async fn drive(
    client: &RunClient,
    run: RunDescriptor,
    opts: ConsoleOptions,
    printer: &Printer,
) -> Result<RunOutcome> {
    // Subscribe before sending the request so `started` cannot be missed.
    let scope = client.enter_context(format!("console {run}"));
    let mut watch = client.subscribe_to_run(&scope, run.category);
    let mut session = RunSession::new(run.category);

    match session.start(client, &watch, run) {
        Ok(()) => {}
        Err(StartError::AlreadyRunning { active }) => {
            printer.notices(session.take_notices());
            if let Some(current) = client.registry().current_run() {
                printer.info(busy_message(&current, OffsetDateTime::now_utc()));
            }
            return Ok(RunOutcome::Rejected(Rejection::AlreadyRunning { active }));
        }
        Err(e) => return Err(e).context("failed to request run"),
    }

    let stop_timer = async {
        match opts.stop_after {
            Some(d) => tokio::time::sleep(d).await,
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(stop_timer);
    let mut stop_sent = false;
    let mut stop_task: Option<tokio::task::JoinHandle<Result<StopAck, StopError>>> = None;
    let mut outcome: Option<RunOutcome> = None;

    loop {
        let can_stop = !stop_sent && session.phase() == RunPhase::Active;
        tokio::select! {
            ev = watch.recv() => {
                let Some(ev) = ev else {
                    bail!("subscription for {} was taken over by another context", run.category);
                };
                session
                    .apply(&ev)
                    .with_context(|| format!("run protocol violation on '{}'", ev.tag()))?;
                printer.event(&ev, &session)?;
                printer.notices(session.take_notices());
                if let Some(o) = RunOutcome::from_event(&ev) {
                    outcome = Some(o);
                    if session.phase() == RunPhase::Idle {
                        break;
                    }
                }
            }
            _ = &mut stop_timer, if can_stop => {
                printer.info(format!("Stopping {run}…"));
                stop_task = Some(request_stop(client, &mut session));
                stop_sent = true;
            }
            res = tokio::signal::ctrl_c(), if can_stop => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                } else {
                    printer.info(format!("Stopping {run}…"));
                    stop_task = Some(request_stop(client, &mut session));
                }
                stop_sent = true;
            }
            // Do not take the JoinHandle before this branch wins.
            acked = async {
                if let Some(h) = stop_task.as_mut() {
                    return h.await;
                }
                futures::future::pending().await
            } => {
                stop_task = None;
                match acked {
                    Ok(Ok(ack)) => {
                        session.finish_stop(ack);
                        // The terminal event is published before the ack.
                        while let Some(ev) = watch.try_recv() {
                            session.apply(&ev)?;
                            printer.event(&ev, &session)?;
                            if let Some(o) = RunOutcome::from_event(&ev) {
                                outcome = Some(o);
                            }
                        }
                        if ack == StopAck::Idle {
                            tracing::debug!("stop acknowledged with nothing running");
                        }
                    }
                    Ok(Err(e)) => session.stop_failed(&e),
                    Err(e) => {
                        tracing::warn!(error = %e, "stop task failed");
                        session.stop_failed(&StopError::ControllerGone);
                    }
                }
                printer.notices(session.take_notices());
                if session.phase() == RunPhase::Idle {
                    break;
                }
            }
        }
    }

    Ok(outcome.unwrap_or(RunOutcome::Stopped))
}

fn busy_message(active: &ActiveRun, now: OffsetDateTime) -> String {
    format!(
        "{} has been running for {}",
        active.descriptor,
        humantime::format_duration(active.running_for(now))
    )
}

fn request_stop(
    client: &RunClient,
    session: &mut RunSession,
) -> tokio::task::JoinHandle<Result<StopAck, StopError>> {
    session.begin_stop();
    let client = client.clone();
    tokio::spawn(async move { client.stop_run().await })
}
