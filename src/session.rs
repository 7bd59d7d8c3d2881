//! Caller-side run state machine.
//!
//! `Idle -> Requesting -> Active -> Terminating -> Idle`, with `Requesting -> Idle` on a
//! rejection. The session never blocks: it is fed events and stop acknowledgements and
//! exposes what a front-end should show.

use crate::error::{ProtocolError, StartError, StopError};
use crate::listener::RunWatch;
use crate::model::{Rejection, RunCategory, RunDescriptor, RunEvent, StopAck};
use crate::orchestrator::RunClient;
use crate::progress::{self, ProgressView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Requesting,
    Active,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Warning,
    Error,
}

/// User-visible message produced by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub description: String,
}

impl Notice {
    fn warning(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            title: title.into(),
            description: description.into(),
        }
    }

    fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: title.into(),
            description: description.into(),
        }
    }

    fn rejection(reason: &Rejection) -> Self {
        Self::warning(reason.title(), reason.to_message())
    }

    pub fn to_message(&self) -> String {
        format!("{}: {}", self.title, self.description)
    }
}

#[derive(Debug)]
pub struct RunSession {
    category: RunCategory,
    phase: RunPhase,
    requested: Option<RunDescriptor>,
    running: Option<RunDescriptor>,
    view: ProgressView,
    last_ratio: Option<f64>,
    /// Terminal event seen while a stop was pending.
    ended: Option<RunEvent>,
    /// The stop acknowledgement will not arrive; a terminal event ends the run instead.
    stop_timed_out: bool,
    notices: Vec<Notice>,
}

impl RunSession {
    pub fn new(category: RunCategory) -> Self {
        Self {
            category,
            phase: RunPhase::Idle,
            requested: None,
            running: None,
            view: ProgressView::Hidden,
            last_ratio: None,
            ended: None,
            stop_timed_out: false,
            notices: Vec::new(),
        }
    }

    pub fn category(&self) -> RunCategory {
        self.category
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// The run this context shows as running.
    pub fn running(&self) -> Option<RunDescriptor> {
        self.running
    }

    pub fn progress(&self) -> ProgressView {
        self.view
    }

    /// Last percentage shown, kept after the indicator is cleared.
    pub fn last_ratio(&self) -> Option<f64> {
        self.last_ratio
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// `Idle -> Requesting`. An `AlreadyRunning` fast-fail stays `Idle` and leaves a notice.
    pub fn start(
        &mut self,
        client: &RunClient,
        watch: &RunWatch,
        run: RunDescriptor,
    ) -> Result<(), StartError> {
        if self.phase != RunPhase::Idle {
            let active = self.running.or(self.requested).unwrap_or(run);
            return Err(StartError::AlreadyRunning { active });
        }
        match client.start_run(watch, run) {
            Ok(()) => {
                self.phase = RunPhase::Requesting;
                self.requested = Some(run);
                self.last_ratio = None;
                self.ended = None;
                Ok(())
            }
            Err(StartError::AlreadyRunning { active }) => {
                self.notices
                    .push(Notice::rejection(&Rejection::AlreadyRunning { active }));
                Err(StartError::AlreadyRunning { active })
            }
            Err(e) => Err(e),
        }
    }

    /// Feed one event from the run's watch.
    pub fn apply(&mut self, event: &RunEvent) -> Result<(), ProtocolError> {
        match self.phase {
            RunPhase::Idle => {
                tracing::debug!(event = event.tag(), "dropping event while idle");
                Ok(())
            }
            RunPhase::Requesting => self.apply_requesting(event),
            RunPhase::Active => self.apply_active(event),
            RunPhase::Terminating => self.apply_terminating(event),
        }
    }

    fn apply_requesting(&mut self, event: &RunEvent) -> Result<(), ProtocolError> {
        match event {
            RunEvent::Started { run } => {
                if let Some(requested) = self.requested {
                    if requested.id != run.id {
                        return Err(ProtocolError::ConflictingStart {
                            active: requested,
                            started: *run,
                        });
                    }
                }
                self.phase = RunPhase::Active;
                self.running = Some(*run);
                self.requested = None;
                self.view = progress::reduce(self.view, event);
                Ok(())
            }
            RunEvent::Progress { .. } => Err(ProtocolError::ProgressBeforeStart),
            RunEvent::Rejected { reason } => {
                self.notices.push(Notice::rejection(reason));
                self.clear();
                Ok(())
            }
            RunEvent::Error { message } => {
                self.notices
                    .push(Notice::error("Couldn't start run", message.clone()));
                self.clear();
                Ok(())
            }
            RunEvent::Finished | RunEvent::Stopped => {
                self.clear();
                Ok(())
            }
        }
    }

    fn apply_active(&mut self, event: &RunEvent) -> Result<(), ProtocolError> {
        match event {
            RunEvent::Started { run } => self.check_same_run(run),
            RunEvent::Progress { .. } => {
                self.show(event);
                Ok(())
            }
            RunEvent::Finished | RunEvent::Stopped => {
                self.clear();
                Ok(())
            }
            RunEvent::Error { message } => {
                self.notices.push(Notice::error("Run failed", message.clone()));
                self.clear();
                Ok(())
            }
            RunEvent::Rejected { .. } => Err(self.rejected_after_start()),
        }
    }

    fn apply_terminating(&mut self, event: &RunEvent) -> Result<(), ProtocolError> {
        match event {
            RunEvent::Started { run } => self.check_same_run(run),
            // Cancellation is cooperative; progress may still trickle in.
            RunEvent::Progress { .. } => {
                self.show(event);
                Ok(())
            }
            RunEvent::Rejected { .. } => Err(self.rejected_after_start()),
            RunEvent::Finished | RunEvent::Stopped | RunEvent::Error { .. } => {
                if let RunEvent::Error { message } = event {
                    self.notices.push(Notice::error("Run failed", message.clone()));
                }
                self.view = progress::reduce(self.view, event);
                self.ended = Some(event.clone());
                // The stop acknowledgement clears running state, unless the stop timed out.
                if self.stop_timed_out {
                    tracing::debug!(event = event.tag(), "run ended after stop timed out");
                    self.clear();
                }
                Ok(())
            }
        }
    }

    /// `Active -> Terminating`. Returns false when there is nothing to stop.
    pub fn begin_stop(&mut self) -> bool {
        match self.phase {
            RunPhase::Active | RunPhase::Requesting => {
                self.phase = RunPhase::Terminating;
                true
            }
            RunPhase::Idle | RunPhase::Terminating => false,
        }
    }

    /// `Terminating -> Idle` once the runner acknowledged the stop.
    pub fn finish_stop(&mut self, ack: StopAck) {
        if let StopAck::Stopped(run) = ack {
            if self.running.is_some_and(|r| r.id != run.id) {
                tracing::debug!(stopped = %run, "stop acknowledged for another run");
            }
        }
        if self.phase == RunPhase::Terminating || self.phase == RunPhase::Active {
            self.clear();
        }
    }

    /// The stop request failed. A timeout leaves the session `Terminating` until the
    /// run's terminal event arrives or a resync finds the registry empty.
    pub fn stop_failed(&mut self, err: &StopError) {
        match err {
            StopError::TimedOut(_) => {
                self.notices
                    .push(Notice::warning("Still stopping", err.to_string()));
                if self.phase == RunPhase::Terminating {
                    if self.ended.is_some() {
                        self.clear();
                    } else {
                        self.stop_timed_out = true;
                    }
                }
            }
            StopError::ControllerGone => {
                self.notices
                    .push(Notice::error("Couldn't stop run", err.to_string()));
                self.clear();
            }
        }
    }

    /// Adopt the registry's view after a remount.
    pub fn resync(&mut self, current: Option<RunDescriptor>) {
        match current.filter(|run| run.category == self.category) {
            Some(run) => {
                tracing::debug!(run = %run, "resynchronized with active run");
                self.phase = RunPhase::Active;
                self.running = Some(run);
                self.requested = None;
                if !self.view.is_visible() {
                    self.view = ProgressView::Indeterminate;
                }
            }
            None => self.clear(),
        }
    }

    /// Terminal event observed while stopping, if any.
    pub fn ended_with(&self) -> Option<&RunEvent> {
        self.ended.as_ref()
    }

    fn show(&mut self, event: &RunEvent) {
        self.view = progress::reduce(self.view, event);
        if let Some(p) = self.view.percent() {
            self.last_ratio = Some(p);
        }
    }

    fn check_same_run(&self, run: &RunDescriptor) -> Result<(), ProtocolError> {
        match self.running {
            Some(active) if active.id != run.id => Err(ProtocolError::ConflictingStart {
                active,
                started: *run,
            }),
            _ => Ok(()),
        }
    }

    fn rejected_after_start(&self) -> ProtocolError {
        ProtocolError::RejectedAfterStart {
            run: self
                .running
                .unwrap_or(RunDescriptor::new(0, self.category)),
        }
    }

    fn clear(&mut self) {
        self.phase = RunPhase::Idle;
        self.stop_timed_out = false;
        self.requested = None;
        self.running = None;
        self.view = ProgressView::Hidden;
    }
}
