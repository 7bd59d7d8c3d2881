//! Single-flight guard for background runs.
//!
//! Holds at most one active run process-wide. Admission and release are the only
//! writers; every read is an advisory snapshot.

use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::error::AdmissionError;
use crate::model::{ActiveRun, RunDescriptor};

#[derive(Debug, Default)]
pub struct RunRegistry {
    slot: Mutex<Option<ActiveRun>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `run` if the slot is empty. The check and the write happen under one lock,
    /// so racing admissions cannot both succeed.
    pub fn try_admit(&self, run: RunDescriptor) -> Result<ActiveRun, AdmissionError> {
        let mut slot = self.slot.lock();
        if let Some(active) = slot.as_ref() {
            return Err(AdmissionError::AlreadyRunning {
                active: active.descriptor,
            });
        }
        let admitted = ActiveRun {
            descriptor: run,
            admitted_at: OffsetDateTime::now_utc(),
        };
        *slot = Some(admitted);
        tracing::info!(run = %run, "run admitted");
        Ok(admitted)
    }

    /// Clear the slot if it holds a run with the same id. Returns whether it did.
    ///
    /// A stale release (the slot already moved on to another run) is a no-op.
    pub fn release(&self, run: &RunDescriptor) -> bool {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(active) if active.descriptor.id == run.id => {
                *slot = None;
                tracing::info!(run = %run, "run released");
                true
            }
            Some(active) => {
                tracing::debug!(run = %run, active = %active.descriptor, "ignoring stale release");
                false
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<RunDescriptor> {
        let slot = *self.slot.lock();
        slot.map(|a| a.descriptor)
    }

    pub fn current_run(&self) -> Option<ActiveRun> {
        *self.slot.lock()
    }
}
