//! Job runners: the long-running work behind each run category.
//!
//! The orchestrator treats a job as opaque. It asks for domain preconditions before
//! admission, then drives `execute` with a progress emitter and a cancellation token.

mod folder_import;
mod simulated;

pub use folder_import::FolderImportJob;
pub use simulated::{SimulatedJob, SimulatedJobConfig};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::channel::EventBus;
use crate::model::{DatasetSummary, Rejection, RunCategory, RunDescriptor, RunEvent};

#[async_trait]
pub trait Job: Send + Sync {
    /// Domain checks made before the run is admitted. A rejection never touches the registry.
    fn preflight(&self, _run: &RunDescriptor) -> Result<(), Rejection> {
        Ok(())
    }

    /// Do the work. Cancellation is cooperative: return as soon as `ctx.cancel` fires.
    async fn execute(&self, ctx: JobContext) -> Result<()>;
}

/// Everything a running job gets from the orchestrator.
pub struct JobContext {
    pub run: RunDescriptor,
    pub progress: ProgressEmitter,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Publishes `progress` events for one run attempt.
///
/// Within a fixed `total`, `current` never goes backwards; a report with a smaller
/// `current` is dropped. A different `total` re-baselines the stream.
pub struct ProgressEmitter {
    bus: EventBus,
    channel: &'static str,
    last: Option<(u64, u64)>,
    undelivered_logged: bool,
}

impl ProgressEmitter {
    pub fn new(bus: EventBus, channel: &'static str) -> Self {
        Self {
            bus,
            channel,
            last: None,
            undelivered_logged: false,
        }
    }

    /// Returns whether the report was emitted.
    pub fn report(&mut self, current: u64, total: u64) -> bool {
        if let Some((last_current, last_total)) = self.last {
            if last_total == total && current < last_current {
                tracing::debug!(
                    channel = self.channel,
                    current,
                    last_current,
                    "dropping regressing progress report"
                );
                return false;
            }
        }
        self.last = Some((current, total));
        if let Err(e) = self.bus.publish(self.channel, RunEvent::Progress { current, total }) {
            if !self.undelivered_logged {
                tracing::warn!(error = %e, "progress not delivered, nobody is listening");
                self.undelivered_logged = true;
            }
        }
        true
    }
}

/// Maps each run category to the job that serves it.
#[derive(Clone, Default)]
pub struct JobCatalog {
    jobs: HashMap<RunCategory, Arc<dyn Job>>,
}

impl JobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, category: RunCategory, job: impl Job + 'static) -> Self {
        self.jobs.insert(category, Arc::new(job));
        self
    }

    pub fn get(&self, category: RunCategory) -> Option<Arc<dyn Job>> {
        self.jobs.get(&category).cloned()
    }
}

impl fmt::Debug for JobCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.jobs.keys()).finish()
    }
}

/// Dataset requirements per category.
///
/// Noisy-sample detection and training both compare speakers, so they need two.
/// Every dataset-backed run needs at least one sample.
pub fn check_dataset(category: RunCategory, dataset: &DatasetSummary) -> Result<(), Rejection> {
    match category {
        RunCategory::TrainingRun | RunCategory::CleaningRun => {
            if dataset.speakers < 2 {
                return Err(Rejection::NotEnoughSpeakers);
            }
            if dataset.samples == 0 {
                return Err(Rejection::NotEnoughSamples);
            }
        }
        RunCategory::TextNormalizationRun => {
            if dataset.samples == 0 {
                return Err(Rejection::NotEnoughSamples);
            }
        }
        RunCategory::BulkImport => {}
    }
    Ok(())
}
