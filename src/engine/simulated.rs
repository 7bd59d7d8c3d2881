//! Stepped stand-in for training, cleaning and text-normalization work.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{check_dataset, Job, JobContext};
use crate::model::{DatasetSummary, Rejection, RunDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedJobConfig {
    /// Number of progress steps; zero makes the job all-or-nothing.
    pub steps: u64,
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Fail with an error once this step is reached.
    pub fail_at: Option<u64>,
    pub dataset: DatasetSummary,
}

impl Default for SimulatedJobConfig {
    fn default() -> Self {
        Self {
            steps: 100,
            tick: Duration::from_millis(100),
            fail_at: None,
            dataset: DatasetSummary {
                speakers: 2,
                samples: 100,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedJob {
    cfg: SimulatedJobConfig,
}

impl SimulatedJob {
    pub fn new(cfg: SimulatedJobConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Job for SimulatedJob {
    fn preflight(&self, run: &RunDescriptor) -> Result<(), Rejection> {
        check_dataset(run.category, &self.cfg.dataset)
    }

    async fn execute(&self, mut ctx: JobContext) -> Result<()> {
        let total = self.cfg.steps;
        if total == 0 {
            // All-or-nothing: a single tick and no progress stream.
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.cfg.tick) => {}
            }
            return Ok(());
        }

        ctx.progress.report(0, total);
        for step in 1..=total {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    tracing::debug!(run = %ctx.run, step, "cancelled between steps");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.cfg.tick) => {}
            }
            if self.cfg.fail_at == Some(step) {
                bail!("simulated failure at step {step}/{total}");
            }
            ctx.progress.report(step, total);
        }
        Ok(())
    }
}
