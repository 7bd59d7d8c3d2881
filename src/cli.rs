use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::Settings;
use crate::console::{self, ConsoleOptions, RunOutcome};
use crate::engine::{FolderImportJob, JobCatalog, SimulatedJob};
use crate::model::{RunCategory, RunDescriptor, RunId};
use crate::orchestrator;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "jobctl",
    version,
    about = "Start, watch and stop single-flight background runs"
)]
pub struct Cli {
    /// Settings file (defaults to <config dir>/jobctl/settings.json when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print run events as JSON lines instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Log filter, e.g. "info" or "jobctl=debug" (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Request a stop after this long (e.g. "2s")
    #[arg(long, global = true)]
    pub stop_after: Option<humantime::Duration>,

    /// Give up waiting for a stop acknowledgement after this long
    #[arg(long, global = true)]
    pub stop_timeout: Option<humantime::Duration>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a training, cleaning or text-normalization job
    Run(RunArgs),
    /// Import speaker folders
    Import(ImportArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CategoryArg {
    Training,
    Cleaning,
    TextNormalization,
}

impl From<CategoryArg> for RunCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Training => RunCategory::TrainingRun,
            CategoryArg::Cleaning => RunCategory::CleaningRun,
            CategoryArg::TextNormalization => RunCategory::TextNormalizationRun,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    #[arg(long, value_enum)]
    pub category: CategoryArg,

    /// Run id (random when omitted)
    #[arg(long)]
    pub id: Option<u64>,

    /// Speakers in the dataset
    #[arg(long)]
    pub speakers: Option<u32>,

    /// Samples in the dataset
    #[arg(long)]
    pub samples: Option<u64>,

    /// Number of progress steps (0 = no progress reporting)
    #[arg(long)]
    pub steps: Option<u64>,

    /// Delay between steps
    #[arg(long)]
    pub tick: Option<humantime::Duration>,

    /// Fail once this step is reached
    #[arg(long)]
    pub fail_at: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct ImportArgs {
    /// Folder to import (repeatable)
    #[arg(long = "folder", required = true)]
    pub folders: Vec<PathBuf>,

    /// Run id (random when omitted)
    #[arg(long)]
    pub id: Option<u64>,
}

/// Apply global flag overrides on top of the loaded settings.
pub fn apply_overrides(args: &Cli, settings: &mut Settings) {
    if let Some(filter) = &args.log_filter {
        settings.log_filter = filter.clone();
    }
    if let Some(t) = args.stop_timeout {
        settings.stop_timeout = Some(t.into());
    }
    if let Command::Run(run) = &args.command {
        if let Some(steps) = run.steps {
            settings.steps = steps;
        }
        if let Some(tick) = run.tick {
            settings.tick = tick.into();
        }
        if let Some(speakers) = run.speakers {
            settings.dataset.speakers = speakers;
        }
        if let Some(samples) = run.samples {
            settings.dataset.samples = samples;
        }
    }
}

/// Build the job catalog and the descriptor for the requested command.
pub fn build_run(args: &Cli, settings: &Settings) -> (JobCatalog, RunDescriptor) {
    match &args.command {
        Command::Run(run) => {
            let category = RunCategory::from(run.category);
            let mut job = settings.job_config();
            job.fail_at = run.fail_at;
            let catalog = JobCatalog::new().with(category, SimulatedJob::new(job));
            (catalog, descriptor(run.id, category))
        }
        Command::Import(import) => {
            let catalog = JobCatalog::new().with(
                RunCategory::BulkImport,
                FolderImportJob::new(import.folders.clone()),
            );
            (catalog, descriptor(import.id, RunCategory::BulkImport))
        }
    }
}

fn descriptor(id: Option<u64>, category: RunCategory) -> RunDescriptor {
    RunDescriptor {
        id: id.map(RunId).unwrap_or_else(RunId::random),
        category,
    }
}

pub async fn run(args: Cli, settings: Settings) -> Result<RunOutcome> {
    let (catalog, descriptor) = build_run(&args, &settings);
    tracing::debug!(dataset = ?settings.dataset, "starting {descriptor}");

    let (client, controller) = orchestrator::launch(catalog, settings.controller_options());
    let opts = ConsoleOptions {
        json: args.json,
        stop_after: args.stop_after.map(Duration::from),
    };
    let outcome = console::watch_run(&client, descriptor, opts).await;

    client.shutdown();
    controller
        .await
        .context("run controller task failed")??;
    outcome
}
