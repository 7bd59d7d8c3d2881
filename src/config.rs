//! On-disk settings.
//!
//! Every field has a default, so a missing file or a partial file is fine. Command-line
//! flags override individual fields after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::SimulatedJobConfig;
use crate::error::ConfigError;
use crate::model::DatasetSummary;
use crate::orchestrator::ControllerOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Delay between simulated job steps.
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    pub steps: u64,
    /// Warn when a stopping job takes longer than this.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Stop acknowledgement deadline. Unset waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Option<Duration>,
    pub dataset: DatasetSummary,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        let job = SimulatedJobConfig::default();
        Self {
            tick: job.tick,
            steps: job.steps,
            stop_grace: ControllerOptions::default().stop_grace,
            stop_timeout: None,
            dataset: job.dataset,
            log_filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// `<config_dir>/jobctl/settings.json`, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("jobctl").join("settings.json"))
    }

    /// Load from `path`, or from the default location when `path` is `None`.
    ///
    /// An explicit path must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        match path {
            Some(p) => Self::read(p),
            None => match Self::default_path() {
                Some(p) if p.is_file() => Self::read(&p),
                _ => Ok(Settings::default()),
            },
        }
    }

    fn read(path: &Path) -> Result<Settings, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            stop_grace: self.stop_grace,
            stop_timeout: self.stop_timeout,
        }
    }

    pub fn job_config(&self) -> SimulatedJobConfig {
        SimulatedJobConfig {
            steps: self.steps,
            tick: self.tick,
            fail_at: None,
            dataset: self.dataset,
        }
    }
}
