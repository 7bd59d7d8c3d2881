//! Error taxonomy for the run orchestration core.
//!
//! Recoverable run-level failures are plain data (`RunEvent`s, `Rejection`s) and never
//! cross the channel boundary as errors. The types here cover the local API surface.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::{RunCategory, RunDescriptor};

/// Admission refused by the run registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("{active} is already running")]
    AlreadyRunning { active: RunDescriptor },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Nobody is subscribed to the channel; the event was dropped.
    #[error("no listener on channel '{channel}'")]
    NoListener { channel: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("{active} is already running, stop it before starting another run")]
    AlreadyRunning { active: RunDescriptor },
    #[error("no live subscription for {category}; subscribe before starting the run")]
    NotSubscribed { category: RunCategory },
    #[error("run controller is not running")]
    ControllerGone,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopError {
    #[error("stop was not acknowledged within {}", humantime::format_duration(*.0))]
    TimedOut(Duration),
    #[error("run controller is not running")]
    ControllerGone,
}

/// Drift between the two sides of the run protocol. Fatal for the code path that sees it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown run event tag '{0}'")]
    UnknownTag(String),
    #[error("malformed run event: {0}")]
    Malformed(String),
    #[error("progress received before the run started")]
    ProgressBeforeStart,
    #[error("rejection received after {run} already started")]
    RejectedAfterStart { run: RunDescriptor },
    #[error("{started} started while {active} is active")]
    ConflictingStart {
        active: RunDescriptor,
        started: RunDescriptor,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
