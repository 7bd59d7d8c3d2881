use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

use crate::error::ProtocolError;

/// Opaque identifier of one addressable unit of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl RunId {
    /// Generate a random id for runs started without an explicit one.
    pub fn random() -> Self {
        RunId(u64::from(rand::random::<u32>()))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunCategory {
    TrainingRun,
    CleaningRun,
    TextNormalizationRun,
    BulkImport,
}

impl RunCategory {
    pub const ALL: [RunCategory; 4] = [
        RunCategory::TrainingRun,
        RunCategory::CleaningRun,
        RunCategory::TextNormalizationRun,
        RunCategory::BulkImport,
    ];

    /// Static channel names used by this category.
    pub fn binding(self) -> ChannelBinding {
        match self {
            RunCategory::TrainingRun => ChannelBinding {
                request: "continue-training-run",
                reply: "training-run-reply",
                progress: None,
            },
            RunCategory::CleaningRun => ChannelBinding {
                request: "continue-cleaning-run",
                reply: "cleaning-run-reply",
                progress: None,
            },
            RunCategory::TextNormalizationRun => ChannelBinding {
                request: "continue-text-normalization-run",
                reply: "text-normalization-run-reply",
                progress: None,
            },
            RunCategory::BulkImport => ChannelBinding {
                request: "import-folders",
                reply: "import-folders-reply",
                progress: Some("import-folders-progress-reply"),
            },
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RunCategory::TrainingRun => "training run",
            RunCategory::CleaningRun => "cleaning run",
            RunCategory::TextNormalizationRun => "text normalization run",
            RunCategory::BulkImport => "folder import",
        }
    }
}

impl fmt::Display for RunCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifies one run attempt. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub id: RunId,
    pub category: RunCategory,
}

impl RunDescriptor {
    pub fn new(id: u64, category: RunCategory) -> Self {
        Self {
            id: RunId(id),
            category,
        }
    }
}

impl fmt::Display for RunDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.category, self.id)
    }
}

/// Channel names owned by one run category. Known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub request: &'static str,
    pub reply: &'static str,
    pub progress: Option<&'static str>,
}

impl ChannelBinding {
    /// Channel that carries `progress` events for this binding.
    pub fn progress_channel(&self) -> &'static str {
        self.progress.unwrap_or(self.reply)
    }
}

/// The run held by the registry together with its admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveRun {
    pub descriptor: RunDescriptor,
    pub admitted_at: OffsetDateTime,
}

impl ActiveRun {
    /// Time since admission, whole seconds. Zero if the clock went backwards.
    pub fn running_for(&self, now: OffsetDateTime) -> std::time::Duration {
        let elapsed = std::time::Duration::try_from(now - self.admitted_at).unwrap_or_default();
        std::time::Duration::from_secs(elapsed.as_secs())
    }
}

/// Input the domain preconditions are checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSummary {
    pub speakers: u32,
    pub samples: u64,
}

/// Reasons a run attempt is refused before it ever starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Rejection {
    AlreadyRunning { active: RunDescriptor },
    NotEnoughSpeakers,
    NotEnoughSamples,
}

impl Rejection {
    pub fn title(&self) -> &'static str {
        match self {
            Rejection::AlreadyRunning { .. } => "Another run is active",
            Rejection::NotEnoughSpeakers | Rejection::NotEnoughSamples => "Couldn't start run",
        }
    }

    /// Render a human-readable reason for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            Rejection::AlreadyRunning { active } => format!(
                "{active} is currently active, please stop it before starting this one."
            ),
            Rejection::NotEnoughSpeakers => "The dataset of this run contains only one speaker, \
                 but at least two speakers are required."
                .to_string(),
            Rejection::NotEnoughSamples => "The dataset of this run contains no samples. \
                 Attach samples to its speakers and try again."
                .to_string(),
        }
    }
}

/// Lifecycle events for one run attempt, as delivered on reply/progress channels.
///
/// Per attempt: one `Rejected` or one `Started`, then zero or more `Progress`,
/// then exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    Started { run: RunDescriptor },
    Progress { current: u64, total: u64 },
    Finished,
    Error { message: String },
    Stopped,
    Rejected { reason: Rejection },
}

impl RunEvent {
    /// True for events after which nothing else is delivered for the attempt.
    pub fn is_terminal(&self) -> bool {
        match self {
            RunEvent::Finished
            | RunEvent::Error { .. }
            | RunEvent::Stopped
            | RunEvent::Rejected { .. } => true,
            RunEvent::Started { .. } | RunEvent::Progress { .. } => false,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            RunEvent::Started { .. } => "started",
            RunEvent::Progress { .. } => "progress",
            RunEvent::Finished => "finished",
            RunEvent::Error { .. } => "error",
            RunEvent::Stopped => "stopped",
            RunEvent::Rejected { .. } => "rejected",
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a wire message. Unknown tags are a protocol violation, never ignored.
    pub fn decode(raw: &str) -> Result<RunEvent, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProtocolError::Malformed("missing \"type\" tag".into()))?
            .to_string();
        if !KNOWN_TAGS.contains(&tag.as_str()) {
            return Err(ProtocolError::UnknownTag(tag));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

const KNOWN_TAGS: [&str; 6] = [
    "started", "progress", "finished", "error", "stopped", "rejected",
];

/// Acknowledgement returned for a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAck {
    /// Nothing was running.
    Idle,
    /// The given run reached its terminal state and the registry slot is free.
    Stopped(RunDescriptor),
}
