//! Caller-side reduction of run events into a displayable progress indicator.

use crate::model::RunEvent;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ProgressView {
    /// No indicator shown.
    #[default]
    Hidden,
    /// Work is in progress but there is no meaningful ratio (total unknown or zero).
    Indeterminate,
    /// Percentage in `0.0..=100.0`.
    Ratio(f64),
}

impl ProgressView {
    pub fn percent(&self) -> Option<f64> {
        match self {
            ProgressView::Ratio(p) => Some(*p),
            ProgressView::Hidden | ProgressView::Indeterminate => None,
        }
    }

    pub fn is_visible(&self) -> bool {
        !matches!(self, ProgressView::Hidden)
    }

    /// Short text rendering for CLI output.
    pub fn label(&self) -> String {
        match self {
            ProgressView::Hidden => String::new(),
            ProgressView::Indeterminate => "in progress".to_string(),
            ProgressView::Ratio(p) => format!("{p:.0}%"),
        }
    }
}

/// Fold one event into the prior view.
///
/// Streams without any `Progress` are fine: the view stays indeterminate until the
/// terminal event hides it.
pub fn reduce(prior: ProgressView, event: &RunEvent) -> ProgressView {
    match event {
        RunEvent::Started { .. } => ProgressView::Indeterminate,
        RunEvent::Progress { total: 0, .. } => ProgressView::Indeterminate,
        RunEvent::Progress { current, total } => {
            let clamped = (*current).min(*total);
            ProgressView::Ratio(clamped as f64 * 100.0 / *total as f64)
        }
        RunEvent::Finished
        | RunEvent::Error { .. }
        | RunEvent::Stopped
        | RunEvent::Rejected { .. } => ProgressView::Hidden,
    }
}
