//! Step output fragments and the streaming wire events they become.

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Outcome of one action, as reported on the fragment channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    /// Action ran to completion.
    Completed,
    /// Action ran and failed.
    Failed(String),
    /// Action was refused because the session reached its action cap.
    Refused,
}

/// Incremental output pushed by a running step (internal taxonomy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFragment {
    /// A piece of assistant text (`text-delta`).
    TextDelta(String),
    /// Informational note (`progress-note`).
    ProgressNote(String),
    /// An action is about to run (`tool-start`).
    ToolStart {
        /// Action name.
        name: String,
        /// Action call identifier.
        call_id: String,
    },
    /// An action finished or was skipped (`tool-end`).
    ToolEnd {
        /// Action name.
        name: String,
        /// Action call identifier.
        call_id: String,
        /// How it ended.
        status: ActionStatus,
    },
}

/// Structured failure description sent to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Stable classification (e.g. `StepTimeout`).
    pub error_type: String,
    /// Human-readable message.
    pub error_message: String,
    /// Session the failure belongs to.
    pub session_id: String,
}

impl ErrorDetail {
    /// Describe `err` for the given session.
    #[must_use]
    pub fn from_error(err: &AppError, session_id: &str) -> Self {
        Self {
            error_type: err.error_type().to_owned(),
            error_message: err.message(),
            session_id: session_id.to_owned(),
        }
    }
}

/// External streaming event, serialized as one JSON object per event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Incremental assistant text.
    Delta {
        /// Text chunk.
        text: String,
    },
    /// Informational progress message.
    Progress {
        /// Progress text.
        message: String,
    },
    /// Complete reply; always the last event of a successful step.
    Final {
        /// Full reply text.
        text: String,
    },
    /// Terminal failure; mutually exclusive with `final`.
    Error {
        /// Failure description.
        detail: ErrorDetail,
    },
}

impl StreamEvent {
    /// Translate an internal fragment into its wire form.
    #[must_use]
    pub fn from_fragment(fragment: StepFragment) -> Self {
        match fragment {
            StepFragment::TextDelta(text) => Self::Delta { text },
            StepFragment::ProgressNote(message) => Self::Progress { message },
            StepFragment::ToolStart { name, .. } => Self::Progress {
                message: format!("Running {name}..."),
            },
            StepFragment::ToolEnd { name, status, .. } => Self::Progress {
                message: match status {
                    ActionStatus::Completed => format!("Finished {name}"),
                    ActionStatus::Failed(reason) => format!("{name} failed: {reason}"),
                    ActionStatus::Refused => format!("Skipped {name}: action limit reached"),
                },
            },
        }
    }

    /// Terminal error event for `err`.
    #[must_use]
    pub fn error(err: &AppError, session_id: &str) -> Self {
        Self::Error {
            detail: ErrorDetail::from_error(err, session_id),
        }
    }

    /// Whether this event ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }

    /// Render as a single JSON line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if serialization fails.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
