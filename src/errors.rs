//! Error types shared across the runtime.

use std::fmt::{Display, Formatter};

/// Shared runtime result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Runtime error enumeration covering all session failure modes.
///
/// Only [`AppError::StepExecution`], [`AppError::StepTimeout`] and
/// [`AppError::Cancelled`] are surfaced to callers as hard failures; the
/// remaining variants are recovered locally by the component that raised
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Checkpoint file could not be written or read.
    Store(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Context summarization failed; history is left untouched.
    Summarization(String),
    /// The caller's deadline elapsed before the step finished.
    StepTimeout {
        /// Session whose step is still running.
        session_id: String,
        /// Deadline that elapsed, in seconds.
        seconds: u64,
    },
    /// The agent step itself faulted.
    StepExecution {
        /// Short classification of the fault (e.g. `ModelError`).
        error_type: String,
        /// Human-readable fault description.
        message: String,
    },
    /// Streaming producer gave up because the consumer stopped reading.
    Cancelled(String),
}

impl AppError {
    /// Build a [`AppError::StepExecution`] from a type label and message.
    #[must_use]
    pub fn step(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Stable classification string used in the wire `error_type` field.
    #[must_use]
    pub fn error_type(&self) -> &str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Store(_) => "TransientStoreError",
            Self::Io(_) => "IoError",
            Self::NotFound(_) => "NotFound",
            Self::Summarization(_) => "SummarizationFailure",
            Self::StepTimeout { .. } => "StepTimeout",
            Self::StepExecution { error_type, .. } => error_type,
            Self::Cancelled(_) => "Cancelled",
        }
    }

    /// Message part of the error without the classification prefix.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Config(msg)
            | Self::Store(msg)
            | Self::Io(msg)
            | Self::NotFound(msg)
            | Self::Summarization(msg)
            | Self::Cancelled(msg) => msg.clone(),
            Self::StepTimeout {
                session_id,
                seconds,
            } => format!("step for session {session_id} timed out after {seconds}s"),
            Self::StepExecution { message, .. } => message.clone(),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Summarization(msg) => write!(f, "summarization: {msg}"),
            Self::StepTimeout {
                session_id,
                seconds,
            } => write!(
                f,
                "step timeout: session {session_id} did not finish within {seconds}s"
            ),
            Self::StepExecution {
                error_type,
                message,
            } => write!(f, "step execution: {error_type}: {message}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("serialization failed: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
