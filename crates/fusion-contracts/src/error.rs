use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FusionError>;

/// Every failure the client can report, tagged so callers can decide
/// retry-ability without inspecting message text.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{}", network_message(.status, .message))]
    Network {
        status: Option<u16>,
        message: String,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("generation failed: {0}")]
    RemoteFailure(String),

    #[error("generation did not complete after {attempts} status checks")]
    Timeout { attempts: u32 },

    #[error("unrecognized image payload: {0}")]
    Format(String),

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("generation finished without producing any files")]
    NoFiles,

    #[error("pipeline unavailable: {0}")]
    Unavailable(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("task '{0}' not found")]
    NotFound(String),

    #[error("task '{0}' already exists")]
    DuplicateTask(String),

    #[error("image file is gone: {}", .0.display())]
    ImageMissing(PathBuf),
}

fn network_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("network error ({code}): {message}"),
        None => format!("network error: {message}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Network,
    Validation,
    RemoteFailure,
    Timeout,
    Format,
    Io,
    NoFiles,
    Unavailable,
    Cancelled,
    NotFound,
    DuplicateTask,
    ImageMissing,
}

impl FusionError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            status: None,
            message: message.into(),
        }
    }

    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::Network {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Network { .. } => ErrorKind::Network,
            Self::Validation(_) => ErrorKind::Validation,
            Self::RemoteFailure(_) => ErrorKind::RemoteFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Format(_) => ErrorKind::Format,
            Self::Io { .. } => ErrorKind::Io,
            Self::NoFiles => ErrorKind::NoFiles,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateTask(_) => ErrorKind::DuplicateTask,
            Self::ImageMissing(_) => ErrorKind::ImageMissing,
        }
    }

    /// Transport failures, 5xx and 429 may succeed if tried again.
    /// Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { status: None, .. } => true,
            Self::Network {
                status: Some(code), ..
            } => *code >= 500 || *code == 429,
            _ => false,
        }
    }

    /// Text surfaced to users. Remote failure descriptions are passed
    /// through untouched.
    pub fn user_message(&self) -> String {
        match self {
            Self::RemoteFailure(description) => description.clone(),
            Self::Unavailable(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}
