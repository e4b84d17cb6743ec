use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, FusionError};
use crate::request::GenerationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Submitting,
    Polling,
    Done,
    Failed,
    TimedOut,
    Unavailable,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Submitting | Self::Polling)
    }

    pub fn is_failure(&self) -> bool {
        self.is_terminal() && *self != Self::Done
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Submitting => "SUBMITTING",
            Self::Polling => "POLLING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Unavailable => "UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FusionError> for TaskError {
    fn from(err: &FusionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.user_message(),
        }
    }
}

/// One produced image. `path` is where it was persisted; `error` is set
/// instead when that single image could not be saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub index: usize,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

impl ImageRef {
    pub fn saved(index: usize, path: PathBuf) -> Self {
        Self {
            index,
            path: Some(path),
            error: None,
        }
    }

    pub fn failed(index: usize, error: impl Into<String>) -> Self {
        Self {
            index,
            path: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request: GenerationRequest,
    pub job_id: Option<String>,
    #[serde(default)]
    pub censored: bool,
    pub error: Option<TaskError>,
    pub result: Option<Vec<ImageRef>>,
}

impl Task {
    pub fn new(id: impl Into<String>, request: GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: TaskStatus::Created,
            progress: 0,
            created_at: now,
            updated_at: now,
            request,
            job_id: None,
            censored: false,
            error: None,
            result: None,
        }
    }

    /// Merges a patch. Progress never moves backwards, DONE drops any
    /// error, and a failure state drops any result.
    pub fn apply(&mut self, patch: TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = self.progress.max(progress.min(100));
        }
        if let Some(job_id) = patch.job_id {
            self.job_id = Some(job_id);
        }
        if let Some(censored) = patch.censored {
            self.censored = censored;
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        if let Some(result) = patch.result {
            self.result = Some(result);
        }

        if self.status == TaskStatus::Done {
            self.error = None;
        } else {
            self.result = None;
        }
        self.updated_at = Utc::now();
    }

    pub fn image(&self, index: usize) -> Option<&ImageRef> {
        self.result
            .as_ref()
            .and_then(|images| images.iter().find(|image| image.index == index))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub job_id: Option<String>,
    pub censored: Option<bool>,
    pub error: Option<TaskError>,
    pub result: Option<Vec<ImageRef>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus, progress: u8) -> Self {
        Self {
            status: Some(status),
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn failed(status: TaskStatus, err: &FusionError) -> Self {
        Self {
            status: Some(status),
            error: Some(TaskError::from(err)),
            ..Self::default()
        }
    }

    pub fn done(result: Vec<ImageRef>) -> Self {
        Self {
            status: Some(TaskStatus::Done),
            progress: Some(100),
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_censored(mut self, censored: bool) -> Self {
        self.censored = Some(censored);
        self
    }
}
