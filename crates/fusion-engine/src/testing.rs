//! In-process `RemoteApi` with per-prompt scripted outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use fusion_contracts::{
    Availability, FusionError, GenerationRequest, PollSettings, RemotePipeline, Result,
};
use serde_json::{json, Map};

use crate::client::{JobHandle, RemoteApi, RemoteStatus};

#[derive(Debug, Clone)]
pub enum Step {
    Pending,
    Done(Vec<String>),
    Censored(Vec<String>),
    Fail(String),
    HttpError(u16),
    Transport,
    /// Stalls the status call before answering `Pending`.
    Slow(Duration),
}

pub fn fast_settings(max_attempts: u32) -> PollSettings {
    PollSettings {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        jitter: Duration::ZERO,
    }
}

/// Jobs are keyed by prompt; an exhausted script answers `Pending`.
#[derive(Default)]
pub struct ScriptedApi {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    status_calls: Mutex<HashMap<String, usize>>,
    submissions: AtomicUsize,
    disabled: bool,
    availability_error: Option<u16>,
    reject_submit: Option<u16>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, prompt: &str, steps: Vec<Step>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(prompt.to_string(), steps.into());
        }
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn availability_error(mut self, status: u16) -> Self {
        self.availability_error = Some(status);
        self
    }

    pub fn reject_submit(mut self, status: u16) -> Self {
        self.reject_submit = Some(status);
        self
    }

    pub fn status_calls(&self, prompt: &str) -> usize {
        self.status_calls
            .lock()
            .map(|calls| calls.get(prompt).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

impl RemoteApi for ScriptedApi {
    fn list_pipelines(&self) -> Result<Vec<RemotePipeline>> {
        Ok(vec![RemotePipeline {
            id: "p-1".to_string(),
            name: "Scripted".to_string(),
        }])
    }

    fn check_availability(&self, _pipeline_id: &str) -> Result<Availability> {
        if let Some(status) = self.availability_error {
            return Err(FusionError::http_status(status, "availability check failed"));
        }
        let status = if self.disabled {
            "DISABLED_BY_QUEUE"
        } else {
            "ACTIVE"
        };
        let mut map = Map::new();
        map.insert("pipeline_status".to_string(), json!(status));
        Ok(Availability(map))
    }

    fn submit(&self, request: &GenerationRequest) -> Result<JobHandle> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.reject_submit {
            return Err(FusionError::http_status(status, "rejected"));
        }
        Ok(JobHandle {
            uuid: request.prompt.clone(),
        })
    }

    fn fetch_status(&self, job: &JobHandle) -> Result<RemoteStatus> {
        if let Ok(mut calls) = self.status_calls.lock() {
            *calls.entry(job.uuid.clone()).or_insert(0) += 1;
        }
        let step = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.get_mut(&job.uuid).and_then(VecDeque::pop_front))
            .unwrap_or(Step::Pending);
        match step {
            Step::Pending => Ok(RemoteStatus::Pending),
            Step::Done(files) => Ok(RemoteStatus::Done {
                files,
                censored: false,
            }),
            Step::Censored(files) => Ok(RemoteStatus::Done {
                files,
                censored: true,
            }),
            Step::Fail(description) => Ok(RemoteStatus::Failed { description }),
            Step::HttpError(status) => Err(FusionError::http_status(status, "scripted")),
            Step::Transport => Err(FusionError::network("connection reset")),
            Step::Slow(delay) => {
                std::thread::sleep(delay);
                Ok(RemoteStatus::Pending)
            }
        }
    }
}

/// A tiny valid PNG, base64 encoded.
pub fn png_base64() -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    BASE64.encode(png_bytes())
}

pub fn png_bytes() -> Vec<u8> {
    let image = image::RgbImage::from_pixel(2, 2, image::Rgb([200, 40, 40]));
    let mut out = std::io::Cursor::new(Vec::new());
    let _ = image::DynamicImage::ImageRgb8(image).write_to(&mut out, image::ImageFormat::Png);
    out.into_inner()
}
