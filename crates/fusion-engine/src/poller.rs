use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use fusion_contracts::{FusionError, GenerationRequest, PollSettings, TaskStatus};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::client::{JobHandle, RemoteApi, RemoteStatus};

pub const PROGRESS_SUBMITTING: u8 = 5;
pub const PROGRESS_ACCEPTED: u8 = 10;
pub const PROGRESS_FIRST_POLL: u8 = 30;
pub const PROGRESS_POLL_CEILING: u8 = 90;
pub const PROGRESS_SAVING: u8 = 95;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Exponential backoff between status checks, capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &PollSettings) -> Self {
        Self {
            initial: settings.initial_delay,
            max: settings.max_delay,
            jitter: settings.jitter,
        }
    }

    pub fn first_delay(&self) -> Duration {
        self.initial.min(self.max)
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }

    /// Jitter-free delays for the first `sleeps` pauses.
    pub fn schedule(&self, sleeps: usize) -> Vec<Duration> {
        let mut out = Vec::with_capacity(sleeps);
        let mut delay = self.first_delay();
        for _ in 0..sleeps {
            out.push(delay);
            delay = self.next_delay(delay);
        }
        out
    }

    /// `base` shifted by a uniform offset in `[-jitter, +jitter]`, never
    /// below zero.
    pub fn jittered(&self, base: Duration) -> Duration {
        if self.jitter.is_zero() {
            return base;
        }
        let spread = self.jitter.as_secs_f64();
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

/// Progress reported while polling. `attempt` is 1-based.
pub fn polling_progress(attempt: u32, max_attempts: u32) -> u8 {
    let span = u32::from(PROGRESS_POLL_CEILING - PROGRESS_FIRST_POLL);
    let steps = max_attempts.saturating_sub(1).max(1);
    let step = attempt.saturating_sub(1).min(steps);
    PROGRESS_FIRST_POLL + (span * step / steps) as u8
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollUpdate {
    pub status: TaskStatus,
    pub progress: u8,
    pub job_id: Option<String>,
}

#[derive(Debug)]
pub struct Completion {
    pub job: JobHandle,
    pub files: Vec<String>,
    pub censored: bool,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum PollOutcome {
    Done(Completion),
    Stopped {
        status: TaskStatus,
        error: FusionError,
        job: Option<JobHandle>,
    },
}

impl PollOutcome {
    fn stopped(status: TaskStatus, error: FusionError, job: Option<&JobHandle>) -> Self {
        Self::Stopped {
            status,
            error,
            job: job.cloned(),
        }
    }

    fn failed(error: FusionError, job: Option<&JobHandle>) -> Self {
        Self::stopped(TaskStatus::Failed, error, job)
    }

    fn cancelled(job: Option<&JobHandle>) -> Self {
        Self::stopped(TaskStatus::Cancelled, FusionError::Cancelled, job)
    }
}

/// Drives one request from submission to a terminal remote state.
pub struct Poller<'a> {
    api: &'a dyn RemoteApi,
    settings: PollSettings,
    backoff: BackoffPolicy,
    check_availability: bool,
}

impl<'a> Poller<'a> {
    pub fn new(api: &'a dyn RemoteApi, settings: PollSettings, check_availability: bool) -> Self {
        let backoff = BackoffPolicy::from_settings(&settings);
        Self {
            api,
            settings,
            backoff,
            check_availability,
        }
    }

    pub fn run<F>(&self, request: &GenerationRequest, cancel: &AtomicBool, mut on_update: F) -> PollOutcome
    where
        F: FnMut(PollUpdate),
    {
        on_update(PollUpdate {
            status: TaskStatus::Submitting,
            progress: PROGRESS_SUBMITTING,
            job_id: None,
        });

        if cancel.load(Ordering::SeqCst) {
            return PollOutcome::cancelled(None);
        }
        if self.check_availability {
            match self.api.check_availability(&request.pipeline_id) {
                Ok(availability) if availability.is_disabled() => {
                    let status = availability.pipeline_status().unwrap_or("DISABLED");
                    warn!(pipeline_id = %request.pipeline_id, status, "pipeline unavailable");
                    return PollOutcome::stopped(
                        TaskStatus::Unavailable,
                        FusionError::Unavailable(format!(
                            "pipeline {} is not accepting jobs ({status})",
                            request.pipeline_id
                        )),
                        None,
                    );
                }
                Ok(_) => {}
                Err(err) => return PollOutcome::failed(err, None),
            }
        }

        if cancel.load(Ordering::SeqCst) {
            return PollOutcome::cancelled(None);
        }
        let job = match self.api.submit(request) {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "submit failed");
                return PollOutcome::failed(err, None);
            }
        };
        info!(job = %job.uuid, "job accepted");
        on_update(PollUpdate {
            status: TaskStatus::Polling,
            progress: PROGRESS_ACCEPTED,
            job_id: Some(job.uuid.clone()),
        });

        let max_attempts = self.settings.max_attempts.max(1);
        let mut delay = self.backoff.first_delay();
        for attempt in 1..=max_attempts {
            if cancel.load(Ordering::SeqCst) {
                return PollOutcome::cancelled(Some(&job));
            }
            match self.api.fetch_status(&job) {
                Ok(RemoteStatus::Done { files, censored }) => {
                    if files.is_empty() {
                        warn!(job = %job.uuid, "job finished without files");
                        return PollOutcome::failed(FusionError::NoFiles, Some(&job));
                    }
                    info!(job = %job.uuid, files = files.len(), censored, attempt, "job done");
                    return PollOutcome::Done(Completion {
                        job,
                        files,
                        censored,
                        attempts: attempt,
                    });
                }
                Ok(RemoteStatus::Failed { description }) => {
                    warn!(job = %job.uuid, %description, "job failed remotely");
                    return PollOutcome::failed(FusionError::RemoteFailure(description), Some(&job));
                }
                Ok(RemoteStatus::Pending) | Ok(RemoteStatus::Unknown(_)) => {
                    debug!(job = %job.uuid, attempt, max_attempts, "job still running");
                    on_update(PollUpdate {
                        status: TaskStatus::Polling,
                        progress: polling_progress(attempt, max_attempts),
                        job_id: Some(job.uuid.clone()),
                    });
                }
                Err(err) if err.is_retryable() => {
                    warn!(job = %job.uuid, attempt, max_attempts, error = %err, "status check failed, will retry");
                }
                Err(err) => {
                    warn!(job = %job.uuid, error = %err, "status check failed");
                    return PollOutcome::failed(err, Some(&job));
                }
            }

            if attempt == max_attempts {
                break;
            }
            if !sleep_unless_cancelled(self.backoff.jittered(delay), cancel) {
                return PollOutcome::cancelled(Some(&job));
            }
            delay = self.backoff.next_delay(delay);
        }

        warn!(job = %job.uuid, attempts = max_attempts, "job timed out");
        PollOutcome::stopped(
            TaskStatus::TimedOut,
            FusionError::Timeout {
                attempts: max_attempts,
            },
            Some(&job),
        )
    }
}

/// Returns false when the flag was raised during the sleep.
fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE);
        thread::sleep(slice);
        remaining -= slice;
    }
    !cancel.load(Ordering::SeqCst)
}
