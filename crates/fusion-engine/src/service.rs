use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fusion_contracts::manifest::write_manifest;
use fusion_contracts::{
    ClientConfig, EventWriter, FusionError, GenerationRequest, ImageRef, PollSettings,
    RemotePipeline, Result, Task, TaskPatch, TaskRegistry, TaskStatus, ValidationMode,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{FusionBrainClient, RemoteApi};
use crate::materialize::{write_bytes, Materializer};
use crate::poller::{PollOutcome, Poller, PROGRESS_SAVING};

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub poll: PollSettings,
    pub validation: ValidationMode,
    pub check_availability: bool,
    pub output_dir: PathBuf,
    pub request_timeout: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            poll: config.poll.clone(),
            validation: config.validation,
            check_availability: config.check_availability,
            output_dir: config.output_dir.clone(),
            request_timeout: config.request_timeout,
        }
    }
}

type CancelFlags = Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>;

fn lock_flags(flags: &CancelFlags) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
    flags.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Message from a task worker to the registry writer.
#[derive(Debug)]
enum TaskUpdate {
    Created { id: String },
    Changed { id: String, patch: TaskPatch },
    Finished { id: String, patch: TaskPatch },
}

/// Accepts generation requests and runs each one on its own thread.
///
/// Workers never write to the registry themselves: they send
/// [`TaskUpdate`]s to a single writer thread which applies them,
/// journals them and writes `task.json` for finished tasks.
pub struct GenerationService {
    registry: TaskRegistry,
    api: Arc<dyn RemoteApi>,
    materializer: Arc<Materializer>,
    settings: ServiceSettings,
    sender: Option<mpsc::Sender<TaskUpdate>>,
    writer: Option<thread::JoinHandle<()>>,
    cancels: CancelFlags,
}

impl GenerationService {
    pub fn new(config: &ClientConfig, events: EventWriter) -> Result<Self> {
        let api: Arc<dyn RemoteApi> = Arc::new(FusionBrainClient::new(config)?);
        Self::with_api(api, ServiceSettings::from_config(config), events)
    }

    pub fn with_api(
        api: Arc<dyn RemoteApi>,
        settings: ServiceSettings,
        events: EventWriter,
    ) -> Result<Self> {
        let materializer = Arc::new(Materializer::new(settings.request_timeout)?);
        let registry = TaskRegistry::new();
        let cancels = CancelFlags::default();
        let (tx, rx) = mpsc::channel();
        let writer = RegistryWriter {
            registry: registry.clone(),
            events,
            output_dir: settings.output_dir.clone(),
            cancels: Arc::clone(&cancels),
        };
        let handle = thread::Builder::new()
            .name("fusion-registry".to_string())
            .spawn(move || writer.run(rx))
            .map_err(|err| FusionError::Config(format!("registry thread spawn failed: {err}")))?;

        Ok(Self {
            registry,
            api,
            materializer,
            settings,
            sender: Some(tx),
            writer: Some(handle),
            cancels,
        })
    }

    pub fn list_pipelines(&self) -> Result<Vec<RemotePipeline>> {
        self.api.list_pipelines()
    }

    pub fn submit(&self, request: GenerationRequest) -> Result<String> {
        self.submit_with_id(&Uuid::new_v4().to_string(), request)
    }

    /// Validates and registers the request, then returns while the task
    /// runs in the background. The id becomes the task's directory name
    /// under the output dir and must pass [`fusion_contracts::validate_task_id`].
    pub fn submit_with_id(&self, id: &str, request: GenerationRequest) -> Result<String> {
        request.validate(self.settings.validation)?;
        let request = request.with_resolved_seed();
        self.registry.create(id, request.clone())?;
        let Some(sender) = self.sender.clone() else {
            return Err(FusionError::Config("service is shutting down".to_string()));
        };
        let _ = sender.send(TaskUpdate::Created { id: id.to_string() });

        info!(task_id = id, pipeline_id = %request.pipeline_id, "task submitted");
        let cancel = Arc::new(AtomicBool::new(false));
        self.lock_cancels().insert(id.to_string(), Arc::clone(&cancel));

        let worker = TaskWorker {
            id: id.to_string(),
            request: Arc::new(request),
            api: Arc::clone(&self.api),
            materializer: Arc::clone(&self.materializer),
            poll: self.settings.poll.clone(),
            check_availability: self.settings.check_availability,
            task_dir: self.settings.output_dir.join(id),
            cancel,
            updates: sender.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("fusion-task-{id}"))
            .spawn(move || worker.run());
        if let Err(err) = spawned {
            let err = FusionError::Config(format!("task thread spawn failed: {err}"));
            warn!(task_id = id, error = %err, "task could not start");
            let _ = sender.send(TaskUpdate::Finished {
                id: id.to_string(),
                patch: TaskPatch::failed(TaskStatus::Failed, &err),
            });
        }
        Ok(id.to_string())
    }

    pub fn status(&self, id: &str) -> Result<Task> {
        self.registry.get(id)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.registry.list()
    }

    /// Blocks until the task reaches a terminal state.
    pub fn wait(&self, id: &str, poll_every: Duration) -> Result<Task> {
        loop {
            let task = self.registry.get(id)?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            thread::sleep(poll_every);
        }
    }

    /// Asks a running task to stop. Finished tasks are left as they are.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let task = self.registry.get(id)?;
        if task.status.is_terminal() {
            return Ok(());
        }
        if let Some(flag) = self.lock_cancels().get(id) {
            flag.store(true, Ordering::SeqCst);
            info!(task_id = id, "cancel requested");
        }
        Ok(())
    }

    pub fn image_path(&self, id: &str, index: usize) -> Result<PathBuf> {
        let task = self.registry.get(id)?;
        if task.status != TaskStatus::Done {
            return Err(FusionError::Validation(format!(
                "task '{id}' has no images (status {})",
                task.status
            )));
        }
        let image = task.image(index).ok_or_else(|| {
            FusionError::Validation(format!("task '{id}' has no image {index}"))
        })?;
        let Some(path) = image.path.clone() else {
            return Err(FusionError::Validation(format!(
                "image {index} of task '{id}' was not saved: {}",
                image.error.as_deref().unwrap_or("unknown error")
            )));
        };
        if !path.is_file() {
            return Err(FusionError::ImageMissing(path));
        }
        Ok(path)
    }

    pub fn image_bytes(&self, id: &str, index: usize) -> Result<Vec<u8>> {
        let path = self.image_path(id, index)?;
        fs::read(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => FusionError::ImageMissing(path.clone()),
            _ => FusionError::io(&path, err),
        })
    }

    pub fn image_base64(&self, id: &str, index: usize) -> Result<String> {
        Ok(BASE64.encode(self.image_bytes(id, index)?))
    }

    pub fn export_image(&self, id: &str, index: usize, destination: &Path) -> Result<PathBuf> {
        let bytes = self.image_bytes(id, index)?;
        write_bytes(destination, &bytes)?;
        Ok(destination.to_path_buf())
    }

    /// Copies every saved image into `dest_dir`, keeping file names.
    /// Results are per image.
    pub fn export_all(&self, id: &str, dest_dir: &Path) -> Result<Vec<ImageRef>> {
        let task = self.registry.get(id)?;
        let Some(images) = task.result.filter(|_| task.status == TaskStatus::Done) else {
            return Err(FusionError::Validation(format!(
                "task '{id}' has no images (status {})",
                task.status
            )));
        };
        Ok(images
            .iter()
            .map(|image| {
                let file_name = image
                    .path
                    .as_deref()
                    .and_then(Path::file_name)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(format!("image_{}.png", image.index + 1)));
                let destination = dest_dir.join(file_name);
                match self.export_image(id, image.index, &destination) {
                    Ok(path) => ImageRef::saved(image.index, path),
                    Err(err) => ImageRef::failed(image.index, err.user_message()),
                }
            })
            .collect())
    }

    fn lock_cancels(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        lock_flags(&self.cancels)
    }
}

impl Drop for GenerationService {
    fn drop(&mut self) {
        for flag in self.lock_cancels().values() {
            flag.store(true, Ordering::SeqCst);
        }
        self.sender = None;
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

struct TaskWorker {
    id: String,
    request: Arc<GenerationRequest>,
    api: Arc<dyn RemoteApi>,
    materializer: Arc<Materializer>,
    poll: PollSettings,
    check_availability: bool,
    task_dir: PathBuf,
    cancel: Arc<AtomicBool>,
    updates: mpsc::Sender<TaskUpdate>,
}

impl TaskWorker {
    fn run(self) {
        let patch = self.execute();
        let _ = self.updates.send(TaskUpdate::Finished {
            id: self.id.clone(),
            patch,
        });
    }

    fn execute(&self) -> TaskPatch {
        let poller = Poller::new(self.api.as_ref(), self.poll.clone(), self.check_availability);
        let outcome = poller.run(&self.request, &self.cancel, |update| {
            let mut patch = TaskPatch::status(update.status, update.progress);
            patch.job_id = update.job_id;
            self.send(patch);
        });

        let completion = match outcome {
            PollOutcome::Done(completion) => completion,
            PollOutcome::Stopped { status, error, .. } => {
                return TaskPatch::failed(status, &error);
            }
        };

        self.send(TaskPatch::progress(PROGRESS_SAVING).with_censored(completion.censored));
        let saved = self
            .materializer
            .persist_all(&completion.files, &self.task_dir, &self.cancel);
        if saved
            .iter()
            .any(|item| matches!(item, Err(FusionError::Cancelled)))
        {
            info!(task_id = %self.id, "cancelled while saving images");
            return TaskPatch::failed(TaskStatus::Cancelled, &FusionError::Cancelled)
                .with_censored(completion.censored);
        }
        if saved.iter().all(|item| item.is_err()) {
            if let Some(Err(err)) = saved.first() {
                warn!(task_id = %self.id, error = %err, "no image could be saved");
                return TaskPatch::failed(TaskStatus::Failed, err)
                    .with_censored(completion.censored);
            }
        }

        let images = saved
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Ok(path) => ImageRef::saved(index, path),
                Err(err) => ImageRef::failed(index, err.user_message()),
            })
            .collect::<Vec<_>>();
        info!(task_id = %self.id, images = images.len(), "task done");
        TaskPatch::done(images).with_censored(completion.censored)
    }

    fn send(&self, patch: TaskPatch) {
        let _ = self.updates.send(TaskUpdate::Changed {
            id: self.id.clone(),
            patch,
        });
    }
}

struct RegistryWriter {
    registry: TaskRegistry,
    events: EventWriter,
    output_dir: PathBuf,
    cancels: CancelFlags,
}

impl RegistryWriter {
    fn run(self, rx: mpsc::Receiver<TaskUpdate>) {
        for update in rx {
            match update {
                TaskUpdate::Created { id } => {
                    if let Ok(task) = self.registry.get(&id) {
                        self.journal("task_created", &task);
                    }
                }
                TaskUpdate::Changed { id, patch } => match self.registry.update(&id, patch) {
                    Ok(task) => {
                        debug!(task_id = %id, status = %task.status, progress = task.progress, "task updated");
                        self.journal("task_updated", &task);
                    }
                    Err(err) => warn!(task_id = %id, error = %err, "dropped task update"),
                },
                TaskUpdate::Finished { id, patch } => self.finish(&id, patch),
            }
        }
    }

    // The manifest is written before the registry flips to a terminal
    // state, so a waiter that sees the terminal state also sees the file.
    fn finish(&self, id: &str, patch: TaskPatch) {
        let mut finished = match self.registry.get(id) {
            Ok(task) => task,
            Err(err) => {
                warn!(task_id = %id, error = %err, "dropped final update");
                return;
            }
        };
        finished.apply(patch.clone());
        if let Err(err) = write_manifest(&self.output_dir.join(id), &finished) {
            warn!(task_id = %id, error = %err, "task manifest not written");
        }
        match self.registry.update(id, patch) {
            Ok(task) => {
                info!(task_id = %id, status = %task.status, "task finished");
                self.journal("task_finished", &task);
            }
            Err(err) => warn!(task_id = %id, error = %err, "dropped final update"),
        }
        lock_flags(&self.cancels).remove(id);
    }

    fn journal(&self, event_type: &str, task: &Task) {
        if let Err(err) = self.events.emit_task(event_type, task) {
            warn!(task_id = %task.id, error = %err, "event journal write failed");
        }
    }
}
