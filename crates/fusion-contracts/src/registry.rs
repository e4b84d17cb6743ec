use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use crate::error::{FusionError, Result};
use crate::request::GenerationRequest;
use crate::task::{Task, TaskPatch};

/// In-memory task table shared between the front end and the task
/// executor. Clones share the same table. Entries are never evicted.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<IndexMap<String, Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, id: &str, request: GenerationRequest) -> Result<Task> {
        validate_task_id(id)?;
        let mut tasks = self.lock();
        if tasks.contains_key(id) {
            return Err(FusionError::DuplicateTask(id.to_string()));
        }
        let task = Task::new(id, request);
        tasks.insert(id.to_string(), task.clone());
        Ok(task)
    }

    pub fn update(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| FusionError::NotFound(id.to_string()))?;
        task.apply(patch);
        Ok(task.clone())
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| FusionError::NotFound(id.to_string()))
    }

    /// Newest first.
    pub fn list(&self) -> Vec<Task> {
        self.lock().values().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave a half-merged task, so a
    // poisoned table is still consistent.
    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Task ids name the task's output directory, so they must be a single
/// plain path component: ASCII letters, digits, `.`, `_` and `-`.
pub fn validate_task_id(id: &str) -> Result<()> {
    let plain = id
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-'));
    if id.is_empty() || !plain || id == "." || id == ".." {
        return Err(FusionError::Validation(format!(
            "invalid task id {id:?}: use letters, digits, '.', '_' or '-'"
        )));
    }
    Ok(())
}
