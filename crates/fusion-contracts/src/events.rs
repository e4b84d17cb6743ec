use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{FusionError, Result};
use crate::task::Task;

pub type EventPayload = Map<String, Value>;

/// Append-only task journal.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
/// - a disabled writer accepts events and drops them
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self::build(Some(path.into()), session_id.into())
    }

    pub fn disabled() -> Self {
        Self::build(None, String::new())
    }

    fn build(path: Option<PathBuf>, session_id: String) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path,
                session_id,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.path.is_some()
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_deref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| FusionError::io(parent, err))?;
        }

        let line = serde_json::to_string(&event)
            .map_err(|err| FusionError::io(path, std::io::Error::from(err)))?;
        let _guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| FusionError::io(path, err))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(|err| FusionError::io(path, err))?;

        Ok(Value::Object(event))
    }

    /// Journals a snapshot of `task` under `event_type`.
    pub fn emit_task(&self, event_type: &str, task: &Task) -> Result<Value> {
        let mut payload = EventPayload::new();
        payload.insert("task_id".to_string(), Value::String(task.id.clone()));
        payload.insert(
            "status".to_string(),
            Value::String(task.status.as_str().to_string()),
        );
        payload.insert("progress".to_string(), Value::from(task.progress));
        if let Some(job_id) = &task.job_id {
            payload.insert("job_id".to_string(), Value::String(job_id.clone()));
        }
        if task.censored {
            payload.insert("censored".to_string(), Value::Bool(true));
        }
        if let Some(error) = &task.error {
            payload.insert(
                "error".to_string(),
                serde_json::to_value(error).unwrap_or(Value::Null),
            );
        }
        if let Some(result) = &task.result {
            payload.insert("images".to_string(), Value::from(result.len()));
        }
        self.emit(event_type, payload)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;
    use crate::request::GenerationRequest;
    use crate::task::{TaskPatch, TaskStatus};

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-1");

        let mut payload = EventPayload::new();
        payload.insert("out_dir".to_string(), Value::String("/tmp/out".to_string()));
        let emitted = writer.emit("session_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("session_started".to_string()));
        assert_eq!(parsed["session_id"], Value::String("session-1".to_string()));
        assert_eq!(parsed["out_dir"], Value::String("/tmp/out".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn task_events_append_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-1");

        let mut task = Task::new("t-1", GenerationRequest::new("boat", "p"));
        writer.emit_task("task_created", &task)?;
        task.apply(TaskPatch::status(TaskStatus::Polling, 30).with_job("job-1"));
        writer.emit_task("task_updated", &task)?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], Value::String("task_created".to_string()));
        assert_eq!(lines[0]["status"], Value::String("CREATED".to_string()));
        assert_eq!(lines[1]["status"], Value::String("POLLING".to_string()));
        assert_eq!(lines[1]["job_id"], Value::String("job-1".to_string()));
        assert_eq!(lines[1]["progress"], Value::from(30));
        Ok(())
    }

    #[test]
    fn disabled_writer_drops_events() -> anyhow::Result<()> {
        let writer = EventWriter::disabled();
        assert!(!writer.is_enabled());
        let emitted = writer.emit("anything", EventPayload::new())?;
        assert_eq!(emitted["type"], Value::String("anything".to_string()));
        assert!(writer.path().is_none());
        Ok(())
    }
}
