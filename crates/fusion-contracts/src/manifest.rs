use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{FusionError, Result};
use crate::task::Task;

pub const MANIFEST_FILE: &str = "task.json";

pub fn manifest_path(task_dir: &Path) -> PathBuf {
    task_dir.join(MANIFEST_FILE)
}

/// Writes `<task_dir>/task.json` describing a finished task.
pub fn write_manifest(task_dir: &Path, task: &Task) -> Result<PathBuf> {
    let path = manifest_path(task_dir);
    let mut payload = match serde_json::to_value(task) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(err) => return Err(FusionError::io(&path, std::io::Error::from(err))),
    };
    payload.insert("written_at".to_string(), Value::String(now_utc_iso()));

    std::fs::create_dir_all(task_dir).map_err(|err| FusionError::io(task_dir, err))?;
    let body = serde_json::to_string_pretty(&Value::Object(payload))
        .map_err(|err| FusionError::io(&path, std::io::Error::from(err)))?;
    std::fs::write(&path, body).map_err(|err| FusionError::io(&path, err))?;
    Ok(path)
}

pub fn read_manifest(task_dir: &Path) -> Result<Task> {
    let path = manifest_path(task_dir);
    let raw = std::fs::read_to_string(&path).map_err(|err| FusionError::io(&path, err))?;
    serde_json::from_str(&raw)
        .map_err(|err| FusionError::Format(format!("{}: {err}", path.display())))
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::{json, Value};

    use super::{read_manifest, write_manifest};
    use crate::request::GenerationRequest;
    use crate::task::{ImageRef, Task, TaskPatch};

    #[test]
    fn manifest_round_trips_a_finished_task() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let task_dir = temp.path().join("t-1");

        let mut task = Task::new("t-1", GenerationRequest::new("boat", "p"));
        task.apply(
            TaskPatch::done(vec![ImageRef::saved(0, PathBuf::from("t-1/image_1.png"))])
                .with_censored(true),
        );
        let path = write_manifest(&task_dir, &task)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(parsed["id"], json!("t-1"));
        assert_eq!(parsed["status"], json!("DONE"));
        assert_eq!(parsed["censored"], json!(true));
        assert!(parsed.get("written_at").and_then(Value::as_str).is_some());

        let restored = read_manifest(&task_dir)?;
        assert_eq!(restored, task);
        Ok(())
    }
}
