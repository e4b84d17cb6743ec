pub mod config;
pub mod error;
pub mod events;
pub mod manifest;
pub mod pipelines;
pub mod registry;
pub mod request;
pub mod task;

pub use config::{ClientConfig, PollSettings, RequestDefaults};
pub use error::{ErrorKind, FusionError, Result};
pub use events::{EventPayload, EventWriter};
pub use pipelines::{style_preset, Availability, RemotePipeline, StylePreset, STYLE_PRESETS};
pub use registry::{validate_task_id, TaskRegistry};
pub use request::{GenerationRequest, ValidationMode};
pub use task::{ImageRef, Task, TaskError, TaskPatch, TaskStatus};
