use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePipeline {
    pub id: String,
    pub name: String,
}

impl RemotePipeline {
    /// Reads one catalog row. Ids may be strings or numbers; a missing
    /// name falls back to its 1-based position.
    pub fn from_value(row: &Value, position: usize) -> Option<Self> {
        let obj = row.as_object()?;
        let id = match obj.get("id")? {
            Value::String(id) => id.trim().to_string(),
            Value::Number(id) => id.to_string(),
            _ => return None,
        };
        if id.is_empty() {
            return None;
        }
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Model {}", position + 1));
        Some(Self { id, name })
    }
}

/// Style the generation API understands, as sent in the `style` param.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StylePreset {
    pub id: &'static str,
    pub name: &'static str,
}

pub const STYLE_PRESETS: [StylePreset; 5] = [
    StylePreset { id: "DEFAULT", name: "Default" },
    StylePreset { id: "ANIME", name: "Anime" },
    StylePreset { id: "PORTRAIT", name: "Portrait" },
    StylePreset { id: "REALISTIC", name: "Realistic" },
    StylePreset { id: "UHD", name: "Ultra HD" },
];

/// Case-insensitive lookup in [`STYLE_PRESETS`].
pub fn style_preset(id: &str) -> Option<&'static StylePreset> {
    let id = id.trim();
    STYLE_PRESETS
        .iter()
        .find(|preset| preset.id.eq_ignore_ascii_case(id))
}

/// Raw availability report for a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Availability(pub Map<String, Value>);

impl Availability {
    pub fn pipeline_status(&self) -> Option<&str> {
        self.0.get("pipeline_status").and_then(Value::as_str)
    }

    /// The API reports e.g. `DISABLED_BY_QUEUE` while overloaded.
    pub fn is_disabled(&self) -> bool {
        self.pipeline_status()
            .map(|status| status.trim().to_ascii_uppercase().starts_with("DISABLED"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{style_preset, Availability, RemotePipeline, STYLE_PRESETS};

    #[test]
    fn pipeline_rows_accept_string_and_numeric_ids() {
        let by_string = RemotePipeline::from_value(&json!({"id": "abc", "name": "Kandinsky"}), 0);
        assert_eq!(
            by_string,
            Some(RemotePipeline {
                id: "abc".to_string(),
                name: "Kandinsky".to_string()
            })
        );
        let by_number = RemotePipeline::from_value(&json!({"id": 4}), 2);
        assert_eq!(
            by_number,
            Some(RemotePipeline {
                id: "4".to_string(),
                name: "Model 3".to_string()
            })
        );
        assert_eq!(RemotePipeline::from_value(&json!({"name": "x"}), 0), None);
        assert_eq!(RemotePipeline::from_value(&json!("abc"), 0), None);
    }

    #[test]
    fn style_lookup_ignores_case_and_padding() {
        assert_eq!(style_preset(" anime ").map(|preset| preset.id), Some("ANIME"));
        assert_eq!(style_preset("UHD").map(|preset| preset.name), Some("Ultra HD"));
        assert!(style_preset("watercolor").is_none());
        assert_eq!(STYLE_PRESETS[0].id, "DEFAULT");
    }

    #[test]
    fn availability_detects_disabled_marker() {
        let disabled: Availability =
            serde_json::from_value(json!({"pipeline_status": "DISABLED_BY_QUEUE"}))
                .unwrap_or_default();
        assert!(disabled.is_disabled());

        let active: Availability =
            serde_json::from_value(json!({"pipeline_status": "ACTIVE"})).unwrap_or_default();
        assert!(!active.is_disabled());
        assert!(!Availability::default().is_disabled());
    }
}
