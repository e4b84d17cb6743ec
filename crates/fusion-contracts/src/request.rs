use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};

pub const STRICT_DIMENSIONS: [u32; 3] = [512, 768, 1024];
pub const STRICT_MAX_IMAGES: u32 = 4;
pub const STRICT_GUIDANCE_RANGE: (f64, f64) = (1.0, 12.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    Strict,
    Lenient,
}

impl ValidationMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "lenient" => Some(Self::Lenient),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    pub style: Option<String>,
    #[serde(default = "default_images_num")]
    pub images_num: u32,
    pub pipeline_id: String,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: default_dimension(),
            height: default_dimension(),
            style: None,
            images_num: default_images_num(),
            pipeline_id: pipeline_id.into(),
            guidance_scale: default_guidance_scale(),
            seed: None,
        }
    }

    pub fn validate(&self, mode: ValidationMode) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(invalid("prompt must not be empty"));
        }
        if self.pipeline_id.trim().is_empty() {
            return Err(invalid("pipeline id is required"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(invalid("width and height must be positive"));
        }
        if self.images_num < 1 {
            return Err(invalid("images_num must be at least 1"));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale <= 0.0 {
            return Err(invalid("guidance_scale must be a positive number"));
        }
        if mode == ValidationMode::Lenient {
            return Ok(());
        }

        let allowed = STRICT_DIMENSIONS
            .iter()
            .map(u32::to_string)
            .collect::<Vec<String>>()
            .join(", ");
        if !STRICT_DIMENSIONS.contains(&self.width) {
            return Err(invalid(format!("width must be one of: {allowed}")));
        }
        if !STRICT_DIMENSIONS.contains(&self.height) {
            return Err(invalid(format!("height must be one of: {allowed}")));
        }
        if self.images_num > STRICT_MAX_IMAGES {
            return Err(invalid(format!(
                "images_num must be between 1 and {STRICT_MAX_IMAGES}"
            )));
        }
        let (min, max) = STRICT_GUIDANCE_RANGE;
        if self.guidance_scale < min || self.guidance_scale > max {
            return Err(invalid(format!(
                "guidance_scale must be between {min} and {max}"
            )));
        }
        Ok(())
    }

    /// Fills in a random seed when none was given. Applied once, before the
    /// request is stored, so the recorded request is the one sent.
    pub fn with_resolved_seed(mut self) -> Self {
        if self.seed.is_none() {
            self.seed = Some(u64::from(rand::random::<u32>()));
        }
        self
    }

    pub fn negative_prompt(&self) -> Option<&str> {
        non_blank(self.negative_prompt.as_deref())
    }

    pub fn style(&self) -> Option<&str> {
        non_blank(self.style.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn invalid(message: impl Into<String>) -> FusionError {
    FusionError::Validation(message.into())
}

fn default_dimension() -> u32 {
    1024
}

fn default_images_num() -> u32 {
    1
}

fn default_guidance_scale() -> f64 {
    7.0
}
