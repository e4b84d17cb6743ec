use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FusionError, Result};
use crate::request::{GenerationRequest, ValidationMode};

pub const DEFAULT_API_URL: &str = "https://api-key.fusionbrain.ai/";

#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

/// Request fields used when the caller leaves them out.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub pipeline_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub images_num: u32,
    pub guidance_scale: f64,
    pub style: Option<String>,
    pub negative_prompt: Option<String>,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            pipeline_id: None,
            width: 1024,
            height: 1024,
            images_num: 1,
            guidance_scale: 7.0,
            style: None,
            negative_prompt: None,
        }
    }
}

impl RequestDefaults {
    pub fn request(&self, prompt: impl Into<String>, pipeline_id: impl Into<String>) -> GenerationRequest {
        let mut request = GenerationRequest::new(prompt, pipeline_id);
        request.width = self.width;
        request.height = self.height;
        request.images_num = self.images_num;
        request.guidance_scale = self.guidance_scale;
        request.style = self.style.clone();
        request.negative_prompt = self.negative_prompt.clone();
        request
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_key: String,
    pub secret_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub validation: ValidationMode,
    pub check_availability: bool,
    pub output_dir: PathBuf,
    pub poll: PollSettings,
    pub defaults: RequestDefaults,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            base_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(60),
            validation: ValidationMode::Strict,
            check_availability: true,
            output_dir: PathBuf::from("output"),
            poll: PollSettings::default(),
            defaults: RequestDefaults::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup. Missing credentials fail fast.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let (Some(api_key), Some(secret_key)) =
            (get("FUSIONBRAIN_API_KEY"), get("FUSIONBRAIN_SECRET_KEY"))
        else {
            return Err(FusionError::Config(
                "FUSIONBRAIN_API_KEY and FUSIONBRAIN_SECRET_KEY must both be set".to_string(),
            ));
        };

        let mut config = Self::new(api_key, secret_key);
        if let Some(url) = get("FUSIONBRAIN_API_URL") {
            config.base_url = url;
        }
        if let Some(raw) = get("FUSIONBRAIN_VALIDATION") {
            config.validation = ValidationMode::parse(&raw).ok_or_else(|| {
                FusionError::Config(format!(
                    "FUSIONBRAIN_VALIDATION must be 'strict' or 'lenient', got '{raw}'"
                ))
            })?;
        }
        if let Some(raw) = get("FUSIONBRAIN_CHECK_AVAILABILITY") {
            config.check_availability = parse_flag("FUSIONBRAIN_CHECK_AVAILABILITY", &raw)?;
        }
        if let Some(dir) = get("FUSIONBRAIN_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_opt::<f64>(&get, "FUSIONBRAIN_REQUEST_TIMEOUT")? {
            config.request_timeout = seconds("FUSIONBRAIN_REQUEST_TIMEOUT", secs)?;
        }

        let poll = &mut config.poll;
        if let Some(attempts) = parse_opt::<u32>(&get, "FUSIONBRAIN_MAX_ATTEMPTS")? {
            if attempts == 0 {
                return Err(FusionError::Config(
                    "FUSIONBRAIN_MAX_ATTEMPTS must be at least 1".to_string(),
                ));
            }
            poll.max_attempts = attempts;
        }
        if let Some(secs) = parse_opt::<f64>(&get, "FUSIONBRAIN_INITIAL_DELAY")? {
            poll.initial_delay = seconds("FUSIONBRAIN_INITIAL_DELAY", secs)?;
        }
        if let Some(secs) = parse_opt::<f64>(&get, "FUSIONBRAIN_MAX_DELAY")? {
            poll.max_delay = seconds("FUSIONBRAIN_MAX_DELAY", secs)?;
        }
        if let Some(secs) = parse_opt::<f64>(&get, "FUSIONBRAIN_JITTER")? {
            poll.jitter = seconds("FUSIONBRAIN_JITTER", secs)?;
        }

        let defaults = &mut config.defaults;
        defaults.pipeline_id = get("FUSIONBRAIN_PIPELINE_ID");
        defaults.style = get("FUSIONBRAIN_STYLE");
        defaults.negative_prompt = get("FUSIONBRAIN_NEGATIVE_PROMPT");
        if let Some(width) = parse_opt(&get, "FUSIONBRAIN_WIDTH")? {
            defaults.width = width;
        }
        if let Some(height) = parse_opt(&get, "FUSIONBRAIN_HEIGHT")? {
            defaults.height = height;
        }
        if let Some(images) = parse_opt(&get, "FUSIONBRAIN_IMAGES_NUM")? {
            defaults.images_num = images;
        }
        if let Some(scale) = parse_opt(&get, "FUSIONBRAIN_GUIDANCE_SCALE")? {
            defaults.guidance_scale = scale;
        }

        Ok(config)
    }
}

fn parse_opt<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| FusionError::Config(format!("{key} has an invalid value '{raw}'")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FusionError::Config(format!(
            "{key} must be a boolean, got '{raw}'"
        ))),
    }
}

fn seconds(key: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| FusionError::Config(format!("{key} must be a non-negative number of seconds")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{ClientConfig, DEFAULT_API_URL};
    use crate::error::FusionError;
    use crate::request::ValidationMode;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let err = ClientConfig::from_lookup(lookup(&[("FUSIONBRAIN_API_KEY", "k")])).err();
        assert!(matches!(err, Some(FusionError::Config(_))));
        let err = ClientConfig::from_lookup(lookup(&[
            ("FUSIONBRAIN_API_KEY", "k"),
            ("FUSIONBRAIN_SECRET_KEY", "  "),
        ]))
        .err();
        assert!(matches!(err, Some(FusionError::Config(_))));
    }

    #[test]
    fn defaults_apply_when_only_keys_are_set() -> anyhow::Result<()> {
        let config = ClientConfig::from_lookup(lookup(&[
            ("FUSIONBRAIN_API_KEY", "k"),
            ("FUSIONBRAIN_SECRET_KEY", "s"),
        ]))?;
        assert_eq!(config.base_url, DEFAULT_API_URL);
        assert_eq!(config.validation, ValidationMode::Strict);
        assert!(config.check_availability);
        assert_eq!(config.poll.max_attempts, 10);
        assert_eq!(config.poll.initial_delay, Duration::from_secs(5));
        assert_eq!(config.poll.max_delay, Duration::from_secs(30));
        assert_eq!(config.defaults.width, 1024);
        assert_eq!(config.defaults.pipeline_id, None);
        Ok(())
    }

    #[test]
    fn overrides_are_parsed() -> anyhow::Result<()> {
        let config = ClientConfig::from_lookup(lookup(&[
            ("FUSIONBRAIN_API_KEY", "k"),
            ("FUSIONBRAIN_SECRET_KEY", "s"),
            ("FUSIONBRAIN_API_URL", "http://localhost:9000/"),
            ("FUSIONBRAIN_VALIDATION", "lenient"),
            ("FUSIONBRAIN_CHECK_AVAILABILITY", "off"),
            ("FUSIONBRAIN_MAX_ATTEMPTS", "3"),
            ("FUSIONBRAIN_INITIAL_DELAY", "0.25"),
            ("FUSIONBRAIN_WIDTH", "768"),
            ("FUSIONBRAIN_GUIDANCE_SCALE", "4.5"),
            ("FUSIONBRAIN_PIPELINE_ID", "pipe-7"),
        ]))?;
        assert_eq!(config.base_url, "http://localhost:9000/");
        assert_eq!(config.validation, ValidationMode::Lenient);
        assert!(!config.check_availability);
        assert_eq!(config.poll.max_attempts, 3);
        assert_eq!(config.poll.initial_delay, Duration::from_millis(250));
        assert_eq!(config.defaults.width, 768);
        assert_eq!(config.defaults.guidance_scale, 4.5);

        let request = config.defaults.request("boat", "pipe-7");
        assert_eq!(request.width, 768);
        assert_eq!(request.height, 1024);
        assert_eq!(request.pipeline_id, "pipe-7");
        Ok(())
    }

    #[test]
    fn bad_numbers_name_the_variable() {
        let err = ClientConfig::from_lookup(lookup(&[
            ("FUSIONBRAIN_API_KEY", "k"),
            ("FUSIONBRAIN_SECRET_KEY", "s"),
            ("FUSIONBRAIN_WIDTH", "wide"),
        ]))
        .err();
        assert!(
            matches!(err, Some(FusionError::Config(message)) if message.contains("FUSIONBRAIN_WIDTH"))
        );
    }
}
