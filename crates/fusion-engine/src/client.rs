use fusion_contracts::{
    Availability, ClientConfig, FusionError, GenerationRequest, RemotePipeline, Result,
};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

/// Remote job accepted by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStatus {
    Pending,
    Done { files: Vec<String>, censored: bool },
    Failed { description: String },
    Unknown(String),
}

/// Wire contract of the generation service. Every call is a single
/// attempt; retrying is up to the caller.
pub trait RemoteApi: Send + Sync {
    fn list_pipelines(&self) -> Result<Vec<RemotePipeline>>;
    fn check_availability(&self, pipeline_id: &str) -> Result<Availability>;
    fn submit(&self, request: &GenerationRequest) -> Result<JobHandle>;
    fn fetch_status(&self, job: &JobHandle) -> Result<RemoteStatus>;
}

pub struct FusionBrainClient {
    api_base: String,
    api_key: String,
    secret_key: String,
    http: HttpClient,
}

impl FusionBrainClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| FusionError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            api_base: config.base_url.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/key/api/v1/{path}", self.api_base)
    }

    /// Endpoint whose path embeds a caller-supplied id. Each segment is
    /// percent-encoded, so `/`, `?` and `#` cannot change the route.
    fn endpoint_with(&self, segments: &[&str]) -> Result<String> {
        if let Some(bad) = segments.iter().find(|segment| matches!(**segment, "" | "." | "..")) {
            return Err(FusionError::Validation(format!("invalid id '{bad}' in request path")));
        }
        let mut url = Url::parse(&self.endpoint("")).map_err(|err| {
            FusionError::Config(format!("invalid API base URL '{}': {err}", self.api_base))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                FusionError::Config(format!("API base URL '{}' cannot carry a path", self.api_base))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url.into())
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-Key", format!("Key {}", self.api_key))
            .header("X-Secret", format!("Secret {}", self.secret_key))
    }

    fn get_json(&self, what: &str, endpoint: &str) -> Result<Value> {
        let response = self
            .authorized(self.http.get(endpoint))
            .send()
            .map_err(|err| FusionError::network(format!("{what} request failed ({endpoint}): {err}")))?;
        response_json_or_error(what, response)
    }

    fn params_payload(request: &GenerationRequest) -> Value {
        let mut params = json!({
            "type": "GENERATE",
            "numImages": request.images_num,
            "width": request.width,
            "height": request.height,
            "guidanceScale": request.guidance_scale,
            "generateParams": {
                "query": request.prompt,
            },
        });
        if let Some(obj) = params.as_object_mut() {
            if let Some(style) = request.style() {
                obj.insert("style".to_string(), Value::String(style.to_string()));
            }
            if let Some(negative) = request.negative_prompt() {
                obj.insert(
                    "negativePromptDecoder".to_string(),
                    Value::String(negative.to_string()),
                );
            }
            if let Some(seed) = request.seed {
                obj.insert("seed".to_string(), Value::from(seed));
            }
        }
        params
    }

    fn parse_status(payload: &Value) -> RemoteStatus {
        let raw = payload
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.trim().to_ascii_uppercase())
            .unwrap_or_default();
        match raw.as_str() {
            "DONE" => {
                let result = payload.get("result");
                let files = result
                    .and_then(|result| result.get("files"))
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let censored = result
                    .and_then(|result| result.get("censored"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                RemoteStatus::Done { files, censored }
            }
            "FAIL" | "FAILED" => {
                let description = ["errorDescription", "error"]
                    .iter()
                    .find_map(|key| payload.get(*key).and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or("Unknown error")
                    .to_string();
                RemoteStatus::Failed { description }
            }
            "INITIAL" | "PROCESSING" | "PENDING" => RemoteStatus::Pending,
            _ => RemoteStatus::Unknown(raw),
        }
    }
}

impl RemoteApi for FusionBrainClient {
    fn list_pipelines(&self) -> Result<Vec<RemotePipeline>> {
        let payload = self.get_json("pipelines", &self.endpoint("pipelines"))?;
        let rows = payload
            .as_array()
            .filter(|rows| !rows.is_empty())
            .ok_or_else(|| {
                FusionError::Validation(format!(
                    "pipeline catalog is not a non-empty list: {}",
                    truncate_text(&payload.to_string(), 256)
                ))
            })?;
        let pipelines: Vec<RemotePipeline> = rows
            .iter()
            .enumerate()
            .filter_map(|(position, row)| RemotePipeline::from_value(row, position))
            .collect();
        if pipelines.is_empty() {
            return Err(FusionError::Validation(
                "pipeline catalog has no usable entries".to_string(),
            ));
        }
        debug!(count = pipelines.len(), "fetched pipeline catalog");
        Ok(pipelines)
    }

    fn check_availability(&self, pipeline_id: &str) -> Result<Availability> {
        let endpoint = self.endpoint_with(&["pipeline", pipeline_id, "availability"])?;
        let payload = self.get_json("availability", &endpoint)?;
        let availability = match payload {
            Value::Object(map) => Availability(map),
            _ => Availability::default(),
        };
        debug!(pipeline_id, status = ?availability.pipeline_status(), "availability checked");
        Ok(availability)
    }

    fn submit(&self, request: &GenerationRequest) -> Result<JobHandle> {
        let endpoint = self.endpoint("pipeline/run");
        let params = Self::params_payload(request);
        let params_part = MultipartPart::text(params.to_string())
            .mime_str("application/json")
            .map_err(|err| FusionError::Validation(format!("invalid params part: {err}")))?;
        let form = MultipartForm::new()
            .text("pipeline_id", request.pipeline_id.clone())
            .part("params", params_part);

        let response = self
            .authorized(self.http.post(&endpoint))
            .multipart(form)
            .send()
            .map_err(|err| FusionError::network(format!("submit request failed ({endpoint}): {err}")))?;
        let payload = response_json_or_error("submit", response)?;
        let uuid = payload
            .get("uuid")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                FusionError::Validation(format!(
                    "submit response has no uuid: {}",
                    truncate_text(&payload.to_string(), 256)
                ))
            })?;
        Ok(JobHandle {
            uuid: uuid.to_string(),
        })
    }

    fn fetch_status(&self, job: &JobHandle) -> Result<RemoteStatus> {
        let endpoint = self.endpoint_with(&["pipeline", "status", &job.uuid])?;
        let payload = self.get_json("status", &endpoint)?;
        let status = Self::parse_status(&payload);
        if let RemoteStatus::Unknown(raw) = &status {
            warn!(job = %job.uuid, status = %raw, "unrecognized remote status");
        }
        Ok(status)
    }
}

fn response_json_or_error(what: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| FusionError::network(format!("{what} response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(FusionError::http_status(
            code,
            format!("{what} request failed: {}", truncate_text(&body, 512)),
        ));
    }
    serde_json::from_str(&body).map_err(|err| {
        FusionError::Validation(format!("{what} returned invalid JSON payload: {err}"))
    })
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
