//! Text-generation client.
//!
//! [`ModelClient`] is the blocking seam between the orchestrator and the
//! inference endpoint. [`OllamaClient`] talks to an Ollama-compatible
//! server:
//!
//! - `POST /api/generate` with `stream: false` for generation
//! - `GET /api/tags` to check that the endpoint is up and a model is pulled
//!
//! # Error Handling
//!
//! - Connection failures → retried, then [`QaError::ModelUnavailable`]
//! - Call exceeds its timeout → [`QaError::ModelTimeout`] (not retried)
//! - HTTP 429 and 5xx → retried with exponential backoff, then [`QaError::ModelError`]
//! - Other non-2xx or a body without `response` → [`QaError::ModelError`]
//!
//! Every call is independent. Conversation state, when needed, is carried
//! in the prompt by the caller.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::{QaError, Result};

/// Generation parameters sent with every call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub max_tokens: u32,
    pub num_ctx: u32,
    pub timeout: Duration,
}

impl GenerateOptions {
    pub fn from_config(model: &ModelConfig) -> Self {
        Self {
            temperature: model.temperature,
            top_p: model.top_p,
            repeat_penalty: model.repeat_penalty,
            max_tokens: model.max_tokens,
            num_ctx: model.num_ctx,
            timeout: Duration::from_secs(model.timeout_secs),
        }
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::from_config(&ModelConfig::default())
    }
}

/// Output of one generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// Blocking text-generation endpoint.
///
/// Implementations must be usable from several worker threads at once.
pub trait ModelClient: Send + Sync {
    fn generate(&self, model: &str, prompt: &str, options: &GenerateOptions) -> Result<Generation>;

    /// Fail with [`QaError::ModelUnavailable`] unless the endpoint answers and
    /// serves `model`.
    fn check_available(&self, model: &str) -> Result<()>;
}

/// Client for an Ollama-compatible HTTP endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    url: String,
    max_retries: u32,
    backoff_base: Duration,
}

impl OllamaClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
        }
    }

    pub fn from_config(model: &ModelConfig) -> Self {
        Self::new(&model.url).with_max_retries(model.max_retries)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// First retry delay. Doubles per attempt.
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn http_client(&self, timeout: Duration) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| QaError::ModelUnavailable {
                url: self.url.clone(),
                reason: format!("failed to build HTTP client: {}", e),
            })
    }

    fn unavailable(&self, reason: impl Into<String>) -> QaError {
        QaError::ModelUnavailable {
            url: self.url.clone(),
            reason: reason.into(),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: RequestOptions,
}

#[derive(Serialize)]
struct RequestOptions {
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
    num_predict: u32,
    num_ctx: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

impl ModelClient for OllamaClient {
    fn generate(&self, model: &str, prompt: &str, options: &GenerateOptions) -> Result<Generation> {
        let client = self.http_client(options.timeout)?;
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: RequestOptions {
                temperature: options.temperature,
                top_p: options.top_p,
                repeat_penalty: options.repeat_penalty,
                num_predict: options.max_tokens,
                num_ctx: options.num_ctx,
            },
        };

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // 1x, 2x, 4x, ... of the base delay
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                warn!(model, attempt, ?delay, "retrying generation: {:?}", last_err);
                std::thread::sleep(delay);
            }

            let resp = client
                .post(format!("{}/api/generate", self.url))
                .json(&body)
                .send();

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: GenerateResponse =
                            response.json().map_err(|e| QaError::ModelError {
                                model: model.to_string(),
                                message: format!("invalid response body: {}", e),
                            })?;
                        let text = parsed.response.ok_or_else(|| QaError::ModelError {
                            model: model.to_string(),
                            message: "response body has no 'response' field".to_string(),
                        })?;
                        debug!(
                            model,
                            prompt_tokens = parsed.prompt_eval_count,
                            completion_tokens = parsed.eval_count,
                            "generation finished"
                        );
                        return Ok(Generation {
                            text,
                            prompt_tokens: parsed.prompt_eval_count,
                            completion_tokens: parsed.eval_count,
                        });
                    }

                    let body_text = response.text().unwrap_or_default();
                    let err = QaError::ModelError {
                        model: model.to_string(),
                        message: format!("HTTP {}: {}", status, body_text.trim()),
                    };
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) if e.is_timeout() => {
                    return Err(QaError::ModelTimeout {
                        model: model.to_string(),
                        timeout_secs: options.timeout.as_secs(),
                    });
                }
                Err(e) if e.is_connect() => {
                    last_err = Some(self.unavailable(format!(
                        "connection failed (is Ollama running?): {}",
                        e
                    )));
                    continue;
                }
                Err(e) => {
                    last_err = Some(QaError::ModelError {
                        model: model.to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| QaError::ModelError {
            model: model.to_string(),
            message: "generation failed after retries".to_string(),
        }))
    }

    fn check_available(&self, model: &str) -> Result<()> {
        let client = self.http_client(Duration::from_secs(10))?;
        let response = client
            .get(format!("{}/api/tags", self.url))
            .send()
            .map_err(|e| self.unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("GET /api/tags returned {}", response.status())));
        }

        let tags: TagsResponse = response
            .json()
            .map_err(|e| self.unavailable(format!("invalid /api/tags response: {}", e)))?;

        let latest = format!("{}:latest", model);
        if tags.models.iter().any(|m| m.name == model || m.name == latest) {
            return Ok(());
        }

        let names: Vec<&str> = tags.models.iter().map(|m| m.name.as_str()).collect();
        Err(self.unavailable(format!(
            "model '{}' is not available (installed: {})",
            model,
            if names.is_empty() {
                "none".to_string()
            } else {
                names.join(", ")
            }
        )))
    }
}
