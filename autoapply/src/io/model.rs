//! Text-completion and vision endpoints.
//!
//! [`TextModel`] and [`VisionModel`] decouple the agent from the model
//! server. Tests use scripted models that return queued responses.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model request timed out: {0}")]
    Timeout(String),
    #[error("model endpoint unreachable: {0}")]
    Transport(String),
    #[error("model endpoint returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("decode model response: {0}")]
    Decode(String),
}

impl ModelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModelError::Timeout(_))
    }

    /// The server could not be reached or refused the request; retrying the
    /// same prompt later may succeed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ModelError::Transport(_) | ModelError::Status { .. })
    }
}

/// Synchronous prompt -> completion.
pub trait TextModel {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, ModelError>;
}

/// Synchronous prompt + PNG image -> description.
pub trait VisionModel {
    fn describe(&self, model: &str, prompt: &str, png: &[u8]) -> Result<String, ModelError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Client for an Ollama-compatible `/api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| anyhow::anyhow!("build model http client: {err}"))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[instrument(skip_all, fields(model = request.model, images = request.images.len()))]
    fn post(&self, request: &GenerateRequest<'_>) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    ModelError::Timeout(err.to_string())
                } else {
                    ModelError::Transport(err.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::Status {
                code: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        let body: GenerateResponse = response.json().map_err(|err| {
            if err.is_timeout() {
                ModelError::Timeout(err.to_string())
            } else {
                ModelError::Decode(err.to_string())
            }
        })?;
        debug!(bytes = body.response.len(), "model responded");
        Ok(body.response)
    }
}

impl TextModel for OllamaClient {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, ModelError> {
        self.post(&GenerateRequest {
            model,
            prompt,
            stream: false,
            images: Vec::new(),
        })
    }
}

impl VisionModel for OllamaClient {
    fn describe(&self, model: &str, prompt: &str, png: &[u8]) -> Result<String, ModelError> {
        self.post(&GenerateRequest {
            model,
            prompt,
            stream: false,
            images: vec![STANDARD.encode(png)],
        })
    }
}
