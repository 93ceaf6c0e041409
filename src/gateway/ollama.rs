//! Local-daemon backend for an Ollama server.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{BackendError, ErrorContext};
use super::types::*;
use super::Backend;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3";

const BACKEND: &str = "ollama";

/// Probe timeout for `/api/tags`; the registry applies its own bound on top.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: Option<String>,
}

impl OllamaBackend {
    pub fn new(model: impl Into<String>) -> Result<Self, BackendError> {
        Self::with_config(DEFAULT_BASE_URL, model, None, Duration::from_secs(300))
    }

    pub fn with_config(
        base_url: impl Into<String>,
        model: impl Into<String>,
        embedding_model: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            embedding_model,
        })
    }

    /// Ollama's generate endpoint takes one prompt, so few-shot examples are
    /// folded in ahead of the real input.
    fn render_prompt(req: &GenerateRequest) -> String {
        if req.examples.is_empty() {
            return req.prompt.clone();
        }
        let mut out = String::new();
        for example in &req.examples {
            out.push_str("Input: ");
            out.push_str(&example.input);
            out.push_str("\nOutput: ");
            out.push_str(&example.output);
            out.push_str("\n\n");
        }
        out.push_str("Input: ");
        out.push_str(&req.prompt);
        out.push_str("\nOutput:");
        out
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<String, BackendError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return Ok(text);
        }

        let message = serde_json::from_str::<OllamaError>(&text)
            .map(|e| e.error)
            .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));
        Err(BackendError::from_status(
            BACKEND,
            status.as_u16(),
            message,
            ErrorContext::new().with_status(status.as_u16()),
            None,
        ))
    }
}

#[derive(Serialize)]
struct GenerateApiRequest<'a> {
    model: &'a str,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateApiResponse {
    response: String,
    model: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Serialize)]
struct EmbedApiRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbedApiResponse {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OllamaError {
    error: String,
}

#[async_trait]
impl Backend for OllamaBackend {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        let caps = Capabilities::text_only().with_streaming();
        if self.embedding_model.is_some() {
            caps.with_embeddings()
        } else {
            caps
        }
    }

    async fn is_available(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, base_url = %self.base_url, "ollama unreachable");
                false
            }
        }
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, BackendError> {
        let start = Instant::now();
        let api_req = GenerateApiRequest {
            model: &self.model,
            prompt: Self::render_prompt(req),
            system: req.system_prompt.as_deref().filter(|s| !s.trim().is_empty()),
            stream: false,
            options: GenerateOptions {
                temperature: req.temperature,
                num_predict: req.max_tokens,
            },
        };

        let body = self.post("/api/generate", &api_req).await?;
        let parsed: GenerateApiResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::malformed(BACKEND, format!("Invalid JSON: {e}")))?;

        if parsed.response.trim().is_empty() {
            return Err(BackendError::malformed(BACKEND, "empty response"));
        }

        Ok(GenerateResponse {
            text: parsed.response,
            tokens_used: parsed.prompt_eval_count.unwrap_or(0) + parsed.eval_count.unwrap_or(0),
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            latency: start.elapsed(),
        })
    }

    async fn embed(&self, text: &str) -> Result<EmbedResponse, BackendError> {
        let Some(model) = self.embedding_model.as_deref() else {
            return Err(BackendError::EmbeddingsUnsupported(BACKEND.to_string()));
        };

        let start = Instant::now();
        let body = self
            .post("/api/embeddings", &EmbedApiRequest { model, prompt: text })
            .await?;
        let parsed: EmbedApiResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::malformed(BACKEND, format!("Invalid JSON: {e}")))?;

        if parsed.embedding.is_empty() {
            return Err(BackendError::malformed(BACKEND, "empty embedding"));
        }

        Ok(EmbedResponse {
            vector: parsed.embedding,
            model: model.to_string(),
            latency: start.elapsed(),
        })
    }
}
