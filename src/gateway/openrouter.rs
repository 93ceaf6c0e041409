//! Hosted backend speaking the OpenAI-compatible chat completions API
//! (OpenRouter by default).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::error::{BackendError, ErrorContext};
use super::types::*;
use super::Backend;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Prompt plus system text, in characters.
const MAX_INPUT_CHARS: usize = 500_000;

const BACKEND: &str = "openrouter";

/// OpenAI-compatible hosted backend.
#[derive(Debug, Clone)]
pub struct OpenRouterBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: Option<String>,
    has_key: bool,
}

impl OpenRouterBackend {
    /// Create from API key with default endpoint and model.
    pub fn new(api_key: impl Into<String>) -> Result<Self, BackendError> {
        Self::with_config(
            Some(api_key.into()),
            DEFAULT_BASE_URL,
            DEFAULT_MODEL,
            None,
            Duration::from_secs(120),
        )
    }

    /// Create from environment variables.
    ///
    /// A missing key is not an error: the backend is built but reports itself
    /// unavailable.
    pub fn from_env() -> Result<Self, BackendError> {
        let api_key = std::env::var("OPENROUTER_API_KEY").ok();

        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let model = std::env::var("OPENROUTER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into());

        let timeout = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Self::with_config(api_key, base_url, model, None, timeout)
    }

    /// Explicit settings; `from_env` is the environment-driven variant.
    pub fn with_config(
        api_key: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        embedding_model: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(key) = &api_key {
            let auth_value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| BackendError::config("Invalid API key format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| BackendError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            model: model.into(),
            embedding_model,
            has_key: api_key.is_some(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    /// `x-request-id`, when the upstream sends one.
    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn extract_retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// POST a JSON body and return the (size-capped) response text, mapping
    /// non-success statuses to the error taxonomy.
    async fn post<B: Serialize + ?Sized>(&self, url: String, body: &B) -> Result<String, BackendError> {
        let mut response = self.client.post(url).json(body).send().await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());
        let retry_after = Self::extract_retry_after(response.headers());

        // Read the body in chunks so an oversized reply is cut off early.
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(BackendError::malformed(
                    BACKEND,
                    format!("Response too large: {new_len} bytes"),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        if status.is_success() {
            return Ok(body);
        }

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = if let Some(id) = &request_id {
            ctx.with_request_id(id)
        } else {
            ctx
        };

        let (message, ctx) = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(ErrorEnvelope { error: Some(error) }) => {
                let ctx = match error.code {
                    Some(serde_json::Value::String(code)) => ctx.with_code(code),
                    Some(serde_json::Value::Number(code)) => ctx.with_code(code.to_string()),
                    _ => ctx,
                };
                (error.message.unwrap_or_default(), ctx)
            }
            _ => (format!("HTTP {}", status.as_u16()), ctx),
        };

        Err(BackendError::from_status(
            BACKEND,
            status.as_u16(),
            message,
            ctx,
            retry_after,
        ))
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    model: Option<String>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct EmbedApiRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedApiResponse {
    data: Vec<EmbedDatum>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

// =============================================================================
// BACKEND IMPL
// =============================================================================

#[async_trait]
impl Backend for OpenRouterBackend {
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
        self.has_key
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, BackendError> {
        if !self.has_key {
            return Err(BackendError::auth("no API key configured"));
        }

        let total_chars = req.input_chars();
        if total_chars > MAX_INPUT_CHARS {
            return Err(BackendError::bad_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();
        let messages = req.messages();
        let api_req = ChatApiRequest {
            model: &self.model,
            messages: &messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };

        let body = self.post(self.chat_url(), &api_req).await?;

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::malformed(BACKEND, format!("Invalid JSON: {e}")))?;

        // Some gateways report errors inside a 200 body.
        if let Some(error) = parsed.error {
            return Err(BackendError::server(
                BACKEND,
                error.message.unwrap_or_else(|| "unknown upstream error".into()),
            ));
        }

        let text = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| BackendError::malformed(BACKEND, "No content in response"))?;

        let tokens_used = parsed
            .usage
            .map(|u| {
                u.total_tokens.unwrap_or_else(|| {
                    u.prompt_tokens.unwrap_or(0) + u.completion_tokens.unwrap_or(0)
                })
            })
            .unwrap_or(0);

        Ok(GenerateResponse {
            text,
            tokens_used,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            latency: start.elapsed(),
        })
    }

    async fn embed(&self, text: &str) -> Result<EmbedResponse, BackendError> {
        let Some(model) = self.embedding_model.as_deref() else {
            return Err(BackendError::EmbeddingsUnsupported(BACKEND.to_string()));
        };
        if !self.has_key {
            return Err(BackendError::auth("no API key configured"));
        }

        let start = Instant::now();
        let body = self
            .post(self.embeddings_url(), &EmbedApiRequest { model, input: text })
            .await?;

        let parsed: EmbedApiResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::malformed(BACKEND, format!("Invalid JSON: {e}")))?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BackendError::malformed(BACKEND, "No embedding in response"))?;

        Ok(EmbedResponse {
            vector,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            latency: start.elapsed(),
        })
    }
}
