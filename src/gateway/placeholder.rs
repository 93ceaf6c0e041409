//! Deterministic offline backend.
//!
//! Produces text derived from the prompt without any network access, and
//! hashed bag-of-words embeddings. Used for dry runs and the CLI smoke path.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::error::BackendError;
use super::types::*;
use super::Backend;

const BACKEND: &str = "placeholder";
const EMBED_DIMS: usize = 64;

#[derive(Debug, Clone)]
pub struct PlaceholderBackend {
    model: String,
    embeddings: bool,
    available: bool,
}

impl Default for PlaceholderBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderBackend {
    pub fn new() -> Self {
        Self {
            model: "placeholder-1".to_string(),
            embeddings: false,
            available: true,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_embeddings(mut self) -> Self {
        self.embeddings = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    fn compose(req: &GenerateRequest) -> String {
        let heading = req
            .system_prompt
            .as_deref()
            .and_then(|s| s.lines().find(|l| !l.trim().is_empty()))
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| "Placeholder response".to_string());

        let body: Vec<&str> = req
            .prompt
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let mut text = format!(
            "{heading}\n\nTask: {}\n\nGuidance:\n",
            body.first().copied().unwrap_or("")
        );
        for line in body.iter().skip(1) {
            text.push_str("- ");
            text.push_str(line);
            text.push('\n');
        }
        text.push_str(&format!(
            "\nGenerated at temperature {:.2} with {} example(s).",
            req.temperature,
            req.examples.len()
        ));

        // Roughly four characters per token.
        let cap = (req.max_tokens as usize).saturating_mul(4).max(1);
        if text.len() > cap {
            let mut cut = cap;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        text
    }
}

/// Hash each lowercase word into a fixed-width vector, then L2-normalise.
pub fn hashed_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0f32; EMBED_DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let hash = blake3::hash(word.to_lowercase().as_bytes());
        let bytes = hash.as_bytes();
        let idx = usize::from(bytes[0]) % EMBED_DIMS;
        let sign = if bytes[1] & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl Backend for PlaceholderBackend {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        if self.embeddings {
            Capabilities::text_only().with_embeddings()
        } else {
            Capabilities::text_only()
        }
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, BackendError> {
        if !self.available {
            return Err(BackendError::Unavailable(BACKEND.to_string()));
        }
        let start = Instant::now();
        let text = Self::compose(req);
        let tokens_used = text.split_whitespace().count() as u32;
        Ok(GenerateResponse {
            text,
            tokens_used,
            model: self.model.clone(),
            latency: start.elapsed().max(Duration::from_micros(1)),
        })
    }

    async fn embed(&self, text: &str) -> Result<EmbedResponse, BackendError> {
        if !self.embeddings {
            return Err(BackendError::EmbeddingsUnsupported(BACKEND.to_string()));
        }
        Ok(EmbedResponse {
            vector: hashed_embedding(text),
            model: format!("{}-embed", self.model),
            latency: Duration::ZERO,
        })
    }
}
