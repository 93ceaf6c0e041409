//! Core types for the backend gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Where a backend call came from. Copied onto usage records and traces.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Correlation id of the pipeline run this call is part of.
    pub correlation_id: Option<Uuid>,
    /// Stage name, when the call is stage generation.
    pub stage: Option<String>,
    /// Which code path made this call, e.g. "orchestrator::stage" or "judge::evaluate".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Capability flags a backend advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub embeddings: bool,
    pub streaming: bool,
}

impl Capabilities {
    pub fn text_only() -> Self {
        Self::default()
    }

    pub fn with_embeddings(mut self) -> Self {
        self.embeddings = true;
        self
    }

    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Role of a chat message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A few-shot example forwarded to the backend ahead of the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub input: String,
    pub output: String,
}

/// Request for text generation.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// User prompt.
    pub prompt: String,
    /// Few-shot examples, sent as user/assistant pairs before the prompt.
    pub examples: Vec<Example>,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// 0.0 to 2.0.
    pub temperature: f32,
    /// Output token ceiling.
    pub max_tokens: u32,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, attribution: Attribution) -> Self {
        Self {
            prompt: prompt.into(),
            examples: Vec::new(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 1000,
            attribution,
        }
    }

    pub fn system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn examples(mut self, examples: Vec<Example>) -> Self {
        self.examples = examples;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    /// Flatten into chat messages: system, examples as pairs, then the prompt.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.examples.len() * 2 + 2);
        if let Some(system) = self.system_prompt.as_deref() {
            if !system.trim().is_empty() {
                messages.push(Message::system(system));
            }
        }
        for example in &self.examples {
            messages.push(Message::user(&example.input));
            messages.push(Message::assistant(&example.output));
        }
        messages.push(Message::user(&self.prompt));
        messages
    }

    /// Character count of everything that will be sent.
    pub fn input_chars(&self) -> usize {
        self.prompt.len()
            + self.system_prompt.as_deref().map_or(0, str::len)
            + self
                .examples
                .iter()
                .map(|e| e.input.len() + e.output.len())
                .sum::<usize>()
    }
}

/// Response from text generation.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// Generated text.
    pub text: String,
    /// Tokens consumed (prompt + completion when the backend reports both).
    pub tokens_used: u32,
    /// Model that actually served the request.
    pub model: String,
    /// Wall time of the backend call.
    pub latency: Duration,
}

// =============================================================================
// EMBEDDING TYPES
// =============================================================================

/// Response from an embedding request.
#[derive(Debug, Clone)]
pub struct EmbedResponse {
    pub vector: Vec<f32>,
    pub model: String,
    pub latency: Duration,
}
