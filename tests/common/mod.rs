#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use alembic::gateway::placeholder::hashed_embedding;
use alembic::gateway::{
    Backend, BackendError, Capabilities, EmbedResponse, GenerateRequest, GenerateResponse,
};

type Responder = Box<dyn Fn(&GenerateRequest) -> Result<String, BackendError> + Send + Sync>;

/// In-process backend with queued results and a fallback responder.
pub struct ScriptedBackend {
    model: String,
    queue: Mutex<VecDeque<Result<String, BackendError>>>,
    fallback: Responder,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    embeddings: bool,
    embed_dims: usize,
    available: bool,
    delay: Duration,
    probe_delay: Duration,
}

impl ScriptedBackend {
    /// Replies "<stage> output".
    pub fn echo() -> Self {
        Self::responding(|req| {
            let stage = req.attribution.stage.as_deref().unwrap_or("call");
            Ok(format!("{stage} output"))
        })
    }

    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::responding(move |_| Ok(text.clone()))
    }

    pub fn failing(make: fn() -> BackendError) -> Self {
        Self::responding(move |_| Err(make()))
    }

    pub fn responding<F>(f: F) -> Self
    where
        F: Fn(&GenerateRequest) -> Result<String, BackendError> + Send + Sync + 'static,
    {
        Self {
            model: "scripted-1".into(),
            queue: Mutex::new(VecDeque::new()),
            fallback: Box::new(f),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            embeddings: false,
            embed_dims: 64,
            available: true,
            delay: Duration::ZERO,
            probe_delay: Duration::ZERO,
        }
    }

    /// Queue a result served before the fallback responder.
    pub fn then(self, result: Result<String, BackendError>) -> Self {
        self.queue.lock().unwrap().push_back(result);
        self
    }

    pub fn with_embeddings(mut self) -> Self {
        self.embeddings = true;
        self
    }

    /// Embeddings of a fixed width, standing in for a distinct embedding model.
    pub fn with_embedding_dims(mut self, dims: usize) -> Self {
        self.embeddings = true;
        self.embed_dims = dims;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> &'static str {
        "scripted"
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
        if !self.probe_delay.is_zero() {
            tokio::time::sleep(self.probe_delay).await;
        }
        self.available
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(req.prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.queue.lock().unwrap().pop_front();
        let text = match queued {
            Some(result) => result?,
            None => (self.fallback)(req)?,
        };
        Ok(GenerateResponse {
            tokens_used: text.split_whitespace().count() as u32,
            text,
            model: self.model.clone(),
            latency: self.delay,
        })
    }

    async fn embed(&self, text: &str) -> Result<EmbedResponse, BackendError> {
        if !self.embeddings {
            return Err(BackendError::EmbeddingsUnsupported("scripted".into()));
        }
        let mut vector = hashed_embedding(text);
        vector.resize(self.embed_dims, 0.0);
        Ok(EmbedResponse {
            vector,
            model: "scripted-embed".into(),
            latency: Duration::ZERO,
        })
    }
}

/// A judge reply on the 0-10 scale.
pub fn judge_json(relevance: u32, clarity: u32, toxicity: u32, reasoning: &str) -> String {
    format!(
        "{{\"relevance\": {relevance}, \"clarity\": {clarity}, \"completeness\": 7, \
         \"conciseness\": 7, \"toxicity\": {toxicity}, \"reasoning\": \"{reasoning}\"}}"
    )
}
