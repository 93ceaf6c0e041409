//! Backend gateway: the capability contract, concrete backends, the
//! name-keyed registry, retrying invocation, and embedding fallback.

pub mod embedding;
pub mod error;
pub mod invoker;
pub mod ollama;
pub mod openrouter;
pub mod placeholder;
pub mod registry;
pub mod types;
pub mod usage;

use async_trait::async_trait;

pub use embedding::{EmbeddingError, EmbeddingResolver};
pub use error::{BackendError, ErrorContext, FailureKind};
pub use invoker::{AttemptFailure, InvokeError, Invoked, Invoker, InvokerConfig};
pub use ollama::OllamaBackend;
pub use openrouter::OpenRouterBackend;
pub use placeholder::PlaceholderBackend;
pub use registry::{BackendRegistry, RegistryError};
pub use types::*;
pub use usage::{CallRecord, CallStatus, NoopUsageSink, StderrUsageSink, UsageSink};

/// A swappable text-generation backend.
///
/// Hosted APIs, local daemons, and the offline placeholder all implement
/// this one contract; the orchestrator only ever sees `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short stable identifier, e.g. "openrouter" or "ollama".
    fn kind(&self) -> &'static str;

    /// Model generation requests go to, if the backend pins one.
    fn model(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Liveness check. Callers bound this with a timeout.
    async fn is_available(&self) -> bool;

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, BackendError>;

    async fn embed(&self, _text: &str) -> Result<EmbedResponse, BackendError> {
        Err(BackendError::EmbeddingsUnsupported(self.kind().to_string()))
    }
}
