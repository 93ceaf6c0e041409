//! Embedding backend resolution with fallback.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::invoker::{InvokeError, Invoker};
use super::registry::BackendRegistry;
use super::{Backend, FailureKind};

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("no embedding-capable backend available (primary: {primary})")]
    NoEmbeddingBackend { primary: String },
    #[error("embedding via {backend} failed: {source}")]
    Invoke {
        backend: String,
        #[source]
        source: InvokeError,
    },
}

impl EmbeddingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EmbeddingError::NoEmbeddingBackend { .. } => FailureKind::EmbeddingUnavailable,
            EmbeddingError::Invoke { source, .. } => match source.kind() {
                FailureKind::Cancelled => FailureKind::Cancelled,
                _ => FailureKind::EmbeddingUnavailable,
            },
        }
    }
}

/// Picks the backend that serves embeddings for a given primary backend.
///
/// Resolution runs on every call so a backend that drops out (or comes back)
/// is noticed by the next request.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingResolver {
    preference: Vec<String>,
}

impl EmbeddingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend names to try first, in order, when the primary cannot embed.
    pub fn with_preference(preference: Vec<String>) -> Self {
        Self { preference }
    }

    pub fn preference(&self) -> &[String] {
        &self.preference
    }

    /// Return the name of the backend to embed with.
    ///
    /// The primary wins if it is registered and advertises embeddings.
    /// Otherwise the first available embedding-capable backend other than the
    /// primary is chosen: preferred names first, then registration order.
    pub async fn resolve(
        &self,
        registry: &BackendRegistry,
        primary: &str,
    ) -> Result<String, EmbeddingError> {
        if let Ok(backend) = registry.get(primary) {
            if backend.capabilities().embeddings {
                return Ok(primary.to_string());
            }
        }

        let capable = registry.list_embedding_capable().await;
        let chosen = self
            .preference
            .iter()
            .filter(|name| name.as_str() != primary)
            .find(|name| capable.contains(name))
            .or_else(|| capable.iter().find(|name| name.as_str() != primary));

        match chosen {
            Some(name) => {
                info!(primary, fallback = %name, "using fallback embedding backend");
                Ok(name.clone())
            }
            None => {
                debug!(primary, "no embedding backend available");
                Err(EmbeddingError::NoEmbeddingBackend {
                    primary: primary.to_string(),
                })
            }
        }
    }

    /// Resolve a backend and embed `text` with it through the invoker.
    pub async fn embed(
        &self,
        registry: &BackendRegistry,
        invoker: &Invoker,
        cancel: &CancellationToken,
        primary: &str,
        text: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let name = self.resolve(registry, primary).await?;
        Self::embed_with(registry, invoker, cancel, &name, text).await
    }

    /// Embed `text` with an already resolved backend. Vectors meant to be
    /// compared with each other must all come through the same `name`.
    pub async fn embed_with(
        registry: &BackendRegistry,
        invoker: &Invoker,
        cancel: &CancellationToken,
        name: &str,
        text: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let backend: Arc<dyn Backend> =
            registry
                .get(name)
                .map_err(|_| EmbeddingError::NoEmbeddingBackend {
                    primary: name.to_string(),
                })?;
        let invoked = invoker
            .embed(cancel, name, backend.as_ref(), text)
            .await
            .map_err(|source| EmbeddingError::Invoke {
                backend: name.to_string(),
                source,
            })?;
        Ok(invoked.value.vector)
    }
}
