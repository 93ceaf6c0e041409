//! Name-keyed backend registry.
//!
//! Registration happens while the service is being assembled; afterwards the
//! registry is shared behind an `Arc` and only read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::debug;

use super::{Backend, Capabilities};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("backend {0:?} is already registered")]
    DuplicateName(String),
    #[error("backend {0:?} is not registered")]
    NotFound(String),
}

/// Holds named backends in registration order.
pub struct BackendRegistry {
    order: Vec<String>,
    backends: HashMap<String, Arc<dyn Backend>>,
    probe_timeout: Duration,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::with_probe_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_probe_timeout(probe_timeout: Duration) -> Self {
        Self {
            order: Vec::new(),
            backends: HashMap::new(),
            probe_timeout,
        }
    }

    /// Register a backend under a unique name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.backends.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.order.push(name.clone());
        self.backends.insert(name, backend);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>, RegistryError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// All registered names, in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn capabilities(&self, name: &str) -> Result<Capabilities, RegistryError> {
        self.get(name).map(|b| b.capabilities())
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Probe one backend, treating a slow probe as unavailable.
    pub async fn is_available(&self, name: &str) -> bool {
        let Some(backend) = self.backends.get(name) else {
            return false;
        };
        match tokio::time::timeout(self.probe_timeout, backend.is_available()).await {
            Ok(available) => available,
            Err(_) => {
                debug!(backend = name, "availability probe timed out");
                false
            }
        }
    }

    /// Names whose availability probe currently succeeds, in registration order.
    ///
    /// Probes run concurrently, each bounded by the probe timeout.
    pub async fn list_available(&self) -> Vec<String> {
        let probes = self.order.iter().map(|name| async move {
            let up = self.is_available(name).await;
            (name, up)
        });
        join_all(probes)
            .await
            .into_iter()
            .filter(|(_, up)| *up)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Available names whose backend advertises embeddings.
    pub async fn list_embedding_capable(&self) -> Vec<String> {
        self.list_available()
            .await
            .into_iter()
            .filter(|name| {
                self.backends
                    .get(name)
                    .is_some_and(|b| b.capabilities().embeddings)
            })
            .collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.order)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}
