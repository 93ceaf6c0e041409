//! JSON configuration with environment overrides.
//!
//! Every field has a default, so `{}` is a valid (if backend-less) config.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{
    ollama, openrouter, BackendError, BackendRegistry, EmbeddingResolver, InvokerConfig,
    OllamaBackend, OpenRouterBackend, PlaceholderBackend, RegistryError,
};
use crate::judge::{EvaluationWeights, JudgeConfig, JudgeError, JudgeWeightPresets};
use crate::optimize::OptimizeConfig;
use crate::orchestrator::StageBackendConfig;
use crate::ranking::{AxisWeights, RankingEngine, WeightPresets, WeightsError};
use crate::stages::StageProfile;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("ranking weights: {0}")]
    Weights(#[from] WeightsError),
    #[error("judge: {0}")]
    Judge(#[from] JudgeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Openrouter,
    Ollama,
    Placeholder,
}

/// One backend to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key (hosted backends only).
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Placeholder only: advertise embeddings.
    #[serde(default)]
    pub embeddings: bool,
}

impl BackendSpec {
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::Placeholder,
            name: name.into(),
            model: None,
            base_url: None,
            api_key_env: None,
            embedding_model: None,
            timeout_secs: None,
            embeddings: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingSection {
    /// Named preset used when `weights` is absent.
    pub preset: String,
    pub weights: Option<AxisWeights>,
    /// Extra or overriding presets.
    pub presets: HashMap<String, AxisWeights>,
    /// Per-stage scoring profile overrides.
    pub profiles: HashMap<String, StageProfile>,
    pub historical_weight: f64,
    /// Accepted entries read back per request.
    pub history_limit: usize,
}

impl Default for RankingSection {
    fn default() -> Self {
        Self {
            preset: "balanced".into(),
            weights: None,
            presets: HashMap::new(),
            profiles: HashMap::new(),
            historical_weight: 1.0,
            history_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeSection {
    pub backend: Option<String>,
    pub preset: String,
    pub presets: HashMap<String, EvaluationWeights>,
    #[serde(flatten)]
    pub call: JudgeConfig,
}

impl Default for JudgeSection {
    fn default() -> Self {
        Self {
            backend: None,
            preset: "default".into(),
            presets: HashMap::new(),
            call: JudgeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlembicConfig {
    pub backends: Vec<BackendSpec>,
    /// Stage name to backend name.
    pub stage_defaults: HashMap<String, String>,
    pub fallback_backend: Option<String>,
    pub embedding_preference: Vec<String>,
    pub invoker: InvokerConfig,
    pub probe_timeout_ms: u64,
    pub ranking: RankingSection,
    pub judge: JudgeSection,
    pub optimize: OptimizeConfig,
    pub store_path: Option<PathBuf>,
    pub trace_path: Option<PathBuf>,
}

impl Default for AlembicConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            stage_defaults: HashMap::new(),
            fallback_backend: None,
            embedding_preference: Vec::new(),
            invoker: InvokerConfig::default(),
            probe_timeout_ms: 2000,
            ranking: RankingSection::default(),
            judge: JudgeSection::default(),
            optimize: OptimizeConfig::default(),
            store_path: None,
            trace_path: None,
        }
    }
}

impl AlembicConfig {
    /// A single offline placeholder backend serving every stage.
    pub fn offline() -> Self {
        Self {
            backends: vec![BackendSpec::placeholder("placeholder")],
            fallback_backend: Some("placeholder".into()),
            ..Self::default()
        }
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// `ALEMBIC_FALLBACK_BACKEND`, `ALEMBIC_JUDGE_BACKEND` and
    /// `ALEMBIC_STORE_PATH` override their file counterparts.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ALEMBIC_FALLBACK_BACKEND") {
            if !v.trim().is_empty() {
                self.fallback_backend = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ALEMBIC_JUDGE_BACKEND") {
            if !v.trim().is_empty() {
                self.judge.backend = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ALEMBIC_STORE_PATH") {
            if !v.trim().is_empty() {
                self.store_path = Some(PathBuf::from(v));
            }
        }
    }

    /// Stage defaults naming unknown backends are allowed here; they surface
    /// as per-stage configuration failures at run time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for spec in &self.backends {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::Invalid("backend name must not be empty".into()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend name {:?}",
                    spec.name
                )));
            }
        }
        self.invoker.validate()?;
        if self.judge.call.concurrency == 0 {
            return Err(ConfigError::Invalid("judge concurrency must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.ranking.historical_weight) {
            return Err(ConfigError::Invalid(format!(
                "historical_weight must be within 0..=1 (got {})",
                self.ranking.historical_weight
            )));
        }
        if let Some(w) = &self.ranking.weights {
            w.validate()?;
        }
        for w in self.ranking.presets.values() {
            w.validate()?;
        }
        for w in self.judge.presets.values() {
            w.validate()?;
        }
        self.ranking_weights()?;
        self.judge_weights()?;
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Construct and register every configured backend.
    pub fn build_registry(&self) -> Result<BackendRegistry, ConfigError> {
        let mut registry = BackendRegistry::with_probe_timeout(self.probe_timeout());
        for spec in &self.backends {
            let timeout = spec.timeout_secs.map(Duration::from_secs);
            match spec.kind {
                BackendKind::Openrouter => {
                    let key_env = spec.api_key_env.as_deref().unwrap_or("OPENROUTER_API_KEY");
                    let backend = OpenRouterBackend::with_config(
                        std::env::var(key_env).ok(),
                        spec.base_url.as_deref().unwrap_or(openrouter::DEFAULT_BASE_URL),
                        spec.model.as_deref().unwrap_or(openrouter::DEFAULT_MODEL),
                        spec.embedding_model.clone(),
                        timeout.unwrap_or(Duration::from_secs(120)),
                    )?;
                    registry.register(&spec.name, Arc::new(backend))?;
                }
                BackendKind::Ollama => {
                    let backend = OllamaBackend::with_config(
                        spec.base_url.as_deref().unwrap_or(ollama::DEFAULT_BASE_URL),
                        spec.model.as_deref().unwrap_or(ollama::DEFAULT_MODEL),
                        spec.embedding_model.clone(),
                        timeout.unwrap_or(Duration::from_secs(300)),
                    )?;
                    registry.register(&spec.name, Arc::new(backend))?;
                }
                BackendKind::Placeholder => {
                    let mut backend = PlaceholderBackend::new();
                    if let Some(model) = &spec.model {
                        backend = backend.with_model(model);
                    }
                    if spec.embeddings {
                        backend = backend.with_embeddings();
                    }
                    registry.register(&spec.name, Arc::new(backend))?;
                }
            }
        }
        Ok(registry)
    }

    pub fn stage_backend_config(&self) -> StageBackendConfig {
        StageBackendConfig {
            stage_defaults: self.stage_defaults.clone(),
            fallback: self.fallback_backend.clone(),
        }
    }

    pub fn embedding_resolver(&self) -> EmbeddingResolver {
        EmbeddingResolver::with_preference(self.embedding_preference.clone())
    }

    pub fn weight_presets(&self) -> Result<WeightPresets, ConfigError> {
        let mut presets = WeightPresets::default();
        for (name, w) in &self.ranking.presets {
            presets.insert(name, *w)?;
        }
        Ok(presets)
    }

    /// Explicit weights win over the named preset.
    pub fn ranking_weights(&self) -> Result<AxisWeights, ConfigError> {
        match self.ranking.weights {
            Some(w) => Ok(w),
            None => Ok(self.weight_presets()?.get(&self.ranking.preset)?),
        }
    }

    pub fn ranking_engine(&self) -> Result<RankingEngine, ConfigError> {
        Ok(RankingEngine::new(self.ranking_weights()?)?.with_profiles(self.ranking.profiles.clone()))
    }

    pub fn judge_presets(&self) -> Result<JudgeWeightPresets, ConfigError> {
        let mut presets = JudgeWeightPresets::default();
        for (name, w) in &self.judge.presets {
            presets.insert(name, *w)?;
        }
        Ok(presets)
    }

    pub fn judge_weights(&self) -> Result<EvaluationWeights, ConfigError> {
        Ok(self.judge_presets()?.get(&self.judge.preset)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_valid() {
        let config = AlembicConfig::from_json_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.ranking.preset, "balanced");
        assert_eq!(config.judge.call.concurrency, 3);
    }

    #[test]
    fn parses_backends_and_judge_settings() {
        let raw = r#"{
            "backends": [
                {"type": "placeholder", "name": "local", "embeddings": true},
                {"type": "ollama", "name": "llama", "model": "llama3.1"}
            ],
            "stage_defaults": {"solutio": "llama"},
            "fallback_backend": "local",
            "judge": {"backend": "local", "concurrency": 2, "preset": "code"},
            "ranking": {"preset": "precise"}
        }"#;
        let config = AlembicConfig::from_json_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.backends[1].kind, BackendKind::Ollama);
        assert_eq!(config.judge.call.concurrency, 2);
        assert_eq!(config.judge.call.max_tokens, 2048);
        assert_eq!(config.judge_weights().unwrap().relevance, 0.4);

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.names(), &["local".to_string(), "llama".to_string()]);
        assert_eq!(
            config.stage_backend_config().stage_defaults.get("solutio").map(String::as_str),
            Some("llama")
        );
    }

    #[test]
    fn rejects_duplicates_and_bad_values() {
        let dup = r#"{"backends": [
            {"type": "placeholder", "name": "a"},
            {"type": "placeholder", "name": "a"}
        ]}"#;
        assert!(AlembicConfig::from_json_str(dup).unwrap().validate().is_err());

        let zero = r#"{"judge": {"concurrency": 0}}"#;
        assert!(AlembicConfig::from_json_str(zero).unwrap().validate().is_err());

        let negative = r#"{"ranking": {"weights": {"length_fit": -1.0}}}"#;
        assert!(matches!(
            AlembicConfig::from_json_str(negative).unwrap().validate(),
            Err(ConfigError::Weights(_))
        ));

        let runaway = r#"{"invoker": {"multiplier": 1e300}}"#;
        assert!(matches!(
            AlembicConfig::from_json_str(runaway).unwrap().validate(),
            Err(ConfigError::Backend(_))
        ));
        let jitter = r#"{"invoker": {"randomization": 1.5}}"#;
        assert!(AlembicConfig::from_json_str(jitter).unwrap().validate().is_err());
        let inverted = r#"{"invoker": {"initial_delay_ms": 20000, "max_delay_ms": 100}}"#;
        assert!(AlembicConfig::from_json_str(inverted).unwrap().validate().is_err());

        let unknown = r#"{"ranking": {"preset": "nope"}}"#;
        assert!(AlembicConfig::from_json_str(unknown).unwrap().validate().is_err());
    }

    #[test]
    fn unknown_stage_default_is_not_a_config_error() {
        let raw = r#"{"stage_defaults": {"coagulatio": "missing"}}"#;
        assert!(AlembicConfig::from_json_str(raw).unwrap().validate().is_ok());
    }
}
