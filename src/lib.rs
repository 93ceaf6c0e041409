#![forbid(unsafe_code)]

//! # alembic
//!
//! Turn one request into several candidate texts across an ordered set of
//! transformation stages, each served by a swappable generation backend,
//! then order them and optionally let an LLM judge pick one.
//!
//! The flow is: [`Orchestrator`] (backends from a [`BackendRegistry`],
//! calls through the retrying [`Invoker`]) → candidates → [`RankingEngine`]
//! → optional [`JudgeSelector`] → optional [`Optimizer`] → result.
//! [`GenerationService`] wires the whole thing together.

pub mod candidate;
pub mod config;
pub mod gateway;
pub mod judge;
pub mod optimize;
pub mod orchestrator;
pub mod ranking;
pub mod service;
pub mod stages;
pub mod store;
pub mod trace;

pub use candidate::{Candidate, CorrelationId};
pub use config::{AlembicConfig, BackendKind, BackendSpec, ConfigError};
pub use gateway::{
    Attribution, Backend, BackendError, BackendRegistry, Capabilities, EmbeddingError,
    EmbeddingResolver, FailureKind, GenerateRequest, GenerateResponse, InvokeError, Invoker,
    InvokerConfig, OllamaBackend, OpenRouterBackend, PlaceholderBackend, RegistryError, UsageSink,
};
pub use judge::{
    CandidateEvaluation, EvaluationWeights, JudgeConfig, JudgeError, JudgeSelector,
    JudgeWeightPresets, Selection, SelectionCriteria, SelectionResult, SelectionSource,
};
pub use optimize::{OptimizeConfig, OptimizeOutcome, Optimizer};
pub use orchestrator::{
    ChainMode, GenerationRequest, Orchestrator, PipelineError, PipelineRun, PipelineState,
    StageBackendConfig, StageFailure, StageState, StageStatus,
};
pub use ranking::{AxisScores, AxisWeights, RankingContext, RankingEngine, RankingResult, WeightPresets};
pub use service::{GenerateOptions, GenerationOutcome, GenerationService, ServiceError};
pub use stages::{Stage, StageProfile};
pub use store::{input_fingerprint, CandidateStore, HistoricalEntry, NoopCandidateStore, SqliteCandidateStore, StoreError};
pub use trace::{JsonlTraceSink, StageTrace, TraceError, TraceSink, TraceWorker};
