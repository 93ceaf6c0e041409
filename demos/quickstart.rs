//! Minimal end-to-end example for `alembic`.
//!
//! Runs the three built-in stages over one input, ranks the candidates and,
//! when a hosted backend is configured, lets it judge them.
//!
//! To run:
//! - Optionally set `OPENROUTER_API_KEY` (otherwise everything runs offline)
//! - `cargo run --example quickstart`

use std::sync::Arc;

use alembic::gateway::{BackendRegistry, Invoker, InvokerConfig, OpenRouterBackend, PlaceholderBackend};
use alembic::orchestrator::{Orchestrator, StageBackendConfig};
use alembic::ranking::RankingEngine;
use alembic::service::{GenerateOptions, GenerationService};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // -- Backends ------------------------------------------------------------

    // Without a key the hosted backend reports itself unavailable and
    // coagulatio falls through to the placeholder.
    let mut registry = BackendRegistry::new();
    registry.register("local", Arc::new(PlaceholderBackend::new().with_embeddings()))?;
    registry.register("hosted", Arc::new(OpenRouterBackend::from_env()?))?;
    let registry = Arc::new(registry);

    let stage_config = StageBackendConfig {
        stage_defaults: [("coagulatio".to_string(), "hosted".to_string())].into(),
        fallback: Some("local".into()),
    };

    let orchestrator = Orchestrator::new(registry.clone(), Invoker::new(InvokerConfig::default()), stage_config);
    let service = GenerationService::new(orchestrator, RankingEngine::default());

    // -- The actual request --------------------------------------------------

    let mut opts = GenerateOptions::new("Write a function that reverses a string");
    opts.request.context = vec!["Target language: Rust".into()];
    opts.include_embeddings = true;
    if registry.is_available("hosted").await {
        opts.judge = true;
        opts.criteria = Some(alembic::SelectionCriteria::new(
            "Pick the clearest, most correct implementation",
            "hosted",
        ));
    }

    let outcome = service.generate(&opts, &CancellationToken::new()).await?;

    // -- Results -------------------------------------------------------------

    for r in &outcome.ranked {
        println!("#{} {:<14} composite={:.3}", r.rank, r.stage.as_str(), r.composite);
    }
    for f in &outcome.metadata.failures {
        println!("failed: {} ({}): {}", f.stage, f.kind, f.message);
    }
    if let Some(selected) = &outcome.selected {
        println!("\nselected via {:?}:\n{}", outcome.selection.source, selected.text);
    }
    Ok(())
}
