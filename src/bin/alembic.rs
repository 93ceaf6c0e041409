#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use alembic::config::AlembicConfig;
use alembic::gateway::{StderrUsageSink, UsageSink};
use alembic::orchestrator::ChainMode;
use alembic::service::{GenerateOptions, GenerationService};
use alembic::stages::Stage;
use alembic::store::{input_fingerprint, CandidateStore, SqliteCandidateStore};
use alembic::trace::{JsonlTraceSink, TraceSink};

#[derive(Parser)]
#[command(name = "alembic", version, about = "Multi-stage candidate generation CLI")]
struct Cli {
    /// JSON config file; without one a single offline placeholder backend is used
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate, rank and select candidates for one input
    Generate(GenerateArgs),
    /// List registered backends with availability and capabilities
    Backends {
        #[arg(long)]
        json: bool,
    },
    /// Show previously accepted candidates for an input
    History {
        #[arg(long)]
        input: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Candidate store (defaults to the configured or default path)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct GenerateArgs {
    /// Input text
    #[arg(long, group = "source")]
    input: Option<String>,
    /// Read the input text from a file
    #[arg(long, group = "source")]
    input_file: Option<PathBuf>,
    /// Full request as JSON (overrides every other generation flag)
    #[arg(long, group = "source")]
    request: Option<PathBuf>,
    /// Stage names in order (repeatable); defaults to the three built-in stages
    #[arg(long = "stage")]
    stages: Vec<String>,
    #[arg(long, default_value_t = 1)]
    count: usize,
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,
    #[arg(long, default_value_t = 1000)]
    max_tokens: u32,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long = "context")]
    context: Vec<String>,
    #[arg(long)]
    persona: Option<String>,
    /// Backend for every stage without an explicit mapping
    #[arg(long)]
    backend: Option<String>,
    /// Per-stage backend as STAGE=NAME (repeatable)
    #[arg(long = "stage-backend")]
    stage_backends: Vec<String>,
    /// Every stage consumes the raw input instead of the previous stage's output
    #[arg(long)]
    independent: bool,
    #[arg(long)]
    parallel: bool,
    #[arg(long)]
    deadline_ms: Option<u64>,
    #[arg(long)]
    persist: bool,
    #[arg(long)]
    optimize: bool,
    #[arg(long)]
    optimize_iterations: Option<usize>,
    #[arg(long)]
    judge: bool,
    #[arg(long)]
    judge_backend: Option<String>,
    #[arg(long)]
    judge_preset: Option<String>,
    #[arg(long)]
    ranking_preset: Option<String>,
    #[arg(long)]
    embeddings: bool,
    /// Write stage lifecycle events as JSONL
    #[arg(long)]
    trace: Option<PathBuf>,
    /// Print one usage record per backend attempt to stderr
    #[arg(long)]
    usage: bool,
    /// Write the outcome JSON here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Serialize)]
struct BackendRow {
    name: String,
    kind: &'static str,
    model: String,
    available: bool,
    embeddings: bool,
    streaming: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("alembic=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AlembicConfig::load_from_path(path)?,
        None => {
            let mut config = AlembicConfig::offline();
            config.apply_env();
            config
        }
    };

    match cli.command {
        Commands::Generate(args) => {
            if let Some(judge) = &args.judge_backend {
                config.judge.backend = Some(judge.clone());
            }
            if args.judge && config.judge.backend.is_none() {
                config.judge.backend = config.fallback_backend.clone();
            }
            let opts = build_options(&args)?;

            let mut worker = None;
            let trace: Option<Arc<dyn TraceSink>> = match &args.trace {
                Some(path) => {
                    let (sink, w) = JsonlTraceSink::new(path)?;
                    worker = Some(w);
                    Some(Arc::new(sink))
                }
                None => None,
            };
            let usage: Option<Arc<dyn UsageSink>> = if args.usage {
                Some(Arc::new(StderrUsageSink))
            } else {
                None
            };

            let service = GenerationService::from_config(&config, trace, usage)?;
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let outcome = service.generate(&opts, &cancel).await?;
            drop(service);
            if let Some(worker) = worker {
                worker.join()?;
            }

            info!(
                candidates = outcome.candidates.len(),
                failures = outcome.metadata.failures.len(),
                "done"
            );
            match &args.out {
                Some(path) => {
                    write_json(path, &outcome)?;
                    eprintln!("[generate] outcome written to {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&outcome)?),
            }
        }
        Commands::Backends { json } => {
            let registry = config.build_registry()?;
            let available = registry.list_available().await;
            let mut rows = Vec::new();
            for name in registry.names() {
                let backend = registry.get(name)?;
                let caps = backend.capabilities();
                rows.push(BackendRow {
                    name: name.clone(),
                    kind: backend.kind(),
                    model: backend.model().to_string(),
                    available: available.contains(name),
                    embeddings: caps.embeddings,
                    streaming: caps.streaming,
                });
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!(
                        "{}\t{}\t{}\tavailable={}\tembeddings={}\tstreaming={}",
                        row.name, row.kind, row.model, row.available, row.embeddings, row.streaming
                    );
                }
            }
        }
        Commands::History { input, limit, db } => {
            let path = db
                .or_else(|| config.store_path.clone())
                .unwrap_or_else(SqliteCandidateStore::default_path);
            let store = SqliteCandidateStore::new(path)?;
            let entries = store.historical_lookup(&input_fingerprint(&input), limit).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    Ok(())
}

fn build_options(args: &GenerateArgs) -> Result<GenerateOptions, Box<dyn std::error::Error>> {
    if let Some(path) = &args.request {
        let raw = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }

    let input = match (&args.input, &args.input_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => return Err("generate requires --input, --input-file or --request".into()),
    };

    let mut opts = GenerateOptions::new(input);
    let req = &mut opts.request;
    if !args.stages.is_empty() {
        req.stages = args.stages.iter().map(|s| Stage::parse(s)).collect();
    }
    req.count = args.count;
    req.temperature = args.temperature;
    req.max_tokens = args.max_tokens;
    req.tags = args.tags.clone();
    req.context = args.context.clone();
    req.persona = args.persona.clone();
    req.backend = args.backend.clone();
    req.stage_backends = parse_stage_backends(&args.stage_backends)?;
    req.chain = if args.independent {
        ChainMode::Independent
    } else {
        ChainMode::Refine
    };
    req.parallel = args.parallel;
    req.deadline_ms = args.deadline_ms;

    opts.persist = args.persist;
    opts.optimize = args.optimize;
    opts.optimize_iterations = args.optimize_iterations;
    opts.judge = args.judge;
    opts.judge_preset = args.judge_preset.clone();
    opts.ranking_preset = args.ranking_preset.clone();
    opts.include_embeddings = args.embeddings;
    Ok(opts)
}

/// Parse "stage=backend" pairs.
fn parse_stage_backends(specs: &[String]) -> Result<HashMap<String, String>, Box<dyn std::error::Error>> {
    let mut out = HashMap::new();
    for spec in specs {
        let Some((stage, backend)) = spec.split_once('=') else {
            return Err(format!("invalid --stage-backend {spec:?}; expected STAGE=NAME").into());
        };
        let stage = Stage::parse(stage.trim());
        out.insert(stage.as_str().to_string(), backend.trim().to_string());
    }
    Ok(out)
}

fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
