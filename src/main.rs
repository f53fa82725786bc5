//! `semx` — the semindex command line.
//!
//! Ingestion side: `init`, `ingest`, `config`, `project`. Retrieval side:
//! `serve` (MCP over stdio or HTTP).
//!
//! Exit codes: 0 success, 2 configuration error, 3 connection error,
//! 5 partial ingestion failure (documents remaining).

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use semindex::config::{self, Config};
use semindex::error::SemIndexError;
use semindex::llm;
use semindex::models::SourceType;
use semindex::pipeline::{run_ingest, PipelineContext};
use semindex::retrieval::RetrievalEngine;
use semindex::state::StateStore;
use semindex::vector::{self, Distance, VectorStore};
use semindex::{convert::FileConverter, mcp};

#[derive(Parser)]
#[command(
    name = "semx",
    about = "semindex — multi-source ingestion into Qdrant plus an MCP retrieval server",
    version
)]
struct Cli {
    /// Workspace directory holding semindex.yaml, state and logs
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vector collection (idempotent)
    Init {
        /// Recreate the collection even if the vector size changed
        #[arg(long)]
        force: bool,
    },

    /// Run one ingestion pass
    Ingest {
        /// Only this project (default: all configured projects)
        #[arg(long)]
        project: Option<String>,

        /// Only this source type (git, confluence, jira, publicdocs, localfile)
        #[arg(long)]
        source_type: Option<String>,

        /// Only this source name
        #[arg(long)]
        source: Option<String>,

        /// Reprocess documents even when unchanged
        #[arg(long)]
        force: bool,

        /// Log filter (overrides MCP_LOG_LEVEL)
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Print the effective configuration with secrets redacted
    Config,

    /// Project inspection commands
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Start the MCP retrieval server
    Serve {
        #[arg(long, value_enum, default_value_t = Transport::Stdio)]
        transport: Transport,

        /// Bind address for the http transport
        #[arg(long, default_value = "127.0.0.1:8334")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// List configured projects
    List {
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Show per-project ingestion counters
    Status {
        #[arg(long)]
        project_id: Option<String>,
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Validate project and source configuration
    Validate {
        #[arg(long)]
        project_id: Option<String>,
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Stdio,
    Http,
}

fn exit_code_for(error: &SemIndexError) -> i32 {
    match error {
        SemIndexError::Config(_) => 2,
        SemIndexError::TransientNetwork { .. }
        | SemIndexError::TransientRateLimit { .. }
        | SemIndexError::Http(_)
        | SemIndexError::SourceStalled { .. } => 3,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Ingest { log_level, .. } => log_level.clone(),
        _ => None,
    };
    let _log_guard = semindex::logging::init(log_level.as_deref());

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code_for(&e));
        }
    }
}

async fn run(cli: Cli) -> Result<i32, SemIndexError> {
    match cli.command {
        Commands::Init { force } => {
            let config = load_with_env(&cli.workspace)?;
            let store = vector::create_store(&config.global.qdrant)?;
            store
                .init_collection(
                    &config.global.qdrant.collection_name,
                    config.global.llm.embeddings.vector_size,
                    Distance::Cosine,
                    force,
                )
                .await?;
            println!(
                "collection '{}' ready (vector size {})",
                config.global.qdrant.collection_name, config.global.llm.embeddings.vector_size
            );
            Ok(0)
        }

        Commands::Ingest {
            project,
            source_type,
            source,
            force,
            log_level: _,
        } => {
            let config = load_with_env(&cli.workspace)?;
            let source_type = match source_type.as_deref() {
                Some(raw) => Some(SourceType::parse(raw).ok_or_else(|| {
                    SemIndexError::Config(format!("unknown source type '{raw}'"))
                })?),
                None => None,
            };

            let ctx = build_pipeline_context(&config).await?;

            // Ctrl-C cancels cooperatively: in-flight documents finish or
            // are abandoned, nothing half-commits.
            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling run");
                    cancel.cancel();
                }
            });

            let projects: Vec<String> = match project {
                Some(p) => vec![p],
                None => config.projects.keys().cloned().collect(),
            };
            if projects.is_empty() {
                return Err(SemIndexError::Config("no projects configured".into()));
            }

            let mut failed = 0usize;
            for project_id in &projects {
                let report =
                    run_ingest(&ctx, project_id, source_type, source.as_deref(), force).await?;
                failed += report.failed();
                println!(
                    "project {project_id}: seen={} unchanged={} chunked={} embedded={} upserted={} tombstoned={} failed={}",
                    report.documents_seen.load(Ordering::Relaxed),
                    report.unchanged.load(Ordering::Relaxed),
                    report.chunked.load(Ordering::Relaxed),
                    report.embedded.load(Ordering::Relaxed),
                    report.upserted.load(Ordering::Relaxed),
                    report.tombstoned.load(Ordering::Relaxed),
                    report.failed(),
                );
            }

            Ok(if failed > 0 { 5 } else { 0 })
        }

        Commands::Config => {
            let path = cli.workspace.join(config::CONFIG_FILE);
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                SemIndexError::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            // Parse (with env expansion) first so invalid config still fails.
            config::load_config_from_str(&raw, &cli.workspace)?;
            print!("{}", config::redacted_yaml(&raw)?);
            Ok(0)
        }

        Commands::Project { action } => {
            let config = load_with_env(&cli.workspace)?;
            run_project(&config, action).await
        }

        Commands::Serve { transport, bind } => {
            let config = load_with_env(&cli.workspace)?;
            let provider = llm::create_provider(&config.global.llm)?;
            let store = vector::create_store(&config.global.qdrant)?;
            let engine = RetrievalEngine {
                provider,
                vector: store,
                collection: config.global.qdrant.collection_name.clone(),
                weights: config.global.search.similarity.clone(),
            };
            let server = Arc::new(mcp::McpServer::new(engine));

            match transport {
                Transport::Stdio => mcp::stdio::serve(server).await?,
                Transport::Http => mcp::http::serve(server, &bind).await?,
            }
            Ok(0)
        }
    }
}

async fn run_project(config: &Config, action: ProjectAction) -> Result<i32, SemIndexError> {
    match action {
        ProjectAction::List { format } => {
            let rows: Vec<serde_json::Value> = config
                .projects
                .iter()
                .map(|(id, p)| {
                    serde_json::json!({
                        "project_id": id,
                        "display_name": p.display_name,
                        "description": p.description,
                        "sources": {
                            "git": p.sources.git.keys().collect::<Vec<_>>(),
                            "confluence": p.sources.confluence.keys().collect::<Vec<_>>(),
                            "jira": p.sources.jira.keys().collect::<Vec<_>>(),
                            "publicdocs": p.sources.publicdocs.keys().collect::<Vec<_>>(),
                            "localfile": p.sources.localfile.keys().collect::<Vec<_>>(),
                        }
                    })
                })
                .collect();
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                Format::Text => {
                    for row in &rows {
                        println!(
                            "{} — {}",
                            row["project_id"].as_str().unwrap_or(""),
                            row["display_name"].as_str().unwrap_or("(unnamed)")
                        );
                    }
                }
            }
            Ok(0)
        }

        ProjectAction::Status { project_id, format } => {
            let state_path = config.global.state_management.resolve_path(&config.workspace);
            let pool = semindex::db::connect(&state_path).await?;
            let state = StateStore::new(pool);
            state.migrate().await?;

            let ids: Vec<String> = match project_id {
                Some(id) => vec![id],
                None => config.projects.keys().cloned().collect(),
            };
            let mut rows = Vec::new();
            for id in &ids {
                let counts = state.project_counts(id).await?;
                rows.push(serde_json::json!({
                    "project_id": id,
                    "documents": counts.documents,
                    "attachments": counts.attachments,
                    "chunks": counts.chunks,
                    "tombstoned": counts.tombstoned,
                }));
            }
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                Format::Text => {
                    for row in &rows {
                        println!(
                            "{}: {} documents ({} attachments), {} chunks, {} tombstoned",
                            row["project_id"].as_str().unwrap_or(""),
                            row["documents"],
                            row["attachments"],
                            row["chunks"],
                            row["tombstoned"],
                        );
                    }
                }
            }
            Ok(0)
        }

        ProjectAction::Validate { project_id, format } => {
            let ids: Vec<String> = match project_id {
                Some(id) => vec![id],
                None => config.projects.keys().cloned().collect(),
            };
            let mut rows = Vec::new();
            let mut all_valid = true;
            for id in &ids {
                let result = semindex::connectors::build_connectors(config, id, None, None);
                let (valid, detail) = match &result {
                    Ok(connectors) if connectors.is_empty() => {
                        (false, Some("no sources configured".to_string()))
                    }
                    Ok(_) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                };
                all_valid &= valid;
                rows.push(serde_json::json!({
                    "project_id": id,
                    "valid": valid,
                    "detail": detail,
                }));
            }
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                Format::Text => {
                    for row in &rows {
                        let status = if row["valid"].as_bool().unwrap_or(false) {
                            "ok"
                        } else {
                            "INVALID"
                        };
                        println!(
                            "{}: {} {}",
                            row["project_id"].as_str().unwrap_or(""),
                            status,
                            row["detail"].as_str().unwrap_or(""),
                        );
                    }
                }
            }
            Ok(if all_valid { 0 } else { 2 })
        }
    }
}

async fn build_pipeline_context(config: &Config) -> Result<PipelineContext, SemIndexError> {
    let state_path = config.global.state_management.resolve_path(&config.workspace);
    let pool = semindex::db::connect(&state_path).await?;
    let state = StateStore::new(pool);
    state.migrate().await?;

    let provider = llm::create_provider(&config.global.llm)?;
    let store = vector::create_store(&config.global.qdrant)?;
    let converter = Arc::new(FileConverter::new(
        config.global.file_conversion.clone(),
        Some(Arc::clone(&provider)),
    ));

    Ok(PipelineContext {
        config: Arc::new(config.clone()),
        state,
        provider,
        vector: store,
        converter,
        cancel: CancellationToken::new(),
    })
}

/// Load the workspace config and apply the direct environment overrides
/// (`QDRANT_URL`, `LLM_PROVIDER`, ...) used by MCP hosts that configure the
/// server purely through env.
fn load_with_env(workspace: &std::path::Path) -> Result<Config, SemIndexError> {
    let mut config = config::load_config(workspace)?;

    if let Ok(url) = std::env::var("QDRANT_URL") {
        if !url.is_empty() {
            config.global.qdrant.url = url;
        }
    }
    if let Ok(key) = std::env::var("QDRANT_API_KEY") {
        if !key.is_empty() {
            config.global.qdrant.api_key = Some(key);
        }
    }
    if let Ok(name) = std::env::var("QDRANT_COLLECTION_NAME") {
        if !name.is_empty() {
            config.global.qdrant.collection_name = name;
        }
    }
    if let Ok(provider) = std::env::var("LLM_PROVIDER") {
        if !provider.is_empty() {
            config.global.llm.provider = provider;
        }
    }
    if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
        if !base_url.is_empty() {
            config.global.llm.base_url = base_url;
        }
    }
    if let Ok(key) = std::env::var("LLM_API_KEY") {
        if !key.is_empty() {
            config.global.llm.api_key = Some(key);
        }
    }
    if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
        if !model.is_empty() {
            config.global.llm.models.embeddings = model;
        }
    }
    if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
        if !model.is_empty() {
            config.global.llm.models.chat = Some(model);
        }
    }
    Ok(config)
}
