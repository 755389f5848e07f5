//! Recollect daemon - batched ingestion and fused retrieval over HTTP

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use recollect::collab::{
    BlobStore, Embedder, FsBlobStore, FsKnowledgeGraph, FsLedger, HttpKeyServer,
    InMemoryKnowledgeGraph, InMemoryLedger, InMemoryVectorIndex, KeyServer, KnowledgeGraph, LanceVectorIndex, LocalEmbedder,
    MemoryLedger, RemoteEmbedder, SessionKeyIssuer, VectorIndex,
};
use recollect::config::Config;
use recollect::decrypt::{DecryptionDeps, MemoryDecryptionPipeline};
use recollect::error::Result;
use recollect::pipeline::{BatchManager, PipelineDeps};
use recollect::retrieval::{MemoryRetrievalService, RetrievalDeps};
use recollect::server::{self, AppState};
use recollect::testing::HashEmbedder;

/// Recollect - ingestion, retrieval and decryption core for personal memories
#[derive(Parser)]
#[command(name = "recollect")]
#[command(about = "Batched ingestion, fused retrieval and session-pooled decryption for memories")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the daemon (default command)
    #[command(name = "serve")]
    Serve,
    /// Load and validate the configuration, then print it
    #[command(name = "check-config")]
    CheckConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
        Some(Command::CheckConfig) => check_config(cli.config),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,recollect=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = Config::load(path.as_deref())?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| recollect::RecollectError::Serialization(e.to_string()))?;
    println!("{rendered}");
    println!("# configuration is valid");
    Ok(())
}

fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.embedding.provider.as_str() {
        "remote" => Arc::new(RemoteEmbedder::new(&config.embedding)?),
        "hash" => Arc::new(HashEmbedder::with_dimension(config.embedding.dimension)),
        _ => {
            tracing::info!("Initializing embedding model (this may take a moment on first run)...");
            Arc::new(LocalEmbedder::new(&config.embedding.model)?)
        }
    };
    tracing::info!(embedder = embedder.name(), dimension = embedder.dimension(), "Embedder ready");
    Ok(embedder)
}

async fn build_index(config: &Config, dimension: usize) -> Result<Arc<dyn VectorIndex>> {
    if config.index.backend == "memory" {
        tracing::info!("Using in-memory vector index");
        return Ok(Arc::new(InMemoryVectorIndex::new(config.index.auto_flush_threshold)));
    }
    let dir = config.storage.index_dir();
    tracing::info!("Opening vector index at: {}", dir.display());
    std::fs::create_dir_all(&dir)?;
    Ok(Arc::new(LanceVectorIndex::open(&dir, dimension).await?))
}

/// Ledger and graph that live as long as the vector index does
async fn build_ledger_and_graph(
    config: &Config,
) -> Result<(Arc<dyn MemoryLedger>, Arc<dyn KnowledgeGraph>)> {
    if config.index.backend == "memory" {
        return Ok((
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryKnowledgeGraph::new()),
        ));
    }
    let ledger = FsLedger::open(config.storage.ledger_path()).await?;
    let graph = FsKnowledgeGraph::open(config.storage.graph_path()).await?;
    Ok((Arc::new(ledger), Arc::new(graph)))
}

fn build_decryption(
    config: &Config,
    ledger: Arc<dyn MemoryLedger>,
    blobs: Arc<dyn BlobStore>,
) -> Result<Option<Arc<MemoryDecryptionPipeline>>> {
    let timeout = Duration::from_millis(config.decryption.timeout_ms);
    let servers = config
        .decryption
        .key_servers
        .iter()
        .map(|endpoint| HttpKeyServer::new(endpoint.name.clone(), &endpoint.url, timeout).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    let Some(issuer) = servers.first().cloned() else {
        tracing::info!("No key servers configured, auto-decryption disabled");
        return Ok(None);
    };
    tracing::info!(key_servers = servers.len(), "Decryption pipeline enabled");

    let issuer: Arc<dyn SessionKeyIssuer> = issuer;
    let key_servers: Vec<Arc<dyn KeyServer>> = servers
        .into_iter()
        .map(|server| server as Arc<dyn KeyServer>)
        .collect();

    Ok(Some(Arc::new(MemoryDecryptionPipeline::new(
        config.decryption.clone(),
        DecryptionDeps {
            issuer,
            key_servers,
            ledger,
            blobs,
        },
    ))))
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Recollect daemon");

    let config = load_config(config_path)?;
    tracing::debug!("Config loaded: {:?}", config);

    let data_dir = &config.storage.data_dir;
    tracing::info!("Initializing storage at: {}", data_dir.display());
    std::fs::create_dir_all(data_dir)?;

    let embedder = build_embedder(&config)?;
    let index = build_index(&config, embedder.dimension()).await?;
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(config.storage.blob_dir()).await?);
    let (ledger, graph) = build_ledger_and_graph(&config).await?;

    let decryption = build_decryption(&config, ledger.clone(), blobs.clone())?;
    if let Some(decryption) = &decryption {
        for (name, available) in decryption.probe().await {
            if !available {
                tracing::warn!(key_server = %name, "Key server unreachable at startup");
            }
        }
    }

    let retrieval = MemoryRetrievalService::new(
        config.retrieval.clone(),
        &config.index,
        RetrievalDeps {
            embedder: embedder.clone(),
            index: index.clone(),
            graph: graph.clone(),
            ledger: ledger.clone(),
            blobs: blobs.clone(),
            decryption: decryption.clone(),
        },
    );

    let pipeline = BatchManager::new(
        config.pipeline.clone(),
        config.cache.to_cache_config(),
        PipelineDeps {
            embedder,
            index,
            graph,
            blobs,
            ledger,
        },
    )
    .with_observer(Arc::new(retrieval.clone()));

    let mut background = pipeline.spawn_sweepers();
    background.extend(retrieval.spawn_sweepers());
    if let Some(decryption) = &decryption {
        background.extend(decryption.spawn_session_sweeper());
    }
    background.push(spawn_job_pruner(
        pipeline.clone(),
        Duration::from_secs(config.cache.sweep_interval_secs),
    ));

    let state = Arc::new(AppState::new(pipeline.clone(), retrieval, decryption));
    server::serve(&config.server, state).await?;

    let processed = pipeline.shutdown().await?;
    tracing::info!(processed, "Flushed remaining pipeline work");
    for handle in background {
        handle.abort();
    }

    tracing::info!("Recollect daemon stopped");
    Ok(())
}

/// Periodically drop terminal jobs past their retention
fn spawn_job_pruner(pipeline: BatchManager, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pruned = pipeline.prune_finished();
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned finished jobs");
            }
        }
    })
}
