use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use nlp_core::extract::load_extractor;
use nlp_core::persist::{StatePaths, StateStore};
use nlp_core::{Pipeline, PipelineConfig, Tables};
use server::build_app;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
struct Args {
    /// State directory holding the change log
    #[arg(long, env = "STATE_DIR", default_value = "./state")]
    state_dir: String,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Partitions per channel (workers per stage)
    #[arg(long, env = "PARTITIONS", default_value_t = 1)]
    partitions: usize,
    /// Concurrent entity extractions
    #[arg(long, env = "EXTRACT_WORKERS", default_value_t = 1)]
    extract_workers: usize,
    /// Entity categories that count as terms
    #[arg(long, value_delimiter = ',', default_value = "PERSON")]
    categories: Vec<String>,
    /// JSON file mapping entity strings to categories
    #[arg(long)]
    gazetteer: Option<PathBuf>,
    /// Required in X-ADMIN-TOKEN for POST /documents when set
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let config = PipelineConfig {
        partitions: args.partitions,
        extract_workers: args.extract_workers,
        allowed_categories: args.categories.iter().map(|c| c.trim().to_string()).filter(|c| !c.is_empty()).collect(),
        ..PipelineConfig::default()
    }
    .normalized();
    let store = StateStore::open(&StatePaths::new(&args.state_dir), config.partitions)?;
    let tables = Tables::open(&store, config.partitions)?;
    let mut pipeline = Pipeline::spawn(config, tables, load_extractor(args.gazetteer.as_deref())?);
    let app: Router = build_app(&mut pipeline, args.admin_token.clone());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    let tables = pipeline.shutdown().await.context("draining pipeline")?;
    let entries = tables.checkpoint()?;
    store.flush()?;
    tracing::info!(entries, "state checkpointed");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
