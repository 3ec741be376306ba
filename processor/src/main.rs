use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nlp_core::extract::{load_extractor, MAX_CHAR_NUM};
use nlp_core::persist::{load_meta, StatePaths, StateStore};
use nlp_core::topic::Subscription;
use nlp_core::{Document, Pipeline, PipelineConfig, RetryPolicy, ScoreRecord, Tables};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader as AsyncBufReader};
use tracing_subscriber::{fmt, EnvFilter};
use walkdir::WalkDir;

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "processor")]
#[command(about = "Stream documents through TF-IDF scoring and track the most important entity per document", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over JSON/JSONL documents ({"key": ..., "text": ...})
    Run {
        /// Input file or directory, or - for JSONL on stdin
        #[arg(long, default_value = "-")]
        input: String,
        /// Where MostImportantTerm records are written as JSONL, - for stdout
        #[arg(long, default_value = "-")]
        output: String,
        /// Keep all state in memory instead of the state directory
        #[arg(long, default_value_t = false)]
        memory: bool,
        #[command(flatten)]
        state: StateArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Print the contents of a state table as JSON
    Inspect {
        #[command(flatten)]
        state: StateArgs,
        #[arg(long, value_enum)]
        table: TableName,
        /// Only print this key
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Args)]
struct StateArgs {
    /// State directory holding the change log
    #[arg(long, env = "STATE_DIR", default_value = "./state")]
    state_dir: String,
}

#[derive(Args)]
struct PipelineArgs {
    /// Partitions per channel (workers per stage)
    #[arg(long, env = "PARTITIONS", default_value_t = 1)]
    partitions: usize,
    /// Queue depth per partition
    #[arg(long, default_value_t = 1024)]
    channel_capacity: usize,
    /// Concurrent entity extractions
    #[arg(long, env = "EXTRACT_WORKERS", default_value_t = 1)]
    extract_workers: usize,
    /// Entity categories that count as terms
    #[arg(long, value_delimiter = ',', default_value = "PERSON")]
    categories: Vec<String>,
    /// JSON file mapping entity strings to categories; defaults to the proper-noun heuristic
    #[arg(long)]
    gazetteer: Option<PathBuf>,
    /// Documents are truncated to this many characters
    #[arg(long, default_value_t = MAX_CHAR_NUM)]
    max_chars: usize,
    /// Give up on an extraction after this many milliseconds
    #[arg(long)]
    extract_timeout_ms: Option<u64>,
    /// Attempts per document before the run stops with an error, 0 retries forever
    #[arg(long, default_value_t = 0)]
    max_attempts: u32,
}

impl PipelineArgs {
    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            partitions: self.partitions,
            channel_capacity: self.channel_capacity,
            extract_workers: self.extract_workers,
            allowed_categories: self.categories.iter().map(|c| c.trim().to_string()).filter(|c| !c.is_empty()).collect::<HashSet<_>>(),
            max_chars: self.max_chars,
            extract_timeout: self.extract_timeout_ms.map(Duration::from_millis),
            retry: RetryPolicy { max_attempts: self.max_attempts, ..RetryPolicy::default() },
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TableName {
    DocumentCount,
    DocumentFrequency,
    TermOccurrence,
    MostImportantScore,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(std::io::stderr).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { input, output, memory, state, pipeline } => run(&input, &output, memory, &state, &pipeline).await,
        Commands::Inspect { state, table, key } => inspect(&state, table, key.as_deref()),
    }
}

async fn run(input: &str, output: &str, memory: bool, state: &StateArgs, args: &PipelineArgs) -> Result<()> {
    let config = args.config().normalized();
    let store = if memory {
        StateStore::temporary()?
    } else {
        StateStore::open(&StatePaths::new(&state.state_dir), config.partitions)?
    };
    let tables = Tables::open(&store, config.partitions)?;
    let extractor = load_extractor(args.gazetteer.as_deref())?;

    let mut pipeline = Pipeline::spawn(config, tables, extractor);
    let subscription = pipeline.take_most_important().context("output channel already taken")?;
    let writer: Box<dyn AsyncWrite + Unpin + Send> = if output == "-" {
        Box::new(tokio::io::stdout())
    } else {
        Box::new(tokio::fs::File::create(output).await.with_context(|| format!("creating {output}"))?)
    };
    let sink = tokio::spawn(write_records(subscription, writer));

    let mut submitted = 0usize;
    let mut malformed = 0usize;
    if input == "-" {
        let mut lines = AsyncBufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            submit_line(&pipeline, &line, &mut submitted, &mut malformed).await?;
        }
    } else {
        for file in input_files(Path::new(input)) {
            submit_file(&pipeline, &file, &mut submitted, &mut malformed).await?;
        }
    }
    tracing::info!(submitted, malformed, "all documents submitted");

    let stats = pipeline.stats().clone();
    let tables = pipeline.shutdown().await?;
    let written = sink.await??;
    if !memory {
        tables.checkpoint()?;
        store.flush()?;
    }

    let summary = stats.snapshot();
    tracing::info!(
        documents = summary.term_frequency.received,
        term_frequencies = summary.term_frequency.emitted,
        scores = summary.inverse_document_frequency.emitted,
        improvements = written,
        suppressed = summary.maximum_tracking.suppressed,
        failed = summary.term_frequency.failed,
        "pipeline finished"
    );
    Ok(())
}

fn input_files(input_path: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    if input_path.is_dir() {
        for entry in WalkDir::new(input_path).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() {
                if let Some(ext) = p.extension().and_then(|s| s.to_str()) {
                    if matches!(ext, "json" | "jsonl") {
                        files.push(p.to_path_buf());
                    }
                }
            }
        }
    } else if input_path.is_file() {
        files.push(input_path.to_path_buf());
    }
    files
}

async fn submit_file(pipeline: &Pipeline, file: &Path, submitted: &mut usize, malformed: &mut usize) -> Result<()> {
    if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
        let reader = BufReader::new(File::open(file).with_context(|| format!("opening {}", file.display()))?);
        for line in reader.lines() {
            submit_line(pipeline, &line?, submitted, malformed).await?;
        }
        return Ok(());
    }

    let reader = BufReader::new(File::open(file).with_context(|| format!("opening {}", file.display()))?);
    let json: serde_json::Value = serde_json::from_reader(reader).with_context(|| format!("parsing {}", file.display()))?;
    let values = match json {
        serde_json::Value::Array(arr) => arr,
        other @ serde_json::Value::Object(_) => vec![other],
        _ => Vec::new(),
    };
    for value in values {
        match serde_json::from_value::<Document>(value) {
            Ok(doc) => {
                pipeline.submit(&doc.key, &doc.text).await?;
                *submitted += 1;
            }
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "skipping malformed document");
                *malformed += 1;
            }
        }
    }
    Ok(())
}

async fn submit_line(pipeline: &Pipeline, line: &str, submitted: &mut usize, malformed: &mut usize) -> Result<()> {
    if line.trim().is_empty() {
        return Ok(());
    }
    match serde_json::from_str::<Document>(line) {
        Ok(doc) => {
            pipeline.submit(&doc.key, &doc.text).await?;
            *submitted += 1;
        }
        Err(e) => {
            tracing::error!(error = %e, "skipping malformed document line");
            *malformed += 1;
        }
    }
    Ok(())
}

async fn write_records(mut subscription: Subscription<ScoreRecord>, mut out: Box<dyn AsyncWrite + Unpin + Send>) -> Result<usize> {
    let mut written = 0usize;
    while let Some(record) = subscription.recv().await {
        match record {
            Ok(record) => {
                let mut line = serde_json::to_vec(&record)?;
                line.push(b'\n');
                out.write_all(&line).await?;
                written += 1;
            }
            Err(e) => tracing::error!(error = %e, "unreadable most important term record"),
        }
    }
    out.flush().await?;
    Ok(written)
}

fn inspect(state: &StateArgs, table: TableName, key: Option<&str>) -> Result<()> {
    let paths = StatePaths::new(&state.state_dir);
    let store = StateStore::open(&paths, load_meta(&paths).map(|m| m.partitions).unwrap_or(1))?;
    let tables = Tables::open(&store, 1)?;
    let value = match (table, key) {
        (TableName::DocumentCount, _) => json!(tables.document_count.get(nlp_core::DOCUMENTS_KEY)),
        (TableName::DocumentFrequency, Some(k)) => json!({ k: tables.document_frequency.get(k) }),
        (TableName::DocumentFrequency, None) => json!(entries_map(tables.document_frequency.entries())),
        (TableName::TermOccurrence, Some(k)) => json!({ k: tables.term_occurrence.get(k) }),
        (TableName::TermOccurrence, None) => json!(entries_map(tables.term_occurrence.entries())),
        (TableName::MostImportantScore, Some(k)) => json!({ k: tables.most_important_score.get(k) }),
        (TableName::MostImportantScore, None) => json!(entries_map(tables.most_important_score.entries())),
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn entries_map<V: serde::Serialize>(entries: Vec<(String, V)>) -> serde_json::Map<String, serde_json::Value> {
    entries.into_iter().map(|(k, v)| (k, json!(v))).collect()
}
