// ==============================================================================
// main.rs - PGx Report Processor Entry Point
// ==============================================================================
// Description: Command line for flattening reports and serving pages
// Created: 2025-11-27
// Modified: 2025-12-09
// Version: 1.2.0
// ==============================================================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pgx_processor::config::{index_key, ExtractionConfig, PageLimits, ReaderConfig, ToolPaths};
use pgx_processor::jobs::{InMemoryJobStatusStore, JobStatusStore, JobTracker, PgJobStatusStore};
use pgx_processor::pagination::PageIndex;
use pgx_processor::reader::PagedReader;
use pgx_processor::scratch::ScratchSpace;
use pgx_processor::storage::{LocalObjectStore, ObjectStore};
use pgx_processor::zygosity::{BcftoolsResolver, CachedResolver, ZygosityResolver};
use pgx_processor::{JobRequest, PostProcessor, RunSummary};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory of the object store
    #[arg(long, env = "STORAGE_ROOT", default_value = "/data/objects")]
    storage_root: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flatten one report into a paginated artifact
    Process(ProcessArgs),

    /// Print one page of an artifact as JSON
    Page {
        /// Object key of the artifact
        #[arg(short, long)]
        key: String,

        /// Page number (1-based)
        #[arg(short, long)]
        page: Option<u32>,

        /// Artifacts at or below this size are served whole
        #[arg(long, default_value_t = ReaderConfig::default().small_artifact_threshold)]
        small_artifact_threshold: u64,
    },

    /// Rebuild and store the page index of an existing artifact
    Index {
        /// Object key of the artifact
        #[arg(short, long)]
        key: String,

        /// Base directory for the local copy of the artifact
        #[arg(long, env = "SCRATCH_DIR", default_value = "/tmp/pgx-processor")]
        scratch_dir: PathBuf,

        #[command(flatten)]
        limits: LimitArgs,
    },
}

#[derive(clap::Args, Debug)]
struct LimitArgs {
    /// Maximum records per page
    #[arg(long, env = "PAGE_MAX_LINES", default_value_t = PageLimits::default().max_lines)]
    max_lines: usize,

    /// Maximum bytes per page
    #[arg(long, env = "PAGE_MAX_BYTES", default_value_t = PageLimits::default().max_bytes)]
    max_bytes: u64,
}

impl LimitArgs {
    fn limits(&self) -> Result<PageLimits> {
        Ok(PageLimits::new(self.max_lines, self.max_bytes)?)
    }
}

#[derive(clap::Args, Debug)]
struct ProcessArgs {
    /// Job ID to process
    #[arg(short, long)]
    job_id: uuid::Uuid,

    /// Project the job belongs to
    #[arg(short, long)]
    project: String,

    /// Object key of the source report
    #[arg(short, long)]
    source_key: String,

    /// Local path of the indexed source VCF used for zygosity lookups
    #[arg(long)]
    source_vcf: PathBuf,

    /// Suffix of the result object key
    #[arg(long, env = "RESULT_SUFFIX", default_value = ".jsonl")]
    result_suffix: String,

    /// Organisation pairs, e.g. [{"gene": "CPIC", "drug": "CPIC Guideline Annotation"}]
    #[arg(long, env = "ORGANISATIONS")]
    organisations: String,

    /// Comma-separated gene allow-list
    #[arg(long, env = "GENES")]
    genes: String,

    /// Comma-separated drug allow-list
    #[arg(long, env = "DRUGS")]
    drugs: String,

    #[arg(long, env = "BCFTOOLS", default_value = "bcftools")]
    bcftools: PathBuf,

    #[arg(long, env = "TABIX", default_value = "tabix")]
    tabix: PathBuf,

    /// Base directory for per-job scratch space
    #[arg(long, env = "SCRATCH_DIR", default_value = "/tmp/pgx-processor")]
    scratch_dir: PathBuf,

    /// Database URL for job status (in-memory tracking when absent)
    #[arg(long, env)]
    database_url: Option<String>,

    /// Step name recorded when a job fails
    #[arg(long, env = "STEP_NAME", default_value = "postprocessor")]
    step_name: String,

    #[command(flatten)]
    limits: LimitArgs,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pgx_processor=info".into());

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn job_status_store(database_url: Option<&str>) -> Result<Arc<dyn JobStatusStore>> {
    let Some(url) = database_url else {
        warn!("DATABASE_URL not set, job status is tracked in memory only");
        return Ok(Arc::new(InMemoryJobStatusStore::new()));
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!("Connected to database");

    let store = PgJobStatusStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("Failed to prepare job status table")?;
    Ok(Arc::new(store))
}

/// Run one job. Arguments are validated before the job is marked pending;
/// every later failure is recorded against the job.
async fn run_process(
    store: Arc<dyn ObjectStore>,
    statuses: Arc<dyn JobStatusStore>,
    args: ProcessArgs,
) -> Result<RunSummary> {
    let config = ExtractionConfig::from_parts(&args.organisations, &args.genes, &args.drugs)
        .context("Invalid extraction configuration")?;
    let limits = args.limits.limits()?;
    let tools = ToolPaths {
        bcftools: args.bcftools,
        tabix: args.tabix,
    };

    let tracker = JobTracker::new(statuses, args.step_name);
    let request = JobRequest::new(args.job_id, &args.project, &args.source_key, &args.result_suffix);
    tracker.mark_pending(request.job_id).await?;

    let resolver: Box<dyn ZygosityResolver> = match BcftoolsResolver::open(&args.source_vcf, &tools) {
        Ok(resolver) => Box::new(CachedResolver::new(resolver)),
        Err(e) => {
            tracker.record_failure(request.job_id, &e.to_string()).await;
            return Err(e).context("Failed to open source VCF");
        }
    };

    let processor = PostProcessor::new(store, config, limits, args.scratch_dir);
    Ok(processor.execute(&request, resolver, &tracker).await?)
}

/// Re-derive the page index of a stored artifact from a local copy
async fn rebuild_index(
    store: &dyn ObjectStore,
    key: &str,
    limits: PageLimits,
    scratch_dir: &Path,
) -> Result<PageIndex> {
    let scratch = ScratchSpace::create(scratch_dir, &format!("index-{}", uuid::Uuid::new_v4()))?;
    let result = index_artifact(store, key, limits, &scratch).await;
    let discarded = scratch.discard().await;

    let index = result?;
    discarded?;
    Ok(index)
}

async fn index_artifact(
    store: &dyn ObjectStore,
    key: &str,
    limits: PageLimits,
    scratch: &ScratchSpace,
) -> Result<PageIndex> {
    let local = scratch.file("artifact.jsonl");
    let size = store
        .download_file(key, &local)
        .await
        .with_context(|| format!("Failed to download {}", key))?;

    let index = tokio::task::spawn_blocking(move || -> Result<PageIndex> {
        let reader = BufReader::new(File::open(&local).context("Failed to open artifact copy")?);
        Ok(PageIndex::build_from_reader(reader, limits)?)
    })
    .await??;
    anyhow::ensure!(
        index.total_bytes() == size,
        "Index of {} covers {} of {} bytes",
        key,
        index.total_bytes(),
        size
    );

    store.put(&index_key(key), index.to_compressed()?).await?;
    info!("Indexed {} ({} bytes): {} pages", key, size, index.len());
    Ok(index)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(args.log_format);

    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&args.storage_root));

    match args.command {
        Command::Process(process) => {
            let statuses = job_status_store(process.database_url.as_deref()).await?;
            let summary = run_process(store, statuses, process).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Page {
            key,
            page,
            small_artifact_threshold,
        } => {
            let reader = PagedReader::new(
                store,
                ReaderConfig {
                    small_artifact_threshold,
                },
            );
            let response = match reader.read_page(&key, page).await {
                Ok(response) => response,
                Err(e) if e.is_client_error() => {
                    warn!("Rejected page request for {}: {}", key, e);
                    return Err(e.into());
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to read page of {}", key)),
            };
            println!("{}", serde_json::to_string(&response)?);
            Ok(())
        }
        Command::Index {
            key,
            scratch_dir,
            limits,
        } => {
            rebuild_index(store.as_ref(), &key, limits.limits()?, &scratch_dir).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgx_processor::jobs::JobStatus;
    use pgx_processor::pagination::PagedWriter;
    use tempfile::TempDir;

    fn process_args(scratch: &Path, extra: &[&str]) -> ProcessArgs {
        let scratch = scratch.to_string_lossy().to_string();
        let mut argv = vec![
            "pgx-processor",
            "process",
            "--job-id",
            "6f0c7a52-3b1e-4d5e-9a57-1c2d3e4f5a6b",
            "--project",
            "proj",
            "--source-key",
            "projects/proj/pharmcat/report.json",
            "--source-vcf",
            "/nonexistent/sample.vcf.gz",
            "--organisations",
            r#"[{"gene": "CPIC", "drug": "CPIC Guideline Annotation"}]"#,
            "--genes",
            "CYP2C19",
            "--drugs",
            "clopidogrel",
            "--tabix",
            "/nonexistent/bin/tabix",
            "--scratch-dir",
            scratch.as_str(),
        ];
        argv.extend_from_slice(extra);

        match Args::try_parse_from(argv).unwrap().command {
            Command::Process(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_limits_rejected_before_pending() {
        let dir = TempDir::new().unwrap();
        let statuses = Arc::new(InMemoryJobStatusStore::new());
        let store = Arc::new(LocalObjectStore::new(dir.path().join("objects")));

        let args = process_args(dir.path(), &["--max-lines", "0"]);
        assert!(run_process(store, statuses.clone(), args).await.is_err());

        // Nothing was left pending
        assert!(statuses.updates().is_empty());
    }

    #[tokio::test]
    async fn test_unopenable_vcf_fails_job() {
        let dir = TempDir::new().unwrap();
        let statuses = Arc::new(InMemoryJobStatusStore::new());
        let store = Arc::new(LocalObjectStore::new(dir.path().join("objects")));

        let args = process_args(dir.path(), &[]);
        let err = run_process(store, statuses.clone(), args).await.unwrap_err();
        assert!(format!("{:#}", err).contains("tabix"));

        let updates = statuses.updates();
        let states: Vec<_> = updates.iter().map(|(_, update)| update.status).collect();
        assert_eq!(states, vec![JobStatus::Pending, JobStatus::Failed]);
    }

    #[tokio::test]
    async fn test_rebuild_index_from_stored_artifact() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path().join("objects"));
        let scratch = dir.path().join("scratch");
        let limits = PageLimits::new(2, 1_000_000).unwrap();

        let mut writer = PagedWriter::new(Vec::new(), limits);
        for i in 0..5 {
            let line = serde_json::to_vec(&serde_json::json!({ "type": "variant", "n": i })).unwrap();
            writer.write_record(&line).unwrap();
        }
        let (bytes, expected) = writer.finish().unwrap();
        let key = "projects/proj/clinical-workflows/job.jsonl";
        store.put(key, bytes).await.unwrap();

        let index = rebuild_index(&store, key, limits, &scratch).await.unwrap();
        assert_eq!(index, expected);

        let stored = store.get(&index_key(key), None).await.unwrap();
        assert_eq!(PageIndex::from_compressed(&stored).unwrap(), expected);

        // The local copy does not outlive the command
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }
}
