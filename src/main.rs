use anyhow::{bail, Context, Result};
use ariadne::config::{self, IngestConfig};
use ariadne::ingest::{IngestReport, IngestionDriver, Outcome, SourceSpec};
use ariadne::neo4j::{Neo4jSink, SinkConfig};
use ariadne::parser::Compression;
use ariadne::sink::{GraphSink, MemorySink};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "ariadne")]
#[command(about = "Stream Wikidata entity dumps into a Neo4j graph")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load an entity dump into the graph
    Load(LoadArgs),
    /// Create constraints and indexes only
    Schema(ConnectionArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum CompressionArg {
    Auto,
    None,
    Gzip,
    Bzip2,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Neo4j Bolt URI
    #[arg(long, env = "NEO4J_URI", default_value = config::DEFAULT_BOLT_URI)]
    bolt_uri: String,

    #[arg(long, env = "NEO4J_USER", default_value = config::DEFAULT_NEO4J_USER)]
    user: String,

    #[arg(long, env = "NEO4J_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Target database (server default if omitted)
    #[arg(long, env = "NEO4J_DATABASE")]
    database: Option<String>,

    /// Bolt connection pool size
    #[arg(long, default_value_t = config::DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
}

#[derive(Args)]
struct LoadArgs {
    /// Path to the entity dump (.xml, .xml.gz, .xml.bz2)
    #[arg(short, long)]
    input: PathBuf,

    /// Compression of the input; auto uses the file extension
    #[arg(long, value_enum, default_value_t = CompressionArg::Auto)]
    compression: CompressionArg,

    /// Entities per batch
    #[arg(long, default_value_t = config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Abort on the first malformed record instead of skipping it
    #[arg(long)]
    strict: bool,

    /// Total flush attempts per batch before giving up
    #[arg(long, default_value_t = config::DEFAULT_MAX_FLUSH_RETRIES)]
    max_flush_retries: u32,

    /// Timeout for a single sink call, in seconds
    #[arg(long, default_value_t = config::DEFAULT_FLUSH_TIMEOUT_SECS)]
    flush_timeout_secs: u64,

    /// Give up when the input yields no record for this many seconds
    #[arg(long, default_value_t = config::DEFAULT_READ_TIMEOUT_SECS)]
    read_timeout_secs: u64,

    /// Limit number of records to process (for testing)
    #[arg(long)]
    limit: Option<u64>,

    /// Resume from last checkpoint if available
    #[arg(long, requires = "checkpoint_dir")]
    resume: bool,

    /// Directory for the progress checkpoint
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Parse and extract into an in-memory graph; nothing is written to Neo4j
    #[arg(long)]
    dry_run: bool,

    /// Write the batch that could not be flushed to this file as JSON
    #[arg(long)]
    failed_batch_out: Option<PathBuf>,

    #[command(flatten)]
    connection: ConnectionArgs,
}

impl LoadArgs {
    fn source(&self) -> SourceSpec {
        let source = SourceSpec::new(&self.input);
        match self.compression {
            CompressionArg::Auto => source,
            CompressionArg::None => source.with_compression(Compression::None),
            CompressionArg::Gzip => source.with_compression(Compression::Gzip),
            CompressionArg::Bzip2 => source.with_compression(Compression::Bzip2),
        }
    }

    fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            batch_size: self.batch_size,
            strict_mode: self.strict,
            max_flush_retries: self.max_flush_retries,
            flush_timeout: Duration::from_secs(self.flush_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            limit: self.limit,
            resume: self.resume,
            checkpoint_dir: self.checkpoint_dir.clone(),
            ..Default::default()
        }
    }
}

impl From<&ConnectionArgs> for SinkConfig {
    fn from(args: &ConnectionArgs) -> Self {
        SinkConfig {
            uri: args.bolt_uri.clone(),
            user: args.user.clone(),
            password: args.password.clone(),
            database: args.database.clone(),
            max_connections: args.max_connections,
        }
    }
}

fn make_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

async fn ingest<S: GraphSink>(args: &LoadArgs, sink: S) -> IngestReport {
    let driver = IngestionDriver::new(args.ingest_config(), sink);
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            on_signal.cancel();
        }
    });

    let pb = make_spinner();
    let stats = driver.stats();
    let ticker = tokio::spawn({
        let pb = pb.clone();
        async move {
            loop {
                pb.set_message(format!(
                    "{} records, {} entities, {} relationships committed",
                    stats.records(),
                    stats.entities(),
                    stats.relationships()
                ));
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    });

    let report = driver.run(&args.source(), cancel).await;
    ticker.abort();
    pb.finish_and_clear();
    report
}

async fn run_load(args: LoadArgs) -> Result<()> {
    let report = if args.dry_run {
        info!("Dry run, loading into an in-memory graph");
        ingest(&args, MemorySink::new()).await
    } else {
        let sink = Neo4jSink::connect(&SinkConfig::from(&args.connection)).await?;
        ingest(&args, sink).await
    };

    println!();
    println!("=== Summary ===");
    println!("Duration:           {:.2}s", report.duration.as_secs_f64());
    println!("Records seen:       {}", report.records_seen);
    println!("Records skipped:    {}", report.records_skipped);
    println!("Entities written:   {}", report.entities_committed);
    println!("Relationships:      {}", report.relationships_committed);
    println!("Batches flushed:    {}", report.flushes);
    println!("Flush retries:      {}", report.flush_retries);

    match report.outcome {
        Outcome::Completed => Ok(()),
        Outcome::Failed {
            cause,
            batch_index,
            batch,
        } => {
            if let (Some(path), Some(batch)) = (&args.failed_batch_out, &batch) {
                let json = serde_json::to_string_pretty(batch)?;
                fs::write(path, json).with_context(|| {
                    format!("Failed to write failed batch to {}", path.display())
                })?;
                info!(path = %path.display(), "Failed batch written");
            }
            match batch_index {
                Some(index) => bail!("Ingestion failed at batch {index}: {cause}"),
                None => bail!("Ingestion failed: {cause}"),
            }
        }
    }
}

async fn run_schema(args: ConnectionArgs) -> Result<()> {
    let sink = Neo4jSink::connect(&SinkConfig::from(&args)).await?;
    sink.ensure_schema()
        .await
        .context("Failed to create constraints and indexes")?;
    println!("Schema ready on {}", args.bolt_uri);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .thread_name("ariadne-worker")
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(async {
        match cli.command {
            Commands::Load(args) => run_load(args).await,
            Commands::Schema(args) => run_schema(args).await,
        }
    });
    // A reader stuck on a stalled input must not hold the process open.
    rt.shutdown_timeout(Duration::from_secs(1));

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
