//! # docpack CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docpack build <source> [--intent <name or file>]` | Chunk, cluster and summarize a tree into an archive |
//! | `docpack inspect <archive>` | Print what an archive contains |
//! | `docpack intent check <name or file>` | Validate an intent and list its schema fields |
//! | `docpack intent schema <name or file>` | Print the compiled JSON Schemas of an intent |
//!
//! Built-in intents: `minimal` (the default), `onboarding`, `index-only`.
//!
//! ## Examples
//!
//! ```bash
//! # Build with defaults (minimal intent, local Ollama, zip output in the cwd)
//! docpack build ./my-project
//!
//! # Custom intent file
//! docpack build ./my-project --intent intent.toml
//!
//! # Hierarchical clustering into 6 groups, directory output, no raw files
//! docpack build ./my-project --intent intent.toml --clusters 6 \
//!     --method hierarchical --format directory --no-raw
//!
//! # Estimate the work without calling any model
//! docpack build ./my-project --intent intent.toml --dry-run
//! ```
//!
//! Errors are printed as `error [<Kind>]: <message>` and exit with status 1.

use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use docpack::archive::write_archive;
use docpack::config::{load_config, Config};
use docpack::embedding::create_embedder;
use docpack::error::DocpackError;
use docpack::generation::{create_generator, DisabledGenerator, StructuredGenerator};
use docpack::ingest::load_source;
use docpack::inspect::run_inspect;
use docpack::intent::{
    resolve_intent, IntentSpec, CHUNK_SCHEMA_NAME, CLUSTER_SCHEMA_NAME, DEFAULT_INTENT,
    PROJECT_SCHEMA_NAME,
};
use docpack::pipeline::{plan_chunks, run_pipeline};
use docpack::progress::{ProgressEvent, ProgressMode, Stage};
use docpack::schema::TypeDescriptor;

/// docpack: chunk, cluster and summarize a source tree into a portable
/// `.docpack` archive.
#[derive(Parser)]
#[command(name = "docpack", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an archive from a directory or a .zip file.
    ///
    /// Settings come from `--config` (TOML) when given, defaults otherwise.
    /// Flags override individual settings.
    Build(BuildArgs),

    /// Print the manifest, metrics, clusters and project summary of an archive.
    Inspect {
        /// Archive file or directory.
        archive: PathBuf,

        /// Emit one JSON object instead of the human report.
        #[arg(long)]
        json: bool,
    },

    /// Work with intent files.
    Intent {
        #[command(subcommand)]
        action: IntentAction,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Directory or .zip file to ingest.
    source: PathBuf,

    /// Built-in intent name, or an intent file (TOML, or JSON when the
    /// extension is .json).
    #[arg(long, default_value = DEFAULT_INTENT)]
    intent: String,

    /// Output path. Defaults to `<source stem>.docpack` in the current directory.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Token budget per chunk.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Token overlap between consecutive chunks of a file.
    #[arg(long)]
    overlap: Option<usize>,

    /// Number of clusters.
    #[arg(long)]
    clusters: Option<usize>,

    /// Clustering method: kmeans or hierarchical.
    #[arg(long)]
    method: Option<String>,

    /// Leave the original files out of the archive.
    #[arg(long)]
    no_raw: bool,

    /// Container format: zip or directory.
    #[arg(long)]
    format: Option<String>,

    /// Show file, chunk and token counts without calling any model.
    #[arg(long)]
    dry_run: bool,

    /// Progress on stderr: off, human or json. Defaults to human on a TTY.
    #[arg(long)]
    progress: Option<String>,
}

#[derive(Subcommand)]
enum IntentAction {
    /// Validate an intent and list the fields of each schema.
    Check {
        /// Built-in intent name or intent file.
        intent: String,
    },

    /// Print the compiled JSON Schemas of an intent.
    Schema {
        /// Built-in intent name or intent file.
        intent: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Build(args) => run_build(args).await,
        Commands::Inspect { archive, json } => {
            run_inspect(&archive, json).map_err(anyhow::Error::from)
        }
        Commands::Intent { action } => match action {
            IntentAction::Check { intent } => run_intent_check(&intent),
            IntentAction::Schema { intent } => run_intent_schema(&intent),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<DocpackError>() {
                Some(e) => eprintln!("error [{}]: {}", e.kind(), e),
                None => eprintln!("error: {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

fn resolve_config(args: &BuildArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    if let Some(n) = args.chunk_size {
        config.chunking.max_tokens = n;
    }
    if let Some(n) = args.overlap {
        config.chunking.overlap_tokens = n;
    }
    if let Some(k) = args.clusters {
        config.clustering.k = k;
    }
    if let Some(method) = &args.method {
        config.clustering.method = method.clone();
    }
    if args.no_raw {
        config.output.include_raw_files = false;
    }
    if let Some(format) = &args.format {
        config.output.format = format.clone();
    }

    config.validate()?;
    Ok(config)
}

fn default_output(source: &Path) -> PathBuf {
    let stem = std::fs::canonicalize(source)
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_else(|| "archive".to_string());
    PathBuf::from(format!("{}.docpack", stem))
}

async fn run_build(args: BuildArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;
    let format = config.container_format()?;
    let intent = resolve_intent(&args.intent)?;
    let mode = match &args.progress {
        Some(mode) => mode.parse::<ProgressMode>()?,
        None => ProgressMode::default_for_tty(),
    };
    let progress = mode.reporter();

    progress.report(ProgressEvent::Started {
        stage: Stage::Ingesting,
        detail: args.source.display().to_string(),
    });
    let (source, files) = load_source(&args.source, &config.ingest, progress.as_ref())?;

    if args.dry_run {
        let plan = plan_chunks(&config, &files, progress.as_ref());
        println!("Dry run: {}", args.source.display());
        println!("  Files:    {} ({} skipped)", plan.files, plan.skipped.len());
        println!("  Chunks:   {}", plan.chunks);
        println!("  Tokens:   {}", plan.total_tokens);
        println!("  Clusters: {}", plan.clusters);
        return Ok(());
    }

    let embedder = create_embedder(&config.embedding)?;
    let generator: Arc<dyn StructuredGenerator> = if intent.needs_generator() {
        create_generator(&config.generation)?
    } else {
        Arc::new(DisabledGenerator)
    };

    let archive = run_pipeline(
        &config,
        intent,
        &source,
        files,
        embedder,
        generator,
        progress.as_ref(),
    )
    .await?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.source));
    progress.report(ProgressEvent::Started {
        stage: Stage::Writing,
        detail: output.display().to_string(),
    });
    write_archive(&archive, &output, format)?;

    let m = &archive.manifest.metrics;
    println!(
        "Wrote {} ({} files, {} chunks, {} clusters)",
        output.display(),
        m.file_count,
        m.chunk_count,
        m.cluster_count
    );
    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn compiled_schemas(intent: &IntentSpec) -> anyhow::Result<Vec<(&'static str, TypeDescriptor)>> {
    let compiled = intent.compile()?;
    Ok([
        (PROJECT_SCHEMA_NAME, compiled.project),
        (CLUSTER_SCHEMA_NAME, compiled.cluster),
        (CHUNK_SCHEMA_NAME, compiled.chunk),
    ]
    .into_iter()
    .filter_map(|(name, descriptor)| descriptor.map(|d| (name, d)))
    .collect())
}

fn run_intent_check(arg: &str) -> anyhow::Result<()> {
    let intent = resolve_intent(arg)?;
    println!("Intent: {}", intent.name);
    if !intent.description.is_empty() {
        println!("  {}", intent.description);
    }
    println!("  max_chunks_per_cluster:  {}", intent.max_chunks_per_cluster);
    println!(
        "  cross-file inference:    {}",
        yes_no(intent.allow_cross_file_inference)
    );
    println!(
        "  global summary:          {}",
        yes_no(intent.allow_global_summary)
    );

    let schemas = compiled_schemas(&intent)?;
    if schemas.is_empty() {
        println!("  no schemas declared: the archive will carry no summaries");
    }
    for (name, descriptor) in &schemas {
        println!("  {}: {}", name, descriptor.field_names().join(", "));
    }
    Ok(())
}

fn run_intent_schema(arg: &str) -> anyhow::Result<()> {
    let intent = resolve_intent(arg)?;
    let mut out = Map::new();
    for (name, descriptor) in compiled_schemas(&intent)? {
        out.insert(name.to_string(), descriptor.to_json_schema());
    }
    println!("{}", serde_json::to_string_pretty(&Value::Object(out))?);
    Ok(())
}
