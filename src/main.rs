use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trackmatch::models::{LibraryFile, Match, RunMode, RunSummary, Track, UnmatchedTrack};
use trackmatch::pipeline::Pipeline;
use trackmatch::progress::set_log_only;
use trackmatch::safety::validate_report_path;
use trackmatch::store::Store;
use trackmatch::config;

#[derive(Parser)]
#[command(name = "trackmatch")]
#[command(about = "Match a remote playlist catalog against a local music library")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store schema
    Init(InitArgs),
    /// Load track and file snapshots (JSON arrays) into the store
    Import(ImportArgs),
    /// Run the matching pipeline for one provider
    Run(RunArgs),
    /// Show committed matches and unmatched tracks
    Report(ReportArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    db: PathBuf,
}

#[derive(Args, Debug)]
struct ImportArgs {
    db: PathBuf,

    #[arg(long)]
    provider: String,

    /// JSON array of tracks
    #[arg(long)]
    tracks: Option<PathBuf>,

    /// JSON array of library files
    #[arg(long)]
    files: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    db: PathBuf,

    #[arg(long)]
    provider: String,

    /// full re-evaluates every track, incremental only unmatched ones
    #[arg(long, default_value = "full")]
    mode: RunMode,

    /// TOML config file (TRACKMATCH_* env vars override it)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "0")]
    workers: usize,

    /// Hide progress bars and log periodic progress lines instead
    #[arg(long)]
    log_only: bool,

    /// Write the run summary as JSON
    #[arg(long)]
    stats_json: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ReportArgs {
    db: PathBuf,

    #[arg(long)]
    provider: String,

    /// Only these track ids (repeatable)
    #[arg(long = "track")]
    tracks: Vec<String>,

    /// Write matches and unmatched tracks as JSON instead of printing
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn init_tracing() {
    let fmt_layer = fmt::layer().with_target(true).with_level(true);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn open_store(db: &Path) -> Result<Store> {
    let store = Store::open(db).with_context(|| format!("Failed to open store {:?}", db))?;
    store.init_schema().context("Failed to create schema")?;
    Ok(store)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    serde_json::from_reader(BufReader::new(file)).with_context(|| format!("Failed to parse {:?}", path))
}

fn cmd_import(args: ImportArgs) -> Result<()> {
    let mut store = open_store(&args.db)?;

    if let Some(path) = &args.tracks {
        let mut tracks: Vec<Track> = read_json(path)?;
        for track in &mut tracks {
            track.provider = args.provider.clone();
        }
        let n = store.upsert_tracks(&tracks).context("Failed to import tracks")?;
        println!("Imported {} tracks for {}", n, args.provider);
    }

    if let Some(path) = &args.files {
        let files: Vec<LibraryFile> = read_json(path)?;
        let n = store.upsert_files(&files).context("Failed to import library files")?;
        println!("Imported {} library files", n);
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("\n{:=<60}", "");
    println!("Matching complete ({}, {})", summary.provider, summary.mode);
    println!("  Tracks: {}  Files: {}", summary.tracks, summary.files);
    println!(
        "  Matched: {} ({:.1}%)  Unmatched: {}",
        summary.matched,
        summary.match_rate(),
        summary.unmatched
    );
    if summary.carried_over > 0 {
        println!("  Carried over from previous runs: {}", summary.carried_over);
    }
    for count in &summary.per_strategy {
        println!("    {:<16} {}", count.strategy, count.matched);
    }
    for (tier, count) in &summary.per_confidence {
        println!("    {:<16} {}", tier, count);
    }
    if summary.integrity_warnings > 0 {
        println!("  Skipped for missing data: {}", summary.integrity_warnings);
    }
    println!("  Elapsed: {:.2}s", summary.elapsed_seconds);
    println!("{:=<60}", "");
}

fn cmd_run(args: RunArgs) -> Result<()> {
    set_log_only(args.log_only);

    if let Some(out) = &args.stats_json {
        validate_report_path(out, &args.db)?;
    }

    if args.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers)
            .build_global()
            .context("Failed to set thread pool size")?;
    }

    let config = config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let pipeline = Pipeline::new(&config).context("Invalid matching configuration")?;
    info!(target: "pipeline", order = ?pipeline.order(), threshold = config.fuzzy_threshold, "strategies resolved");

    let mut store = open_store(&args.db)?;
    let summary = pipeline
        .run(&mut store, &args.provider, args.mode)
        .with_context(|| format!("Matching run for '{}' failed", args.provider))?;

    if args.log_only {
        summary.log_summary();
    } else {
        print_summary(&summary);
    }

    if let Some(out) = &args.stats_json {
        summary.write_to_file(out)?;
        info!(target: "pipeline", path = %out.display(), "wrote run summary");
    }
    Ok(())
}

#[derive(Serialize)]
struct Report {
    matches: Vec<Match>,
    unmatched: Vec<UnmatchedTrack>,
}

fn cmd_report(args: ReportArgs) -> Result<()> {
    if let Some(out) = &args.output {
        validate_report_path(out, &args.db)?;
    }

    let store = open_store(&args.db)?;
    let matches = if args.tracks.is_empty() {
        store.load_matches(&args.provider)?
    } else {
        store.matches_for_tracks(&args.provider, &args.tracks)?
    };
    let mut unmatched = store.load_unmatched(&args.provider)?;
    if !args.tracks.is_empty() {
        unmatched.retain(|u| args.tracks.contains(&u.track_id));
    }

    if let Some(out) = &args.output {
        let json = serde_json::to_string_pretty(&Report { matches, unmatched })?;
        std::fs::write(out, json).with_context(|| format!("Failed to write {:?}", out))?;
        return Ok(());
    }

    println!("Matches for {} ({}):", args.provider, matches.len());
    println!("{:-<80}", "");
    for m in &matches {
        println!(
            "{} -> {}  score={:.3} {} [{}, {}]",
            m.track_id, m.file_id, m.score, m.confidence, m.method, m.evidence
        );
    }

    println!("\nUnmatched ({}):", unmatched.len());
    println!("{:-<80}", "");
    for u in &unmatched {
        match (&u.best_file_id, u.best_score) {
            (Some(file), Some(score)) => println!("{}  best={} ({:.3})", u.track_id, file, score),
            _ => println!("{}  no candidates", u.track_id),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Init(args) => {
            open_store(&args.db)?;
            println!("Initialized store at {:?}", args.db);
            Ok(())
        }
        Command::Import(args) => cmd_import(args),
        Command::Run(args) => cmd_run(args),
        Command::Report(args) => cmd_report(args),
    }
}
