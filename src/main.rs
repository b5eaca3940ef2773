//! Catalog maintenance CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use mediatheca::config::Config;
use mediatheca::db::{migrations, CatalogDb, SCHEMA_VERSION};
use mediatheca::extract::DefaultExtractor;
use mediatheca::indexer::{Indexer, WalkdirScanner};
use mediatheca::logging;

#[derive(Parser)]
#[command(name = "mediatheca", version, about = "Personal media catalog engine")]
struct Cli {
    /// Path to the catalog database (defaults to the configured location)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to the config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Extract metadata for rows still missing dimensions or dates
    BackfillMetadata {
        /// Worker threads for extraction (reserved; extraction is
        /// per-file timed either way)
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Per-file timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Rows fetched per pass
        #[arg(long, default_value_t = 200)]
        batch: usize,
        /// Stop after this many rows
        #[arg(long)]
        limit: Option<i64>,
        /// Only report what would be done
        #[arg(long)]
        dry_run: bool,
    },
    /// Print catalog statistics
    Stats,
    /// Run the engine integrity check and report orphaned rows
    IntegrityCheck,
    /// Compact the database file and refresh statistics
    Vacuum,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _ = logging::init(Some(Config::data_dir().join("logs")));

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };
    if let Some(db) = cli.db {
        config.database.path = Some(db);
    }

    let code = match run(&cli.command, &config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            2
        }
    };
    CatalogDb::close_all();
    ExitCode::from(code)
}

fn run(command: &Command, config: &Config) -> Result<u8> {
    match command {
        Command::Migrate => cmd_migrate(config),
        Command::BackfillMetadata {
            workers,
            timeout,
            batch,
            limit,
            dry_run,
        } => cmd_backfill(config, *workers, *timeout, *batch, *limit, *dry_run),
        Command::Stats => cmd_stats(config),
        Command::IntegrityCheck => cmd_integrity_check(config),
        Command::Vacuum => cmd_vacuum(config),
    }
}

/// Exit codes: 0 migrations applied (or schema created), 1 nothing to do,
/// 2 failure.
fn cmd_migrate(config: &Config) -> Result<u8> {
    let db = CatalogDb::open(config.db_path(), false)?;
    let current = db.version()?;

    if current == "0.0.0" {
        db.initialize()?;
        println!("Created fresh schema at version {SCHEMA_VERSION}");
        return Ok(0);
    }
    if current == SCHEMA_VERSION {
        println!("Schema is up to date ({current}); nothing to do");
        return Ok(1);
    }

    let applied = db.with_conn(migrations::apply_pending)?;
    for migration in &applied {
        println!("Applied {} - {}", migration.version, migration.description);
    }
    println!("Schema now at version {}", db.version()?);

    // Zombie sweep and path cleanup piggyback on the maintenance entrypoint.
    let swept = db.recover_zombie_jobs()?;
    if swept > 0 {
        println!("Recovered {swept} zombie jobs");
    }
    let deduped = db.cleanup_duplicate_paths()?;
    if deduped > 0 {
        println!("Removed {deduped} duplicate path rows");
    }

    Ok(0)
}

fn cmd_backfill(
    config: &Config,
    _workers: usize,
    timeout: Option<u64>,
    batch: usize,
    limit: Option<i64>,
    dry_run: bool,
) -> Result<u8> {
    let db = CatalogDb::open(config.db_path(), true)?;

    let mut metadata_config = config.metadata.clone();
    metadata_config.backfill_batch = batch;
    if let Some(timeout) = timeout {
        metadata_config.extract_timeout_secs = timeout;
    }

    let indexer = Indexer::new(
        db.clone(),
        Arc::new(WalkdirScanner {
            follow_symlinks: config.scanner.follow_symlinks,
        }),
        Arc::new(DefaultExtractor),
        config.scanner.clone(),
        metadata_config,
    );

    let cancel = AtomicBool::new(false);
    let outcome = indexer.backfill_missing_metadata(limit, dry_run, &cancel)?;
    if dry_run {
        println!("{} rows need metadata extraction", outcome.processed);
    } else {
        println!(
            "Processed {} rows: {} extracted, {} failed",
            outcome.processed, outcome.succeeded, outcome.failed
        );
        let filled = indexer.backfill_created_fields(batch)?;
        if filled > 0 {
            println!("Backfilled created dates on {filled} rows");
        }
    }
    Ok(0)
}

fn cmd_stats(config: &Config) -> Result<u8> {
    let db = CatalogDb::open(config.db_path(), true)?;

    println!("Schema version: {}", db.version()?);

    let stats = db.metadata_stats()?;
    println!("Photos: {} total", stats.total);
    println!(
        "  metadata: {} ok, {} pending, {} retrying, {} failed",
        stats.ok, stats.pending, stats.failed_retry, stats.failed
    );

    for project in db.all_projects()? {
        let photos = db.count_photos(project.id)?;
        let videos = db.count_videos(project.id)?;
        println!(
            "Project {} ({}): {} photos, {} videos",
            project.id, project.name, photos, videos
        );
    }

    let index = db.semantic_index_summary()?;
    if index.is_empty() {
        println!("Semantic index: empty");
    } else {
        for (model, artifact_version, embedded) in index {
            println!("Semantic index [{model}] v{artifact_version}: {embedded} embeddings");
        }
    }

    let jobs = db.job_counts()?;
    if !jobs.is_empty() {
        let summary: Vec<String> = jobs.iter().map(|(s, n)| format!("{n} {s}")).collect();
        println!("Jobs: {}", summary.join(", "));
    }

    Ok(0)
}

fn cmd_integrity_check(config: &Config) -> Result<u8> {
    let db = CatalogDb::open(config.db_path(), true)?;

    let verdict: String = db.with_conn(|conn| {
        Ok(conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?)
    })?;
    println!("integrity_check: {verdict}");

    let orphans = db.orphaned_photo_count()?;
    if orphans > 0 {
        println!("{orphans} photo rows reference a missing folder");
    }

    if verdict == "ok" && orphans == 0 {
        println!("No problems found");
        Ok(0)
    } else {
        Ok(2)
    }
}

fn cmd_vacuum(config: &Config) -> Result<u8> {
    let db = CatalogDb::open(config.db_path(), true)?;
    db.with_conn(|conn| {
        conn.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    })?;
    println!("Database compacted");
    Ok(0)
}
