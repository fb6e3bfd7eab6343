//! Photos Backup - CLI
//!
//! Command-line front end for export, validation, restore and scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use photos_backup::{
    AllowAll, ArchiveHandle, Baseline, BackupEngine, EngineConfig, ExportMode, FsPhotoStorage,
    Frequency, ImportPolicy, LibraryStore, PhotoStorage, ProgressUpdate, Schedule, SqliteLibrary,
};

#[derive(Parser)]
#[command(name = "photos-backup")]
#[command(version = photos_backup::VERSION)]
#[command(about = "Photos Backup - export, validate and restore a family photo library")]
struct Cli {
    /// Library database
    #[arg(long, default_value = "./library.db")]
    library: PathBuf,

    /// Photo storage root
    #[arg(long, default_value = "./photos-store")]
    storage: PathBuf,

    /// Engine config (JSON)
    #[arg(long, default_value = "./backup-config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a backup archive
    Export {
        /// Archive path
        out: PathBuf,

        /// Only photos created after this time (epoch millis)
        #[arg(long, conflicts_with = "since_backup")]
        since: Option<i64>,

        /// Only photos created after the given backup
        #[arg(long)]
        since_backup: Option<String>,
    },

    /// Check an archive without touching the library
    Validate {
        archive: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Restore an archive into the library
    Restore {
        archive: PathBuf,

        /// replace | merge | merge-skip-duplicates
        #[arg(long)]
        policy: ImportPolicy,
    },

    /// List past backups
    History,

    /// Scheduled backups
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Print the current schedule
    Show,

    /// Replace the schedule
    Set {
        #[arg(long)]
        enabled: bool,

        /// daily | weekly | monthly
        #[arg(long, default_value = "weekly")]
        frequency: Frequency,

        #[arg(long)]
        incremental: bool,

        /// Only run on unmetered networks
        #[arg(long)]
        unmetered: bool,
    },

    /// Run the scheduler until Ctrl-C
    Run {
        /// Directory receiving scheduled archives
        #[arg(long)]
        dest: PathBuf,

        #[arg(long, default_value_t = 60)]
        poll_secs: u64,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn open_engine(cli: &Cli) -> Result<Arc<BackupEngine>> {
    let config = EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let store: Arc<dyn LibraryStore> = Arc::new(
        SqliteLibrary::open(&cli.library)
            .with_context(|| format!("opening library {}", cli.library.display()))?,
    );
    let storage: Arc<dyn PhotoStorage> = Arc::new(
        FsPhotoStorage::new(&cli.storage)
            .with_context(|| format!("opening photo storage {}", cli.storage.display()))?,
    );
    let engine = BackupEngine::new(store, storage, Arc::new(AllowAll), config)?;
    Ok(Arc::new(engine))
}

fn print_progress(update: &ProgressUpdate) {
    println!(
        "  [{:>5}/{:<5}] {}",
        update.processed, update.total, update.operation
    );
}

fn run(cli: Cli) -> Result<()> {
    let engine = open_engine(&cli)?;

    match cli.command {
        Commands::Export { out, since, since_backup } => {
            let mode = match (since, since_backup) {
                (Some(ts), _) => ExportMode::Incremental(Baseline::Since(ts)),
                (None, Some(id)) => ExportMode::Incremental(Baseline::Backup(id)),
                (None, None) => ExportMode::Full,
            };
            println!("📦 Exporting library to {}", out.display());

            let summary = engine
                .build_archive(mode, &out)?
                .wait_with(print_progress)
                .context("export failed")?;

            println!("✅ Backup {} written", summary.backup_id);
            println!("   Categories: {}", summary.category_count);
            println!("   Photos:     {}", summary.photo_count);
            println!("   Size:       {} bytes", summary.size_bytes);
            if summary.omitted > 0 {
                println!("⚠️ {} photos could not be read and were omitted:", summary.omitted);
                for error in &summary.errors {
                    println!("   - {}", error);
                }
            }
        }

        Commands::Validate { archive, json } => {
            let report = engine.validate_archive(&ArchiveHandle::new(&archive));
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let mark = if report.is_valid { "✅" } else { "❌" };
                println!("{} {}", mark, archive.display());
                println!("   Categories: {}", report.category_count);
                println!("   Photos:     {}", report.photo_count);
                for error in &report.errors {
                    println!("   error:   {}", error);
                }
                for warning in &report.warnings {
                    println!("   warning: {}", warning);
                }
            }
            if !report.is_valid {
                anyhow::bail!("archive is not valid");
            }
        }

        Commands::Restore { archive, policy } => {
            println!("📥 Restoring {} ({})", archive.display(), policy);

            let summary = engine
                .restore_archive(&ArchiveHandle::new(&archive), policy)?
                .wait_with(print_progress)
                .context("restore failed")?;

            println!("✅ Restore complete");
            println!(
                "   Categories: {} created, {} reused",
                summary.categories_created, summary.categories_reused
            );
            println!("   Photos:     {} imported", summary.photos_imported);
            if summary.skipped_total() > 0 {
                println!(
                    "⚠️ {} skipped ({} duplicates, {} failed)",
                    summary.skipped_total(),
                    summary.photos_skipped_duplicate,
                    summary.photos_failed
                );
                for error in &summary.errors {
                    println!("   - {}", error);
                }
            }
        }

        Commands::History => {
            let history = engine.backup_history();
            if history.is_empty() {
                println!("📭 No backups yet");
            }
            for entry in history.iter().rev() {
                let mark = if entry.success { "✅" } else { "❌" };
                println!(
                    "{} {} {:?} {} photos {} bytes  {}",
                    mark,
                    entry.id,
                    entry.mode,
                    entry.photo_count,
                    entry.size_bytes,
                    entry.path.display()
                );
                if let Some(error) = &entry.error {
                    println!("   {}", error);
                }
            }
        }

        Commands::Schedule { action } => run_schedule(engine, action)?,
    }

    Ok(())
}

fn run_schedule(engine: Arc<BackupEngine>, action: ScheduleAction) -> Result<()> {
    match action {
        ScheduleAction::Show => {
            println!("{}", serde_json::to_string_pretty(&engine.schedule())?);
        }

        ScheduleAction::Set { enabled, frequency, incremental, unmetered } => {
            engine.set_schedule(Schedule {
                enabled,
                frequency,
                require_unmetered_network: unmetered,
                incremental,
                last_run_at: None,
            })?;
            println!("✅ Schedule saved");
        }

        ScheduleAction::Run { dest, poll_secs } => {
            run_scheduler_until_ctrl_c(engine, &dest, Duration::from_secs(poll_secs.max(1)))?;
        }
    }
    Ok(())
}

fn run_scheduler_until_ctrl_c(engine: Arc<BackupEngine>, dest: &Path, poll_every: Duration) -> Result<()> {
    std::fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let (stop, shutdown) = tokio::sync::watch::channel(false);
        let scheduler = tokio::spawn(photos_backup::schedule::run_scheduler(
            engine,
            dest.to_path_buf(),
            poll_every,
            shutdown,
        ));

        println!("⏰ Scheduler running, Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        let _ = stop.send(true);
        scheduler.await?;
        Ok::<_, anyhow::Error>(())
    })
}
