use clap::{Parser, Subcommand};
use snapvault::backup::archive::ArchiveStore;
use snapvault::backup::config::VaultConfig;
use snapvault::backup::diff::ChangeKind;
use snapvault::backup::lock::OpLock;
use snapvault::backup::manager::{BackupManager, BackupOutcome};
use snapvault::backup::notifications::{LogNotification, Notification};
use snapvault::backup::result_error::result::Result;
use snapvault::backup::scheduler::BackupScheduler;
use snapvault::backup::versions::ConfigVersionManager;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

/// Backup subsystem with verified archives, config versioning and schedules
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create, list, restore and delete backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Manage saved versions of the configuration file
    #[command(subcommand)]
    Version(VersionCommand),
    /// Manage recurring backup schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Back up the source directory (or an explicit path) now
    Create {
        /// Path to back up instead of the configured source directory
        #[arg(short, long)]
        source: Option<PathBuf>,
    },
    /// List journaled backups, newest first
    List,
    /// Restore an archive over a target path
    Restore { archive: PathBuf, target: PathBuf },
    /// Delete a journaled backup archive
    Delete { archive: PathBuf },
}

#[derive(Subcommand, Debug)]
enum VersionCommand {
    /// Save the current configuration file as a new version
    Save {
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List saved versions, newest first
    List,
    /// Restore a saved version over the live configuration file
    Restore { id: Uuid },
    /// Show what changed between two saved versions
    Compare { old_id: Uuid, new_id: Uuid },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// Add a daily schedule at hour:minute UTC
    AddDaily { hour: u32, minute: u32 },
    /// Add a weekly schedule, weekday 0 is Sunday
    AddWeekly { weekday: u32, hour: u32, minute: u32 },
    /// List schedules
    List,
    Enable { id: Uuid },
    Disable { id: Uuid },
    Remove { id: Uuid },
    /// Run the scheduler worker in the foreground
    Run {
        /// Stop after this long, e.g. 90s or 2h. Runs until killed if absent
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        duration: Option<Duration>,
    },
    /// Execute one backup immediately, journaled as an on-demand run
    RunNow,
    /// List run history, oldest first
    History,
    ClearHistory,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{e}");
        exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = VaultConfig::load(&args.config)?;
    let store = Arc::new(
        ArchiveStore::builder()
            .compressor(config.compressor().clone())
            .exclude(config.exclude().clone())
            .build(),
    );
    let lock = OpLock::new();
    let sinks: Vec<Arc<dyn Notification>> = vec![Arc::new(LogNotification)];

    let manager = BackupManager::builder()
        .store(store.clone())
        .source_dir(config.source_dir().as_path())
        .backup_dir(config.backup_dir().as_path())
        .lock(lock.clone())
        .sinks(sinks.clone())
        .build()?;

    match args.command {
        Command::Backup(command) => run_backup(command, &manager),
        Command::Version(command) => {
            let versions = ConfigVersionManager::builder()
                .store(store)
                .config_file(config.config_file().as_path())
                .versions_dir(config.versions_dir().as_path())
                .max_versions(*config.max_versions())
                .lock(lock)
                .build()?;
            run_version(command, &versions)
        }
        Command::Schedule(command) => {
            let scheduler = BackupScheduler::builder()
                .manager(manager)
                .backup_dir(config.backup_dir().as_path())
                .retention(config.history().clone())
                .sinks(sinks)
                .build()?;
            run_schedule(command, &scheduler)
        }
    }
}

fn run_backup(command: BackupCommand, manager: &BackupManager) -> Result<()> {
    match command {
        BackupCommand::Create { source } => {
            let source = source.unwrap_or_else(|| manager.source_dir().to_path_buf());
            let record = manager.create(&source)?;
            match record.outcome() {
                BackupOutcome::Success => {
                    println!(
                        "{} {} {:?}",
                        record.id(),
                        record.outcome(),
                        record.archive_path().as_deref().unwrap_or(source.as_path())
                    );
                    Ok(())
                }
                BackupOutcome::Failed => {
                    error!(
                        "Backup of {:?} failed: {}",
                        source,
                        record.error_detail().as_deref().unwrap_or("unknown error")
                    );
                    exit(1);
                }
            }
        }
        BackupCommand::List => {
            for record in manager.list() {
                println!(
                    "{} {} {} {} bytes {}",
                    record.id(),
                    record.created_at().format("%Y-%m-%d %H:%M:%S"),
                    record.outcome(),
                    record.size_bytes(),
                    record
                        .archive_path()
                        .as_ref()
                        .map(|p| format!("{p:?}"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        BackupCommand::Restore { archive, target } => manager.restore(archive, target),
        BackupCommand::Delete { archive } => manager.delete(archive),
    }
}

fn run_version(command: VersionCommand, versions: &ConfigVersionManager) -> Result<()> {
    match command {
        VersionCommand::Save { description } => {
            let version = versions.save(description)?;
            println!("{} {:?}", version.id(), version.archive_path());
            Ok(())
        }
        VersionCommand::List => {
            for version in versions.list() {
                println!(
                    "{} {} {}",
                    version.id(),
                    version.timestamp().format("%Y-%m-%d %H:%M:%S"),
                    version.description().as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        VersionCommand::Restore { id } => {
            let version = versions.restore(id)?;
            println!("restored {}", version.id());
            Ok(())
        }
        VersionCommand::Compare { old_id, new_id } => {
            let entries = versions.compare(old_id, new_id)?;
            if entries.is_empty() {
                println!("no differences");
                return Ok(());
            }
            for entry in entries {
                match entry.change_kind() {
                    ChangeKind::Added => println!(
                        "+ {}: {}",
                        entry.key_path(),
                        entry.new_value().as_ref().unwrap_or(&serde_json::Value::Null)
                    ),
                    ChangeKind::Removed => println!(
                        "- {}: {}",
                        entry.key_path(),
                        entry.old_value().as_ref().unwrap_or(&serde_json::Value::Null)
                    ),
                    ChangeKind::Changed => println!(
                        "~ {}: {} -> {}",
                        entry.key_path(),
                        entry.old_value().as_ref().unwrap_or(&serde_json::Value::Null),
                        entry.new_value().as_ref().unwrap_or(&serde_json::Value::Null)
                    ),
                }
            }
            Ok(())
        }
    }
}

fn run_schedule(command: ScheduleCommand, scheduler: &BackupScheduler) -> Result<()> {
    match command {
        ScheduleCommand::AddDaily { hour, minute } => {
            let entry = scheduler.add_daily(hour, minute)?;
            println!("{} next fire {}", entry.id(), entry.next_fire_at());
            Ok(())
        }
        ScheduleCommand::AddWeekly {
            weekday,
            hour,
            minute,
        } => {
            let entry = scheduler.add_weekly(weekday, hour, minute)?;
            println!("{} next fire {}", entry.id(), entry.next_fire_at());
            Ok(())
        }
        ScheduleCommand::List => {
            for entry in scheduler.entries() {
                println!(
                    "{} {} {:02}:{:02}{} {} next fire {}",
                    entry.id(),
                    entry.kind(),
                    entry.hour(),
                    entry.minute(),
                    entry
                        .weekday()
                        .as_ref()
                        .map(|w| format!(" weekday {w}"))
                        .unwrap_or_default(),
                    if *entry.enabled() { "enabled" } else { "disabled" },
                    entry.next_fire_at()
                );
            }
            Ok(())
        }
        ScheduleCommand::Enable { id } => scheduler.enable(id).map(|_| ()),
        ScheduleCommand::Disable { id } => scheduler.disable(id).map(|_| ()),
        ScheduleCommand::Remove { id } => scheduler.remove(id),
        ScheduleCommand::Run { duration } => {
            scheduler.start()?;
            match duration {
                Some(duration) => {
                    std::thread::sleep(duration);
                    scheduler.stop()
                }
                None => loop {
                    std::thread::sleep(Duration::from_secs(3600));
                },
            }
        }
        ScheduleCommand::RunNow => {
            let record = scheduler.run_now()?;
            println!("{} {}", record.id(), record.outcome());
            Ok(())
        }
        ScheduleCommand::History => {
            for run in scheduler.history() {
                println!(
                    "{} {} {} {}",
                    run.id(),
                    run.triggered_at().format("%Y-%m-%d %H:%M:%S"),
                    run.outcome(),
                    run.schedule_id()
                        .as_ref()
                        .map(|id| format!("schedule {id}"))
                        .unwrap_or_else(|| "on-demand".to_string())
                );
            }
            Ok(())
        }
        ScheduleCommand::ClearHistory => scheduler.clear_history(),
    }
}
