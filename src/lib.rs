//! # snapvault
//!
//! A backup subsystem with archive verification, configuration versioning,
//! and scheduled runs.
//!
//! ## Features
//!
//! - **Verified Archives**: Tar archives with embedded manifests and SHA-256 checksums
//! - **Atomic Writes**: Archives and restores never leave partial state behind
//! - **Backup Journal**: Every attempt recorded, successful or not
//! - **Config Versioning**: Bounded history with safety saves and tree diffs
//! - **Scheduling**: Daily and weekly slots on a stoppable background worker
//! - **Notifications**: Lifecycle events fanned out to pluggable sinks
//!
//! ## Quick Start
//!
//! ```no_run
//! use snapvault::backup::archive::ArchiveStore;
//! use snapvault::backup::config::VaultConfig;
//! use snapvault::backup::manager::BackupManager;
//!
//! let config = VaultConfig::load("vault.yml")?;
//! let store = ArchiveStore::builder()
//!     .compressor(config.compressor().clone())
//!     .exclude(config.exclude().clone())
//!     .build();
//!
//! let manager = BackupManager::builder()
//!     .store(store)
//!     .source_dir(config.source_dir().as_path())
//!     .backup_dir(config.backup_dir().as_path())
//!     .build()?;
//! let record = manager.create(config.source_dir())?;
//! println!("archived as {:?}", record.archive_path());
//! # Ok::<(), snapvault::backup::result_error::error::Error>(())
//! ```

pub mod backup;
