use crate::backup::archive::ArchiveStore;
use crate::backup::archive::manifest::SourceKind;
use crate::backup::function_path;
use crate::backup::lock::OpLock;
use crate::backup::notifications::{emit, BackupEvent, EventKind, Notification, Operation};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::state_file;

use bon::{bon, Builder};
use chrono::{DateTime, Utc};
use derive_more::Display;
use function_name::named;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub static RECORDS_FILE_NAME: &str = "records.json";

#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupOutcome {
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

/// Durable record of one backup attempt, successful or not. Failed attempts
/// have no archive and carry the error text instead.
#[skip_serializing_none]
#[derive(Clone, Debug, Builder, Getters, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct BackupRecord {
    id: Uuid,
    #[builder(into)]
    source_path: PathBuf,
    #[builder(into)]
    archive_path: Option<PathBuf>,
    created_at: DateTime<Utc>,
    #[builder(default)]
    size_bytes: u64,
    #[builder(into)]
    checksum: Option<String>,
    outcome: BackupOutcome,
    #[builder(into)]
    error_detail: Option<String>,
}

/// Creates, lists, restores and deletes backups of one source path, keeping
/// a journal of every attempt in `records.json` next to the archives.
#[derive(Clone)]
pub struct BackupManager {
    store: Arc<ArchiveStore>,
    source_dir: Arc<Path>,
    backup_dir: Arc<Path>,
    records: Arc<Mutex<Vec<BackupRecord>>>,
    lock: OpLock,
    sinks: Arc<Vec<Arc<dyn Notification>>>,
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("source_dir", &self.source_dir)
            .field("backup_dir", &self.backup_dir)
            .finish_non_exhaustive()
    }
}

#[bon]
impl BackupManager {
    /// Loads the record journal from `backup_dir` and hands back a manager
    /// sharing the given archive-operation lock.
    #[builder]
    pub fn new(
        #[builder(into)] store: Arc<ArchiveStore>,
        #[builder(into)] source_dir: Arc<Path>,
        #[builder(into)] backup_dir: Arc<Path>,
        #[builder(default)] lock: OpLock,
        #[builder(default)] sinks: Vec<Arc<dyn Notification>>,
    ) -> Result<Self> {
        let records: Vec<BackupRecord> =
            state_file::load_json_or_default(backup_dir.join(RECORDS_FILE_NAME))?;
        tracing::debug!(
            "Loaded {} backup records from {:?}",
            records.len(),
            backup_dir
        );
        Ok(BackupManager {
            store,
            source_dir,
            backup_dir,
            records: Arc::new(Mutex::new(records)),
            lock,
            sinks: Arc::new(sinks),
        })
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Backs up `source` into the backup directory. Both outcomes yield a
    /// journal record, `Err` is reserved for failures to record the attempt.
    #[named]
    pub fn create<P: AsRef<Path>>(&self, source: P) -> Result<BackupRecord> {
        let source = source.as_ref();
        emit(
            &self.sinks,
            &BackupEvent::now_with_detail(
                EventKind::Started,
                Operation::Backup,
                format!("{source:?}"),
            ),
        );

        let record = {
            let _guard = self.lock.acquire();
            match self.store.create(source, &self.backup_dir) {
                Ok(descriptor) => BackupRecord::builder()
                    .id(Uuid::new_v4())
                    .source_path(source)
                    .archive_path(descriptor.path().clone())
                    .created_at(*descriptor.created_at())
                    .size_bytes(*descriptor.size_bytes())
                    .maybe_checksum(descriptor.checksum().clone())
                    .outcome(BackupOutcome::Success)
                    .build(),
                Err(e) => {
                    tracing::warn!("Backup of {:?} failed: {}", source, e);
                    BackupRecord::builder()
                        .id(Uuid::new_v4())
                        .source_path(source)
                        .created_at(Utc::now())
                        .outcome(BackupOutcome::Failed)
                        .error_detail(e.to_string())
                        .build()
                }
            }
        };
        self.append_record(record.clone())
            .add_fn_name(function_path!())?;

        let kind = match record.outcome() {
            BackupOutcome::Success => EventKind::Succeeded,
            BackupOutcome::Failed => EventKind::Failed,
        };
        emit(
            &self.sinks,
            &BackupEvent::now_with_detail(kind, Operation::Backup, format!("backup {}", record.id())),
        );
        Ok(record)
    }

    /// Snapshot of the journal, newest first. Never blocks on a running
    /// archive operation.
    pub fn list(&self) -> Vec<BackupRecord> {
        let mut records = self.lock_records().clone();
        records.sort_by(|a, b| b.created_at().cmp(a.created_at()));
        records
    }

    /// Restores `archive` over `target`. File archives restored onto a
    /// non-directory target land as that file, everything else is promoted
    /// as a tree.
    #[named]
    pub fn restore<P1: AsRef<Path>, P2: AsRef<Path>>(&self, archive: P1, target: P2) -> Result<()> {
        let archive = archive.as_ref();
        let target = target.as_ref();
        emit(
            &self.sinks,
            &BackupEvent::now_with_detail(
                EventKind::Started,
                Operation::Restore,
                format!("{archive:?} -> {target:?}"),
            ),
        );

        let res = self
            .restore_inner(archive, target)
            .add_fn_name(function_path!());
        self.emit_outcome(Operation::Restore, &res, format!("{archive:?}"));
        res
    }

    fn restore_inner(&self, archive: &Path, target: &Path) -> Result<()> {
        let _guard = self.lock.acquire();
        let staging = self.store.extract_to_staging(archive)?;
        if *staging.manifest().source_kind() == SourceKind::File && !target.is_dir() {
            self.store.promote(staging.sole_entry()?, target)
        } else {
            self.store.promote(staging.path(), target)
        }
    }

    /// Deletes the archive behind a journaled backup and drops its record.
    #[named]
    pub fn delete<P: AsRef<Path>>(&self, archive: P) -> Result<()> {
        let archive = archive.as_ref();
        emit(
            &self.sinks,
            &BackupEvent::now_with_detail(
                EventKind::Started,
                Operation::Delete,
                format!("{archive:?}"),
            ),
        );

        let res = self
            .delete_inner(archive)
            .add_fn_name(function_path!());
        self.emit_outcome(Operation::Delete, &res, format!("{archive:?}"));
        res
    }

    fn delete_inner(&self, archive: &Path) -> Result<()> {
        let _guard = self.lock.acquire();
        {
            let records = self.lock_records();
            if !records
                .iter()
                .any(|r| r.archive_path().as_deref() == Some(archive))
            {
                return Err(Error::not_found(format!("backup archive {archive:?}")));
            }
        }
        self.store.delete(archive)?;
        let records = {
            let mut records = self.lock_records();
            records.retain(|r| r.archive_path().as_deref() != Some(archive));
            records.clone()
        };
        self.save_records(&records)
    }

    fn append_record(&self, record: BackupRecord) -> Result<()> {
        let records = {
            let mut records = self.lock_records();
            records.push(record);
            records.clone()
        };
        self.save_records(&records)
    }

    fn save_records(&self, records: &[BackupRecord]) -> Result<()> {
        state_file::save_json(self.backup_dir.join(RECORDS_FILE_NAME), &records)
            .add_msg("Writing backup records failed")
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Vec<BackupRecord>> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_outcome<T>(&self, operation: Operation, res: &Result<T>, detail: String) {
        let event = match res {
            Ok(_) => BackupEvent::now_with_detail(EventKind::Succeeded, operation, detail),
            Err(e) => BackupEvent::now_with_detail(
                EventKind::Failed,
                operation,
                format!("{detail}: {}", e.root()),
            ),
        };
        emit(&self.sinks, &event);
    }
}
