use crate::backup::archive::ArchiveStore;
use crate::backup::diff::{diff_trees, DiffEntry};
use crate::backup::function_path;
use crate::backup::lock::OpLock;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::state_file;

use bon::{bon, Builder};
use chrono::{DateTime, Utc};
use function_name::named;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use uuid::Uuid;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub static INDEX_FILE_NAME: &str = "index.json";
pub static DEFAULT_MAX_VERSIONS: usize = 10;
/// Description attached to the automatic save taken before every restore.
pub static SAFETY_SAVE_DESCRIPTION: &str = "pre-restore-safety";

/// Validates configuration content before it replaces the live file.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, content: &str) -> result::Result<(), String>;
}

/// Accepts any well-formed YAML or JSON document, rejects everything the
/// parser cannot make sense of.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralValidator;

impl SchemaValidator for StructuralValidator {
    fn validate(&self, content: &str) -> result::Result<(), String> {
        serde_yml::from_str::<serde_yml::Value>(content)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// One saved state of the managed configuration file.
#[skip_serializing_none]
#[derive(Clone, Debug, Builder, Getters, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct ConfigVersion {
    id: Uuid,
    timestamp: DateTime<Utc>,
    #[builder(into)]
    description: Option<String>,
    #[builder(into)]
    archive_path: PathBuf,
    #[builder(default)]
    size_bytes: u64,
    #[builder(into)]
    checksum: Option<String>,
}

/// Keeps a bounded history of one configuration file as archives in a
/// versions directory, with an `index.json` journal beside them. Restores
/// take a safety save first and validate staged content before it goes
/// live.
#[derive(Clone)]
pub struct ConfigVersionManager {
    store: Arc<ArchiveStore>,
    config_file: Arc<Path>,
    versions_dir: Arc<Path>,
    max_versions: usize,
    versions: Arc<Mutex<Vec<ConfigVersion>>>,
    lock: OpLock,
    validator: Arc<dyn SchemaValidator>,
}

impl std::fmt::Debug for ConfigVersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigVersionManager")
            .field("config_file", &self.config_file)
            .field("versions_dir", &self.versions_dir)
            .field("max_versions", &self.max_versions)
            .finish_non_exhaustive()
    }
}

#[bon]
impl ConfigVersionManager {
    #[builder]
    pub fn new(
        #[builder(into)] store: Arc<ArchiveStore>,
        #[builder(into)] config_file: Arc<Path>,
        #[builder(into)] versions_dir: Arc<Path>,
        #[builder(default = DEFAULT_MAX_VERSIONS)] max_versions: usize,
        #[builder(default)] lock: OpLock,
        #[builder(default = Arc::new(StructuralValidator))] validator: Arc<dyn SchemaValidator>,
    ) -> Result<Self> {
        let mut versions: Vec<ConfigVersion> =
            state_file::load_json_or_default(versions_dir.join(INDEX_FILE_NAME))?;
        // oldest first, eviction pops from the front
        versions.sort_by(|a, b| a.timestamp().cmp(b.timestamp()));
        tracing::debug!(
            "Loaded {} config versions from {:?}",
            versions.len(),
            versions_dir
        );
        Ok(ConfigVersionManager {
            store,
            config_file,
            versions_dir,
            max_versions,
            versions: Arc::new(Mutex::new(versions)),
            lock,
            validator,
        })
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn versions_dir(&self) -> &Path {
        &self.versions_dir
    }

    /// Archives the current configuration file as a new version, evicting
    /// the oldest versions beyond the history bound.
    #[named]
    pub fn save<S: Into<String>>(&self, description: Option<S>) -> Result<ConfigVersion> {
        let _guard = self.lock.acquire();
        self.save_locked(description.map(Into::into), true)
            .add_fn_name(function_path!())
    }

    /// Snapshot of the version history, newest first.
    pub fn list(&self) -> Vec<ConfigVersion> {
        let mut versions = self.lock_versions().clone();
        versions.sort_by(|a, b| b.timestamp().cmp(a.timestamp()));
        versions
    }

    /// Replaces the live configuration file with version `id`. The current
    /// state is saved first, staged content must pass the schema validator
    /// before anything goes live.
    #[named]
    pub fn restore(&self, id: Uuid) -> Result<ConfigVersion> {
        self.restore_inner(id).add_fn_name(function_path!())
    }

    fn restore_inner(&self, id: Uuid) -> Result<ConfigVersion> {
        let _guard = self.lock.acquire();
        let version = self
            .lock_versions()
            .iter()
            .find(|v| *v.id() == id)
            .cloned()
            .ok_or(Error::VersionNotFound(id))?;

        // evict only after the restore settles so the version being
        // restored cannot be deleted out from under us
        self.save_locked(Some(SAFETY_SAVE_DESCRIPTION.to_string()), false)
            .map_err(|e| Error::SafetyBackupFailed(Box::new(e)))?;

        let res = self.apply_version(&version);
        {
            let mut versions = self.lock_versions();
            self.evict_locked(&mut versions);
        }
        self.save_index()?;
        res?;
        tracing::info!(
            "Restored config version {} over {:?}",
            id,
            self.config_file
        );
        Ok(version)
    }

    fn apply_version(&self, version: &ConfigVersion) -> Result<()> {
        let staging = self.store.extract_to_staging(version.archive_path())?;
        let staged = staging.sole_entry()?;
        let content = std::fs::read_to_string(&staged)?;
        self.validator
            .validate(&content)
            .map_err(Error::invalid_configuration)?;
        self.store.promote(&staged, &self.config_file)
    }

    /// Deterministic diff between two saved versions, oldest argument
    /// first. Neither the live file nor the history is touched.
    pub fn compare(&self, old_id: Uuid, new_id: Uuid) -> Result<Vec<DiffEntry>> {
        let (old, new) = {
            let versions = self.lock_versions();
            let find = |id: Uuid| {
                versions
                    .iter()
                    .find(|v| *v.id() == id)
                    .cloned()
                    .ok_or(Error::VersionNotFound(id))
            };
            (find(old_id)?, find(new_id)?)
        };
        let old_tree = self.read_version_tree(&old)?;
        let new_tree = self.read_version_tree(&new)?;
        Ok(diff_trees(&old_tree, &new_tree))
    }

    fn read_version_tree(&self, version: &ConfigVersion) -> Result<Value> {
        let staging = self.store.extract_to_staging(version.archive_path())?;
        let content = std::fs::read_to_string(staging.sole_entry()?)?;
        parse_config_tree(&self.config_file, &content)
    }

    fn save_locked(&self, description: Option<String>, evict: bool) -> Result<ConfigVersion> {
        let descriptor = self
            .store
            .create(&self.config_file, &self.versions_dir)
            .add_msg(format!("Saving a version of {:?} failed", self.config_file))?;
        let version = ConfigVersion::builder()
            .id(Uuid::new_v4())
            .timestamp(*descriptor.created_at())
            .maybe_description(description)
            .archive_path(descriptor.path().clone())
            .size_bytes(*descriptor.size_bytes())
            .maybe_checksum(descriptor.checksum().clone())
            .build();
        {
            let mut versions = self.lock_versions();
            versions.push(version.clone());
            if evict {
                self.evict_locked(&mut versions);
            }
        }
        self.save_index()?;
        tracing::info!(
            "Saved config version {} ({:?})",
            version.id(),
            version.archive_path()
        );
        Ok(version)
    }

    fn evict_locked(&self, versions: &mut Vec<ConfigVersion>) {
        while versions.len() > self.max_versions {
            let evicted = versions.remove(0);
            tracing::info!(
                "Evicting config version {} ({:?})",
                evicted.id(),
                evicted.archive_path()
            );
            if let Err(e) = self.store.delete(evicted.archive_path()) {
                tracing::warn!(
                    "Deleting evicted archive {:?} failed: {}",
                    evicted.archive_path(),
                    e
                );
            }
        }
    }

    fn save_index(&self) -> Result<()> {
        let versions = self.lock_versions().clone();
        state_file::save_json(self.versions_dir.join(INDEX_FILE_NAME), &versions)
            .add_msg("Writing version index failed")
    }

    fn lock_versions(&self) -> MutexGuard<'_, Vec<ConfigVersion>> {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_config_tree(path: &Path, content: &str) -> Result<Value> {
    if path.extension().and_then(OsStr::to_str) == Some("json") {
        Ok(serde_json::from_str(content)?)
    } else {
        Ok(serde_yml::from_str(content)?)
    }
}
