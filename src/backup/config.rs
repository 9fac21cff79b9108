use crate::backup::archive::ExcludeGlob;
use crate::backup::compress::CompressorConfig;
use crate::backup::history::HistoryRetention;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::validate::{validate_dir_exist, validate_file_exist, validate_writable_dir};
use crate::backup::versions;

use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use validator::Validate;

use std::fs::File;
use std::path::{Path, PathBuf};

/// Top-level YAML configuration for the backup subsystem.
#[skip_serializing_none]
#[derive(Clone, Debug, Builder, Getters, Validate, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct VaultConfig {
    /// Directory whose content scheduled and on-demand backups capture.
    #[validate(custom(function = validate_dir_exist))]
    #[builder(into)]
    source_dir: PathBuf,
    /// Where backup archives and their journals land. Created if missing.
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    backup_dir: PathBuf,
    /// The configuration file under version management.
    #[validate(custom(function = validate_file_exist))]
    #[builder(into)]
    config_file: PathBuf,
    /// Where configuration version archives and their index land.
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    versions_dir: PathBuf,
    #[serde(default = "default_max_versions")]
    #[builder(default = default_max_versions())]
    #[validate(range(min = 1))]
    max_versions: usize,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    history: HistoryRetention,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    compressor: CompressorConfig,
    #[serde(default)]
    #[builder(default)]
    exclude: Vec<ExcludeGlob>,
}

fn default_max_versions() -> usize {
    versions::DEFAULT_MAX_VERSIONS
}

impl VaultConfig {
    /// Reads and validates a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: VaultConfig = File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader(f).map_err(Error::from))
            .add_msg(format!("Parse YAML config failed: {path:?}"))?;
        config
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {path:?}"))?;
        Ok(config)
    }
}
