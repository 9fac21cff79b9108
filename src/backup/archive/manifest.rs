use bon::Builder;
use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Archive entry holding the manifest, always appended last.
pub static MANIFEST_FILE_NAME: &str = "MANIFEST.json";
/// Prefix under which payload files live inside an archive.
pub static DATA_DIR: &str = "data";
/// Bumped on manifest schema changes, v2 added `source_kind`.
pub static FORMAT_VERSION: u32 = 2;

/// Shape of the path an archive was created from. Restores reproduce it:
/// a file archive lands as the target file, a directory archive as a tree.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Directory,
}

/// Embedded description of an archive: where it came from, when it was
/// written and a SHA-256 per payload entry.
#[derive(Clone, Debug, Serialize, Deserialize, Builder, Getters, PartialEq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct Manifest {
    #[builder(default = FORMAT_VERSION)]
    format_version: u32,
    #[builder(into)]
    source_name: String,
    source_kind: SourceKind,
    created_at: DateTime<Utc>,
    entries: Vec<ManifestEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct ManifestEntry {
    /// Path relative to the archived source root.
    #[builder(into)]
    path: PathBuf,
    size_bytes: u64,
    /// SHA-256 of the uncompressed entry content, lowercase hex.
    #[builder(into)]
    checksum: String,
}
