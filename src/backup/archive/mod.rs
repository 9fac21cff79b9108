pub mod checksum;
pub mod manifest;

use crate::backup::archive::checksum::{Sha256Reader, Sha256Writer};
use crate::backup::archive::manifest::{Manifest, ManifestEntry, SourceKind};
use crate::backup::compress::{
    CompressorBuilder, CompressorConfig, Decompressor, FileExtProvider, Finish,
};
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};

use bon::Builder;
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use derive_more::{Display, From};
use function_name::named;
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSetBuilder};
use itertools::Itertools;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use tempfile::{NamedTempFile, TempDir};
use walkdir::WalkDir;

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt::Formatter;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, IntoInnerError, Read};
use std::path::{Path, PathBuf};
use std::result;
use std::sync::{Arc, OnceLock};

/// Timestamp embedded in archive file names, millisecond precision.
static TIME_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";
static TAR_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
static NAME_COLLISION_LIMIT: u32 = 100;

/// Writes, lists, verifies and replaces tar archives in a destination
/// directory. Each archive carries an embedded manifest plus a `.sha256`
/// sidecar over the final file bytes.
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct ArchiveStore {
    #[builder(into)]
    compressor: Arc<CompressorConfig>,
    /// Globs matched against source-relative paths, matching entries are
    /// skipped when packing a directory.
    #[builder(default, into)]
    exclude: Arc<Vec<ExcludeGlob>>,
}

/// Glob pattern with custom string deserialization. Literal separator mode
/// keeps `*` from crossing directory boundaries.
#[derive(Clone, Debug, From, Display, Serialize, Builder, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct ExcludeGlob {
    #[builder(into)]
    glob: Glob,
}

struct ExcludeGlobVisitor;

impl Visitor<'_> for ExcludeGlobVisitor {
    type Value = ExcludeGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        GlobBuilder::new(v)
            .literal_separator(true)
            .build()
            .map(ExcludeGlob::from)
            .map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for ExcludeGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(ExcludeGlobVisitor)
    }
}

/// What `list` knows about one archive without opening it: file path, the
/// timestamp parsed back from the name, size, and the sidecar checksum.
#[derive(Clone, Debug, Builder, Getters, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct ArchiveDescriptor {
    #[builder(into)]
    path: PathBuf,
    created_at: DateTime<Utc>,
    size_bytes: u64,
    checksum: Option<String>,
}

/// Verified archive content unpacked into a temporary directory. Dropping
/// the staging removes everything that was not promoted.
#[derive(Debug)]
pub struct Staging {
    manifest: Manifest,
    dir: TempDir,
}

impl Staging {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Staged path of the single entry in a one-file archive.
    pub fn sole_entry(&self) -> Result<PathBuf> {
        match self.manifest.entries().as_slice() {
            [only] => Ok(self.dir.path().join(only.path())),
            entries => Err(Error::corrupt_archive(format!(
                "expected a single entry, found {}",
                entries.len()
            ))),
        }
    }
}

impl FileExtProvider for ArchiveStore {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(TAR_FILE_EXT.get_or_init(|| "tar".into()))
                .chain(self.compressor.file_ext().iter())
                .join(".")
                .into(),
        )
    }
}

impl ArchiveStore {
    /// Packs `source` (file or directory) into a new timestamped archive in
    /// `dest_dir`. Nothing is left behind on failure, the archive only
    /// becomes visible under its final name once fully written.
    #[named]
    pub fn create<P1: AsRef<Path>, P2: AsRef<Path>>(
        &self,
        source: P1,
        dest_dir: P2,
    ) -> Result<ArchiveDescriptor> {
        self.create_inner(source.as_ref(), dest_dir.as_ref())
            .add_fn_name(function_path!())
    }

    fn create_inner(&self, source: &Path, dest_dir: &Path) -> Result<ArchiveDescriptor> {
        let created_at = Utc::now();
        // file names carry millisecond precision, keep the descriptor in sync
        let created_at = created_at
            .with_nanosecond(created_at.nanosecond() / 1_000_000 * 1_000_000)
            .unwrap_or(created_at);
        let base = archive_base_name(source)?;
        let source_kind = if source.is_file() {
            SourceKind::File
        } else {
            SourceKind::Directory
        };
        let entries = self.collect_entries(source)?;
        tracing::info!(
            "Archiving {} entries from {:?} into {:?}",
            entries.len(),
            source,
            dest_dir
        );

        let tmp = NamedTempFile::new_in(dest_dir)?;
        let writer = Sha256Writer::new(BufWriter::new(tmp));
        let writer = self.compressor.build_compressor(writer)?;
        let mut builder = tar::Builder::new(BufWriter::new(writer));
        builder.follow_symlinks(true);

        let mut manifest_entries = Vec::with_capacity(entries.len());
        for (src, rel) in &entries {
            let md = std::fs::metadata(src)?;
            let mut header = tar::Header::new_gnu();
            header.set_metadata(&md);
            let mut reader = Sha256Reader::new(File::open(src)?);
            builder.append_data(
                &mut header,
                Path::new(manifest::DATA_DIR).join(rel),
                &mut reader,
            )?;
            manifest_entries.push(
                ManifestEntry::builder()
                    .path(rel.clone())
                    .size_bytes(md.len())
                    .checksum(reader.finalize_hex())
                    .build(),
            );
        }

        let manifest = Manifest::builder()
            .source_name(base.clone())
            .source_kind(source_kind)
            .created_at(created_at)
            .entries(manifest_entries)
            .build();
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_json.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(u64::try_from(created_at.timestamp()).unwrap_or(0));
        builder.append_data(
            &mut header,
            manifest::MANIFEST_FILE_NAME,
            manifest_json.as_slice(),
        )?;

        let (writer, archive_checksum) = builder
            .into_inner()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .finish()?
            .finalize_hex();
        let mut tmp = writer.into_inner().map_err(IntoInnerError::into_error)?;

        let ext = self.file_ext().unwrap_or_else(|| "tar".into());
        let time_tag = created_at.format(TIME_FORMAT);
        let mut final_path = dest_dir.join(format!("{base}_{time_tag}.{ext}"));
        let mut attempt = 0u32;
        loop {
            match tmp.persist_noclobber(&final_path) {
                Ok(_) => break,
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists && attempt < NAME_COLLISION_LIMIT => {
                    attempt += 1;
                    tmp = e.file;
                    final_path = dest_dir.join(format!("{base}_{time_tag}-{attempt}.{ext}"));
                }
                Err(e) => {
                    return Err(Error::from(e.error)
                        .add_msg(format!("Persisting archive {final_path:?} failed")))
                }
            }
        }

        if let Err(e) = checksum::write_sidecar(&final_path, &archive_checksum) {
            if let Err(cleanup) = std::fs::remove_file(&final_path) {
                tracing::warn!(
                    "Removing sidecar-less archive {:?} failed: {}",
                    final_path,
                    cleanup
                );
            }
            return Err(e);
        }

        let size_bytes = std::fs::metadata(&final_path)?.len();
        tracing::info!("Created archive {:?} ({} bytes)", final_path, size_bytes);
        Ok(ArchiveDescriptor {
            path: final_path,
            created_at,
            size_bytes,
            checksum: Some(archive_checksum),
        })
    }

    fn collect_entries(&self, source: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
        if source.is_file() {
            let name = source.file_name().map(PathBuf::from).ok_or_else(|| {
                Error::invalid_configuration(format!("source {source:?} has no file name"))
            })?;
            return Ok(vec![(source.to_path_buf(), name)]);
        }
        if !source.is_dir() {
            return Err(Error::from(std::io::Error::new(
                ErrorKind::NotFound,
                format!("source path {source:?} does not exist"),
            )));
        }

        let mut excluded = GlobSetBuilder::new();
        for glob in self.exclude.iter() {
            excluded.add(glob.glob().clone());
        }
        let excluded = excluded
            .build()
            .map_err(|e| Error::invalid_configuration(format!("exclude globs: {e}")))?;

        let mut entries = Vec::new();
        for entry in WalkDir::new(source).follow_links(true).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            let rel = match path.strip_prefix(source) {
                Ok(rel) => rel.to_path_buf(),
                Err(e) => {
                    return Err(Error::from(std::io::Error::other(e))
                        .add_msg(format!("Stripping {source:?} from {path:?} failed")))
                }
            };
            if excluded.is_match(&rel) {
                tracing::trace!("Skipping excluded entry {:?}", rel);
                continue;
            }
            entries.push((path, rel));
        }
        Ok(entries)
    }

    /// Enumerates archives in `dir` newest first. Only the directory
    /// listing, file metadata and checksum sidecars are read.
    pub fn list<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<ArchiveDescriptor>> {
        let mut archives = Vec::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let entry = entry?;
            let path = entry.path();
            let Some(created_at) = parse_archive_timestamp(&path) else {
                continue;
            };
            let md = entry.metadata()?;
            if !md.is_file() {
                continue;
            }
            let checksum = checksum::read_sidecar(&path)?;
            archives.push(ArchiveDescriptor {
                path,
                created_at,
                size_bytes: md.len(),
                checksum,
            });
        }
        archives.sort_unstable_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(archives)
    }

    /// Verifies the archive checksum, unpacks it into a fresh staging
    /// directory and re-hashes every entry against the manifest.
    #[named]
    pub fn extract_to_staging<P: AsRef<Path>>(&self, archive: P) -> Result<Staging> {
        let archive = archive.as_ref();
        self.extract_inner(archive)
            .add_msg(format!("Extracting {archive:?} failed"))
            .add_fn_name(function_path!())
    }

    fn extract_inner(&self, archive: &Path) -> Result<Staging> {
        if !archive.is_file() {
            return Err(Error::not_found(format!("archive {archive:?}")));
        }
        checksum::verify(archive)?;

        let file_name = archive
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or_default();
        let parent = archive.parent().unwrap_or_else(|| Path::new("."));
        let dir = TempDir::with_prefix_in(".staging-", parent)?;

        let reader = Decompressor::for_file_name(file_name, BufReader::new(File::open(archive)?));
        let mut tar = tar::Archive::new(reader);
        let mut staged: BTreeMap<PathBuf, String> = BTreeMap::new();
        let mut manifest: Option<Manifest> = None;

        for entry in tar.entries().map_err(|e| corrupt_or_io(archive, e))? {
            let mut entry = entry.map_err(|e| corrupt_or_io(archive, e))?;
            let path = entry
                .path()
                .map_err(|e| corrupt_or_io(archive, e))?
                .into_owned();
            if path == Path::new(manifest::MANIFEST_FILE_NAME) {
                let mut raw = String::new();
                entry
                    .read_to_string(&mut raw)
                    .map_err(|e| corrupt_or_io(archive, e))?;
                manifest = Some(serde_json::from_str(&raw).map_err(|e| {
                    Error::corrupt_archive(format!("unreadable manifest in {archive:?}: {e}"))
                })?);
                continue;
            }
            let rel = path
                .strip_prefix(manifest::DATA_DIR)
                .map_err(|_| {
                    Error::corrupt_archive(format!("unexpected entry {path:?} in {archive:?}"))
                })?
                .to_path_buf();
            let staged_path = dir.path().join(&rel);
            if let Some(parent) = staged_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut reader = Sha256Reader::new(&mut entry);
            let mut out = File::create(&staged_path)?;
            std::io::copy(&mut reader, &mut out).map_err(|e| corrupt_or_io(archive, e))?;
            staged.insert(rel, reader.finalize_hex());
        }

        let manifest = manifest
            .ok_or_else(|| Error::corrupt_archive(format!("missing manifest in {archive:?}")))?;
        if staged.len() != manifest.entries().len() {
            return Err(Error::corrupt_archive(format!(
                "{archive:?} holds {} entries, manifest lists {}",
                staged.len(),
                manifest.entries().len()
            )));
        }
        for expected in manifest.entries() {
            match staged.get(expected.path()) {
                Some(actual) if actual == expected.checksum() => {}
                Some(_) => {
                    return Err(Error::corrupt_archive(format!(
                        "checksum mismatch for entry {:?} in {archive:?}",
                        expected.path()
                    )))
                }
                None => {
                    return Err(Error::corrupt_archive(format!(
                        "entry {:?} missing from {archive:?}",
                        expected.path()
                    )))
                }
            }
        }

        tracing::debug!(
            "Staged {} entries from {:?} at {:?}",
            staged.len(),
            archive,
            dir.path()
        );
        Ok(Staging { manifest, dir })
    }

    /// Moves verified staged content over `target`. Files are swapped with a
    /// single rename, directories with a move-aside swap that restores the
    /// previous tree when the move fails.
    #[named]
    pub fn promote<P1: AsRef<Path>, P2: AsRef<Path>>(&self, staged: P1, target: P2) -> Result<()> {
        let staged = staged.as_ref();
        let target = target.as_ref();
        ensure_parent(target)?;
        let res = if staged.is_dir() {
            promote_dir(staged, target)
        } else {
            promote_file(staged, target)
        };
        res.add_msg(format!("Promoting {staged:?} over {target:?} failed"))
            .add_fn_name(function_path!())
    }

    /// Removes an archive and its sidecar. Already-absent files are fine.
    pub fn delete<P: AsRef<Path>>(&self, archive: P) -> Result<()> {
        let archive = archive.as_ref();
        remove_if_exists(archive)?;
        remove_if_exists(&checksum::sidecar_path(archive))?;
        tracing::info!("Deleted archive {:?}", archive);
        Ok(())
    }
}

/// Parses the creation timestamp back out of an archive file name. Returns
/// `None` for files that were not written by the store.
pub fn parse_archive_timestamp<P: AsRef<Path>>(path: P) -> Option<DateTime<Utc>> {
    let name = path.as_ref().file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".tar.gz")
        .or_else(|| name.strip_suffix(".tar"))?;
    let segment = stem.rsplit('_').next()?;
    let ts = segment.split('-').next()?;
    NaiveDateTime::parse_from_str(ts, TIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

fn archive_base_name(source: &Path) -> Result<String> {
    let name = source
        .file_name()
        .and_then(OsStr::to_str)
        .map(sanitize_filename::sanitize)
        .unwrap_or_default();
    if name.is_empty() {
        return Err(Error::invalid_configuration(format!(
            "cannot derive an archive name from {source:?}"
        )));
    }
    Ok(name)
}

fn corrupt_or_io(archive: &Path, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof => {
            Error::corrupt_archive(format!("{archive:?}: {e}"))
        }
        _ => Error::from(e),
    }
}

fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn promote_file(staged: &Path, target: &Path) -> Result<()> {
    match std::fs::rename(staged, target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => copy_file_over(staged, target),
        Err(e) => Err(e.into()),
    }
}

fn promote_dir(staged: &Path, target: &Path) -> Result<()> {
    if !target.exists() {
        return move_path(staged, target);
    }
    if !target.is_dir() {
        return Err(Error::invalid_configuration(format!(
            "target {target:?} is not a directory"
        )));
    }
    let file_name = target
        .file_name()
        .and_then(OsStr::to_str)
        .ok_or_else(|| Error::invalid_configuration(format!("target {target:?} has no file name")))?;
    let parked = target.with_file_name(format!(".{}.old-{}", file_name, std::process::id()));
    if parked.exists() {
        std::fs::remove_dir_all(&parked)?;
    }
    std::fs::rename(target, &parked)?;
    match move_path(staged, target) {
        Ok(()) => {
            if let Err(e) = std::fs::remove_dir_all(&parked) {
                tracing::warn!("Removing parked tree {:?} failed: {}", parked, e);
            }
            Ok(())
        }
        Err(e) => {
            if let Err(undo) = std::fs::rename(&parked, target) {
                return Err(
                    e.add_msg(format!("Restoring {target:?} from {parked:?} also failed: {undo}"))
                );
            }
            Err(e)
        }
    }
}

fn move_path(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            if from.is_dir() {
                copy_dir_over(from, to)
            } else {
                copy_file_over(from, to)
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn copy_file_over(from: &Path, to: &Path) -> Result<()> {
    let dir = to.parent().ok_or_else(|| {
        Error::invalid_configuration(format!("target {to:?} has no parent directory"))
    })?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    let mut src = File::open(from)?;
    std::io::copy(&mut src, tmp.as_file_mut())?;
    tmp.persist(to).map_err(|e| Error::from(e.error))?;
    Ok(())
}

/// Cross-device directory copy. The tree is assembled under a hidden
/// sibling name and renamed in, `to` never holds a partial copy.
fn copy_dir_over(from: &Path, to: &Path) -> Result<()> {
    let file_name = to
        .file_name()
        .and_then(OsStr::to_str)
        .ok_or_else(|| Error::invalid_configuration(format!("target {to:?} has no file name")))?;
    let incoming = to.with_file_name(format!(".{}.new-{}", file_name, std::process::id()));
    if incoming.exists() {
        std::fs::remove_dir_all(&incoming)?;
    }
    if let Err(e) = copy_dir_all(from, &incoming) {
        if incoming.exists() {
            if let Err(cleanup) = std::fs::remove_dir_all(&incoming) {
                tracing::warn!("Removing partial copy {:?} failed: {}", incoming, cleanup);
            }
        }
        return Err(e);
    }
    std::fs::rename(&incoming, to)?;
    Ok(())
}

fn copy_dir_all(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in WalkDir::new(from) {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(from) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dst = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dst)?;
        } else {
            std::fs::copy(entry.path(), &dst)?;
        }
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compress::gzip::GzipConfig;

    fn gzip_store() -> ArchiveStore {
        ArchiveStore::builder()
            .compressor(CompressorConfig::from(GzipConfig::default()))
            .build()
    }

    fn plain_store() -> ArchiveStore {
        ArchiveStore::builder()
            .compressor(CompressorConfig::None)
            .build()
    }

    fn seed_source(root: &Path) -> PathBuf {
        let source = root.join("appdata");
        std::fs::create_dir_all(source.join("nested")).unwrap();
        std::fs::write(source.join("config.yml"), "answer: 42\n").unwrap();
        std::fs::write(source.join("nested/state.json"), "{\"k\":1}").unwrap();
        std::fs::write(source.join("scratch.tmp"), "junk").unwrap();
        source
    }

    #[test]
    fn creates_archive_with_sidecar() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("config.yml");
        std::fs::write(&source, "answer: 42\n").unwrap();
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();

        let descriptor = gzip_store().create(&source, &dest).unwrap();

        assert!(descriptor.path().is_file());
        assert!(descriptor.path().to_string_lossy().ends_with(".tar.gz"));
        assert!(descriptor.checksum().is_some());
        assert!(checksum::sidecar_path(descriptor.path()).is_file());
        assert_eq!(
            parse_archive_timestamp(descriptor.path()).unwrap(),
            *descriptor.created_at()
        );
        // only the archive and its sidecar landed in the destination
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 2);
    }

    #[test]
    fn directory_archive_honors_excludes() {
        let tmp = TempDir::new().unwrap();
        let source = seed_source(tmp.path());
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();

        let store = ArchiveStore::builder()
            .compressor(CompressorConfig::None)
            .exclude(vec![ExcludeGlob::builder()
                .glob(Glob::new("**/*.tmp").unwrap())
                .build()])
            .build();

        let descriptor = store.create(&source, &dest).unwrap();
        let staging = store.extract_to_staging(descriptor.path()).unwrap();

        assert_eq!(staging.manifest().entries().len(), 2);
        assert!(staging.path().join("config.yml").is_file());
        assert!(staging.path().join("nested/state.json").is_file());
        assert!(!staging.path().join("scratch.tmp").exists());
    }

    #[test]
    fn extract_round_trips_content() {
        let tmp = TempDir::new().unwrap();
        let source = seed_source(tmp.path());
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();

        let store = gzip_store();
        let descriptor = store.create(&source, &dest).unwrap();
        let staging = store.extract_to_staging(descriptor.path()).unwrap();

        assert_eq!(
            std::fs::read(staging.path().join("config.yml")).unwrap(),
            std::fs::read(source.join("config.yml")).unwrap()
        );
        assert_eq!(
            std::fs::read(staging.path().join("nested/state.json")).unwrap(),
            std::fs::read(source.join("nested/state.json")).unwrap()
        );
    }

    #[test]
    fn staging_cleans_up_on_drop() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("config.yml");
        std::fs::write(&source, "answer: 42\n").unwrap();
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();

        let store = plain_store();
        let descriptor = store.create(&source, &dest).unwrap();
        let staged_root = {
            let staging = store.extract_to_staging(descriptor.path()).unwrap();
            staging.path().to_path_buf()
        };
        assert!(!staged_root.exists());
    }

    #[test]
    fn list_is_newest_first_and_skips_foreign_files() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("config.yml");
        std::fs::write(&source, "a: 1\n").unwrap();
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("records.json"), "[]").unwrap();

        let store = plain_store();
        let first = store.create(&source, &dest).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.create(&source, &dest).unwrap();

        let listed = store.list(&dest).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path(), second.path());
        assert_eq!(listed[1].path(), first.path());
        assert!(listed[0].created_at() >= listed[1].created_at());
    }

    #[test]
    fn flipped_byte_is_corrupt_archive() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("config.yml");
        std::fs::write(&source, "answer: 42\n").unwrap();
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();

        let store = gzip_store();
        let descriptor = store.create(&source, &dest).unwrap();

        let mut bytes = std::fs::read(descriptor.path()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(descriptor.path(), &bytes).unwrap();

        let err = store.extract_to_staging(descriptor.path()).unwrap_err();
        match err.root() {
            Error::CorruptArchive(_) => (),
            e => panic!("Expected CorruptArchive, got {e:?}"),
        }
    }

    #[test]
    fn missing_sidecar_is_corrupt_archive() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("config.yml");
        std::fs::write(&source, "answer: 42\n").unwrap();
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();

        let store = plain_store();
        let descriptor = store.create(&source, &dest).unwrap();
        std::fs::remove_file(checksum::sidecar_path(descriptor.path())).unwrap();

        let err = store.extract_to_staging(descriptor.path()).unwrap_err();
        match err.root() {
            Error::CorruptArchive(_) => (),
            e => panic!("Expected CorruptArchive, got {e:?}"),
        }
    }

    #[test]
    fn missing_archive_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = plain_store()
            .extract_to_staging(tmp.path().join("nope.tar"))
            .unwrap_err();
        match err.root() {
            Error::NotFound(_) => (),
            e => panic!("Expected NotFound, got {e:?}"),
        }
    }

    #[test]
    fn promote_replaces_file_target() {
        let tmp = TempDir::new().unwrap();
        let staged = tmp.path().join("staged.yml");
        let target = tmp.path().join("live/config.yml");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&staged, "new").unwrap();
        std::fs::write(&target, "old").unwrap();

        plain_store().promote(&staged, &target).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new");
        assert!(!staged.exists());
    }

    #[test]
    fn promote_swaps_directory_target() {
        let tmp = TempDir::new().unwrap();
        let staged = tmp.path().join("staged");
        let target = tmp.path().join("live");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(staged.join("new.txt"), "new").unwrap();
        std::fs::write(target.join("stale.txt"), "stale").unwrap();

        plain_store().promote(&staged, &target).unwrap();
        assert_eq!(std::fs::read_to_string(target.join("new.txt")).unwrap(), "new");
        assert!(!target.join("stale.txt").exists());
        // the parked copy of the old tree is cleaned up
        assert_eq!(
            std::fs::read_dir(tmp.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().contains(".old-"))
                .count(),
            0
        );
    }

    #[test]
    fn failed_directory_promote_restores_the_previous_tree() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("live");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("precious.txt"), "keep me").unwrap();

        assert!(promote_dir(&tmp.path().join("gone"), &target).is_err());

        assert_eq!(
            std::fs::read_to_string(target.join("precious.txt")).unwrap(),
            "keep me"
        );
        // the parked tree was renamed back, nothing hidden is left over
        assert_eq!(
            std::fs::read_dir(tmp.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
                .count(),
            0
        );
    }

    #[test]
    fn directory_copy_fallback_assembles_next_to_the_target() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("staged");
        std::fs::create_dir_all(from.join("sub")).unwrap();
        std::fs::write(from.join("sub/a.txt"), "payload").unwrap();
        let to = tmp.path().join("live");

        copy_dir_over(&from, &to).unwrap();

        assert_eq!(
            std::fs::read_to_string(to.join("sub/a.txt")).unwrap(),
            "payload"
        );
        assert!(!tmp
            .path()
            .join(format!(".live.new-{}", std::process::id()))
            .exists());
    }

    #[cfg(unix)]
    #[test]
    fn failing_directory_copy_fallback_leaves_no_target() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("staged");
        std::fs::create_dir_all(from.join("sub")).unwrap();
        std::fs::write(from.join("keep.txt"), "data").unwrap();
        // dangling symlink, copying it fails partway through the tree
        std::os::unix::fs::symlink(from.join("absent"), from.join("sub/broken")).unwrap();
        let to = tmp.path().join("live");

        assert!(copy_dir_over(&from, &to).is_err());

        assert!(!to.exists());
        assert!(!tmp
            .path()
            .join(format!(".live.new-{}", std::process::id()))
            .exists());
    }

    #[test]
    fn delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("config.yml");
        std::fs::write(&source, "a: 1\n").unwrap();
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();

        let store = plain_store();
        let descriptor = store.create(&source, &dest).unwrap();

        store.delete(descriptor.path()).unwrap();
        assert!(!descriptor.path().exists());
        assert!(!checksum::sidecar_path(descriptor.path()).exists());
        store.delete(descriptor.path()).unwrap();
    }

    #[test]
    fn sole_entry_requires_single_file_archive() {
        let tmp = TempDir::new().unwrap();
        let source = seed_source(tmp.path());
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();

        let store = plain_store();
        let descriptor = store.create(&source, &dest).unwrap();
        let staging = store.extract_to_staging(descriptor.path()).unwrap();
        assert!(staging.sole_entry().is_err());
    }

    #[test]
    fn manifest_records_the_source_kind() {
        let tmp = TempDir::new().unwrap();
        let file_source = tmp.path().join("config.yml");
        std::fs::write(&file_source, "a: 1\n").unwrap();
        let dir_source = seed_source(tmp.path());
        let dest = tmp.path().join("archives");
        std::fs::create_dir_all(&dest).unwrap();

        let store = plain_store();
        let from_file = store.create(&file_source, &dest).unwrap();
        let from_dir = store.create(&dir_source, &dest).unwrap();

        let staged_file = store.extract_to_staging(from_file.path()).unwrap();
        let staged_dir = store.extract_to_staging(from_dir.path()).unwrap();
        assert_eq!(*staged_file.manifest().source_kind(), SourceKind::File);
        assert_eq!(*staged_dir.manifest().source_kind(), SourceKind::Directory);
    }

    #[test]
    fn timestamp_parse_rejects_foreign_names() {
        assert!(parse_archive_timestamp("records.json").is_none());
        assert!(parse_archive_timestamp("appdata_20260101T020000000Z.tar.gz.sha256").is_none());
        assert!(parse_archive_timestamp("appdata_garbage.tar").is_none());
        let parsed = parse_archive_timestamp("app_data_20260101T020000123Z-1.tar.gz").unwrap();
        assert_eq!(parsed.timestamp_subsec_millis(), 123);
    }
}
