use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Write passthrough that feeds every byte to a SHA-256 hasher.
pub struct Sha256Writer<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Sha256Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize_hex(self) -> (W, String) {
        (self.inner, format!("{:x}", self.hasher.finalize()))
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Read passthrough that feeds every byte to a SHA-256 hasher.
pub struct Sha256Reader<R: Read> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Sha256Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl<R: Read> Read for Sha256Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        Ok(read)
    }
}

/// Streams the whole file through SHA-256.
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut reader = Sha256Reader::new(BufReader::new(File::open(path.as_ref())?));
    std::io::copy(&mut reader, &mut std::io::sink())?;
    Ok(reader.finalize_hex())
}

/// Path of the checksum sidecar next to an archive: `<file>.sha256`.
pub fn sidecar_path<P: AsRef<Path>>(archive: P) -> PathBuf {
    let mut name = archive.as_ref().as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Writes the sidecar in `sha256sum` format: `<hex>  <file name>`.
pub fn write_sidecar<P: AsRef<Path>>(archive: P, hex: &str) -> Result<()> {
    let archive = archive.as_ref();
    let file_name = archive
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or_default();
    std::fs::write(sidecar_path(archive), format!("{hex}  {file_name}\n"))?;
    Ok(())
}

/// Reads the sidecar hex, `None` when no sidecar exists.
pub fn read_sidecar<P: AsRef<Path>>(archive: P) -> Result<Option<String>> {
    let archive = archive.as_ref();
    let content = match std::fs::read_to_string(sidecar_path(archive)) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    content
        .split_whitespace()
        .next()
        .map(str::to_owned)
        .map(Some)
        .ok_or_else(|| Error::corrupt_archive(format!("empty checksum sidecar for {archive:?}")))
}

/// Re-hashes the archive and compares it against the sidecar, returning the
/// verified hex digest.
pub fn verify<P: AsRef<Path>>(archive: P) -> Result<String> {
    let archive = archive.as_ref();
    let expected = read_sidecar(archive)?
        .ok_or_else(|| Error::corrupt_archive(format!("missing checksum sidecar for {archive:?}")))?;
    let actual = hash_file(archive)?;
    if actual != expected {
        return Err(Error::corrupt_archive(format!(
            "checksum mismatch for {archive:?}: expected {expected}, got {actual}"
        )));
    }
    Ok(actual)
}
