pub mod gzip;

use crate::backup::function_path;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use derive_more::From;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use function_name::named;
use io_enum::{Read, Write};
use serde::{Deserialize, Serialize};
use std::io;
use std::io::{Read, Write};
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    GzEncoder(GzEncoder<W>),
}

#[derive(Read, From)]
pub enum Decompressor<R: Read> {
    None(R),
    GzDecoder(GzDecoder<R>),
}

#[derive(Clone, Default, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    #[default]
    None,
    Gzip(gzip::GzipConfig),
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Gzip(gz) => gz.validate(),
        }
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

/// Closes a writer stage and hands back the wrapped sink.
pub trait Finish<O> {
    fn finish(self) -> io::Result<O>;
}

pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}

impl<W: Write> Finish<W> for GzEncoder<W> {
    fn finish(self) -> io::Result<W> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::GzEncoder(w) => w.finish(),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    #[named]
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Gzip(gz) => gz.build_compressor(writer),
        }
        .add_fn_name(function_path!())
    }
}

static GZ_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Gzip(_) => Some(GZ_FILE_EXT.get_or_init(|| "gz".into()).clone()),
        }
    }
}

impl<R: Read> Decompressor<R> {
    /// Picks the decoder stage from the archive file name.
    pub fn for_file_name(name: &str, reader: R) -> Decompressor<R> {
        if name.ends_with(".gz") {
            GzDecoder::new(reader).into()
        } else {
            Decompressor::None(reader)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn config_parses_tagged_yaml() {
        let config: CompressorConfig = serde_yml::from_str("compressor_type: none").unwrap();
        assert_eq!(config, CompressorConfig::None);

        let config: CompressorConfig =
            serde_yml::from_str("compressor_type: gzip\nlevel: 4").unwrap();
        match config {
            CompressorConfig::Gzip(_) => (),
            c => panic!("Expected gzip config, got {c:?}"),
        }
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let res = serde_yml::from_str::<CompressorConfig>("compressor_type: gzip\nthreads: 2");
        assert!(res.is_err());
    }

    #[test]
    fn file_ext_follows_codec() {
        assert!(CompressorConfig::None.file_ext().is_none());
        let gz = CompressorConfig::Gzip(gzip::GzipConfig::default());
        assert_eq!(gz.file_ext().unwrap().as_ref(), "gz");
    }

    #[test]
    fn gzip_round_trips_bytes() {
        let config: CompressorConfig = gzip::GzipConfig::default().into();
        let payload = b"some bytes worth compressing, repeated repeated repeated";

        let mut writer = config.build_compressor(Cursor::new(Vec::new())).unwrap();
        writer.write_all(payload).unwrap();
        let compressed = writer.finish().unwrap().into_inner();
        assert_ne!(compressed, payload.to_vec());

        let mut decoded = Vec::new();
        Decompressor::for_file_name("b.tar.gz", Cursor::new(compressed))
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload.to_vec());
    }

    #[test]
    fn none_passes_bytes_through() {
        let config = CompressorConfig::None;
        let payload = b"plain bytes";

        let mut writer = config.build_compressor(Cursor::new(Vec::new())).unwrap();
        writer.write_all(payload).unwrap();
        let stored = writer.finish().unwrap().into_inner();
        assert_eq!(stored, payload.to_vec());

        let mut read_back = Vec::new();
        Decompressor::for_file_name("b.tar", Cursor::new(stored))
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, payload.to_vec());
    }
}
