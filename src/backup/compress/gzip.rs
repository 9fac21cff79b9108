use crate::backup::compress::{Compressor, CompressorBuilder};
use crate::backup::result_error::result::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use validator::Validate;

/// Default compression level (balance of speed vs size)
static DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Configuration for gzip (DEFLATE) compression
///
/// Gzip keeps archives readable by standard tooling and compresses a
/// single stream, which is all the archive writer needs.
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GzipConfig {
    /// Compression level (0-9)
    ///
    /// - 0: No compression, fastest
    /// - 6: Default balance (good speed/size ratio)
    /// - 9: Slowest, smallest files
    #[validate(range(min = 0, max = 9))]
    level: Option<u32>,
}

impl GzipConfig {
    pub fn new(level: u32) -> Self {
        Self { level: Some(level) }
    }
}

impl<W: Write> CompressorBuilder<W> for GzipConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        tracing::debug!("Creating gzip compressor with level={}", level);
        Ok(GzEncoder::new(writer, Compression::new(level)).into())
    }
}
