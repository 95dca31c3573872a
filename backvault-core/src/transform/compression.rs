/*!
Compression adapters for backup content.

Whole-buffer compression with a configurable level. Raw DEFLATE, zlib and gzip
framings are supported; `none` passes data through untouched.
*/

use crate::{BackupError, Result};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Highest level accepted by every supported algorithm
pub const MAX_LEVEL: u32 = 9;

/// Default compression level
pub const DEFAULT_LEVEL: u32 = 6;

/// Compression abstraction for backup content
///
/// The transform pipeline works against this trait so it is not coupled to a
/// specific algorithm.
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    ///
    /// # Arguments
    /// * `data` - The data to compress
    ///
    /// # Returns
    /// The compressed data or an error
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    ///
    /// # Arguments
    /// * `compressed_data` - The compressed data to decompress
    ///
    /// # Returns
    /// The decompressed data or an error
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Deflate,
    Zlib,
    Gzip,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Deflate => "deflate",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Gzip => "gzip",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, CompressionAlgorithm::None)
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(CompressionAlgorithm::None),
            "deflate" => Ok(CompressionAlgorithm::Deflate),
            "zlib" => Ok(CompressionAlgorithm::Zlib),
            "gzip" => Ok(CompressionAlgorithm::Gzip),
            other => Err(BackupError::validation(format!(
                "unsupported compression format: {other}"
            ))),
        }
    }
}

/// flate2-backed compressor for any [`CompressionAlgorithm`]
///
/// # Example
/// ```rust
/// use backvault_core::transform::{CompressionAdapter, CompressionAlgorithm, Compressor};
///
/// let compressor = Compressor::new(CompressionAlgorithm::Gzip, 6);
/// let data = b"some file content to compress";
/// let compressed = compressor.compress(data).unwrap();
/// let decompressed = compressor.decompress(&compressed).unwrap();
/// assert_eq!(data, &decompressed[..]);
/// ```
#[derive(Debug, Clone)]
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    level: Compression,
}

impl Compressor {
    /// Create a compressor; levels above 9 are clamped
    pub fn new(algorithm: CompressionAlgorithm, level: u32) -> Self {
        Self {
            algorithm,
            level: Compression::new(level.min(MAX_LEVEL)),
        }
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    pub fn level(&self) -> u32 {
        self.level.level()
    }
}

fn encode_with<W: Write>(
    mut encoder: W,
    data: &[u8],
    complete: impl FnOnce(W) -> std::io::Result<Vec<u8>>,
) -> Result<Vec<u8>> {
    encoder.write_all(data).map_err(|e| {
        BackupError::compression(format!("Failed to write data for compression: {e}"))
    })?;
    complete(encoder)
        .map_err(|e| BackupError::compression(format!("Failed to finish compression: {e}")))
}

fn read_all<R: Read>(mut decoder: R) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| BackupError::compression(format!("Failed to decompress data: {e}")))?;
    Ok(decompressed)
}

impl CompressionAdapter for Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Deflate => encode_with(
                DeflateEncoder::new(Vec::new(), self.level),
                data,
                DeflateEncoder::finish,
            ),
            CompressionAlgorithm::Zlib => encode_with(
                ZlibEncoder::new(Vec::new(), self.level),
                data,
                ZlibEncoder::finish,
            ),
            CompressionAlgorithm::Gzip => encode_with(
                GzEncoder::new(Vec::new(), self.level),
                data,
                GzEncoder::finish,
            ),
        }
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            CompressionAlgorithm::None => Ok(compressed_data.to_vec()),
            CompressionAlgorithm::Deflate => read_all(DeflateDecoder::new(compressed_data)),
            CompressionAlgorithm::Zlib => read_all(ZlibDecoder::new(compressed_data)),
            CompressionAlgorithm::Gzip => read_all(GzDecoder::new(compressed_data)),
        }
    }

    fn algorithm_name(&self) -> &str {
        self.algorithm.as_str()
    }
}
