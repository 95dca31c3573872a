/*!
Content transform pipeline.

`encode` compresses and then encrypts; `decode` reverses both steps. Which steps
were applied is recorded as [`TransformFlags`] on every backup result, record and
manifest entry, so content can be decoded later without the original settings.
*/

pub mod compression;
pub mod encryption;

pub use compression::{CompressionAdapter, CompressionAlgorithm, Compressor};

use crate::error::CryptoFailure;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which transforms were applied to a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransformFlags {
    #[serde(default)]
    pub compression: CompressionAlgorithm,
    #[serde(default)]
    pub encrypted: bool,
}

impl TransformFlags {
    /// Flags for content stored verbatim
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn is_identity(&self) -> bool {
        self.compression.is_none() && !self.encrypted
    }
}

/// Settings for [`TransformPipeline`]
#[derive(Clone, Default)]
pub struct TransformConfig {
    pub compression: CompressionAlgorithm,
    pub level: u32,
    /// Encryption is enabled when a password is present
    pub password: Option<String>,
}

impl fmt::Debug for TransformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformConfig")
            .field("compression", &self.compression)
            .field("level", &self.level)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TransformConfig {
    pub fn new(compression: CompressionAlgorithm, level: u32) -> Self {
        Self {
            compression,
            level,
            password: None,
        }
    }

    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Reversible compress-then-encrypt pipeline
#[derive(Clone)]
pub struct TransformPipeline {
    compressor: Compressor,
    password: Option<String>,
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("flags", &self.flags())
            .field("level", &self.compressor.level())
            .finish()
    }
}

impl TransformPipeline {
    pub fn new(config: TransformConfig) -> Self {
        Self {
            compressor: Compressor::new(config.compression, config.level),
            password: config.password,
        }
    }

    /// Pipeline that stores content verbatim
    pub fn identity() -> Self {
        Self::new(TransformConfig::default())
    }

    /// Flags describing what [`encode`](Self::encode) applies
    pub fn flags(&self) -> TransformFlags {
        TransformFlags {
            compression: self.compressor.algorithm(),
            encrypted: self.password.is_some(),
        }
    }

    /// Compress, then encrypt, according to this pipeline's settings
    pub fn encode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.compressor.compress(raw)?;
        match &self.password {
            Some(password) => encryption::encrypt(&compressed, password),
            None => Ok(compressed),
        }
    }

    /// Inverse of [`encode`](Self::encode)
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.decode_with(data, self.flags())
    }

    /// Decode content that was produced with `flags`
    ///
    /// Used by restore, where the flags come from the manifest rather than the
    /// current configuration. Decryption uses this pipeline's password.
    pub fn decode_with(&self, data: &[u8], flags: TransformFlags) -> Result<Vec<u8>> {
        let decrypted;
        let compressed = if flags.encrypted {
            let password = self
                .password
                .as_deref()
                .ok_or(CryptoFailure::MissingPassword)?;
            decrypted = encryption::decrypt(data, password)?;
            &decrypted[..]
        } else {
            data
        };

        if flags.compression == self.compressor.algorithm() {
            self.compressor.decompress(compressed)
        } else {
            Compressor::new(flags.compression, compression::DEFAULT_LEVEL).decompress(compressed)
        }
    }
}
