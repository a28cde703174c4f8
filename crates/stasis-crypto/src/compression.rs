use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

/// zstd level used for save files.
pub const ZSTD_LEVEL: i32 = 3;

/// Compression applied to serialized stores before obfuscation.
///
/// `Gzip` is a reserved hook with no implementation; selecting it fails
/// every seal and open with [`CryptoError::UnsupportedCompression`] rather
/// than silently writing uncompressed data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Zstd,
    Gzip,
}

impl Compression {
    /// Returns `true` if this algorithm can be used.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Gzip)
    }

    pub fn compress(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
                .map_err(|e| CryptoError::CompressionFailed(e.to_string())),
            Self::Gzip => Err(CryptoError::UnsupportedCompression(self.to_string())),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Zstd => {
                zstd::decode_all(data).map_err(|e| CryptoError::DecompressionFailed(e.to_string()))
            }
            Self::Gzip => Err(CryptoError::UnsupportedCompression(self.to_string())),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Zstd => write!(f, "zstd"),
            Self::Gzip => write!(f, "gzip"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "zstd" => Ok(Self::Zstd),
            "gzip" => Ok(Self::Gzip),
            other => Err(format!("unknown compression '{other}'")),
        }
    }
}
