use tracing::debug;

use crate::cipher::Obfuscator;
use crate::compression::Compression;
use crate::error::CryptoResult;

/// The `compress → obfuscate` chain wrapped around a serialized store.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    compression: Compression,
    obfuscator: Option<Obfuscator>,
}

impl Envelope {
    pub fn new(compression: Compression, obfuscate: bool) -> Self {
        Self {
            compression,
            obfuscator: obfuscate.then(Obfuscator::fixed),
        }
    }

    /// An envelope that passes bytes through unchanged.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn is_obfuscated(&self) -> bool {
        self.obfuscator.is_some()
    }

    /// Wrap serialized bytes for writing.
    pub fn seal(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let compressed = self.compression.compress(data)?;
        let sealed = match &self.obfuscator {
            Some(cipher) => cipher.seal(&compressed),
            None => compressed,
        };
        debug!(
            raw = data.len(),
            sealed = sealed.len(),
            compression = %self.compression,
            obfuscated = self.obfuscator.is_some(),
            "envelope sealed"
        );
        Ok(sealed)
    }

    /// Unwrap bytes read from disk.
    pub fn open(&self, blob: &[u8]) -> CryptoResult<Vec<u8>> {
        let compressed = match &self.obfuscator {
            Some(cipher) => cipher.open(blob)?,
            None => blob.to_vec(),
        };
        self.compression.decompress(&compressed)
    }
}
