/// Errors from compression and obfuscation.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The selected compression algorithm has no implementation.
    #[error("compression algorithm '{0}' is not supported")]
    UnsupportedCompression(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// The blob does not start with the obfuscation magic.
    #[error("not an obfuscated blob: expected magic {expected}, got {actual}")]
    InvalidMagic { expected: String, actual: String },

    /// The blob is shorter than the fixed framing.
    #[error("obfuscated blob truncated: {len} bytes")]
    Truncated { len: usize },

    /// The integrity tag does not match the ciphertext.
    #[error("obfuscated blob failed integrity check")]
    TagMismatch,
}

/// Result alias for envelope operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
