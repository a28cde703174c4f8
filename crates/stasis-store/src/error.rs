use std::path::PathBuf;
use std::time::Duration;

use stasis_crypto::CryptoError;
use stasis_types::TypeToken;

/// Failure to convert a stored payload to or from a Rust value.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The stored type token differs from the requested one.
    #[error("stored as {actual}, requested {expected}")]
    TokenMismatch {
        expected: TypeToken,
        actual: TypeToken,
    },

    /// A boxed value is a different Rust type than requested.
    #[error("boxed {token} value is not the requested Rust type")]
    WrongLiveType { token: TypeToken },

    #[error("cannot encode {token}: {reason}")]
    Encode { token: TypeToken, reason: String },

    #[error("cannot decode {token}: {reason}")]
    Decode { token: TypeToken, reason: String },

    /// Binary payloads carry no structure and need their concrete type.
    #[error("binary {token} payload cannot be viewed without its concrete type")]
    Opaque { token: TypeToken },
}

/// Errors from record store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No database file is bound to the store.
    #[error("store is not loaded")]
    NotLoaded,

    /// A load was attempted while in-memory changes are uncommitted.
    #[error("uncommitted changes; commit or revert before loading {path}")]
    UncommittedChanges { path: PathBuf },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The record under `key` cannot be read as the requested type.
    #[error("type mismatch for key {key}: {source}")]
    TypeMismatch {
        key: String,
        #[source]
        source: PayloadError,
    },

    /// The store's critical section stayed busy beyond the bound.
    #[error("store locked; gave up after {waited:?}")]
    LockTimeout { waited: Duration },

    /// The selected option or operation has no implementation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("envelope error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The container bytes are malformed.
    #[error("corrupt container: {0}")]
    Corrupt(String),

    #[error("unsupported container version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// The migration hook rejected the loaded records.
    #[error("migration from {from} failed: {reason}")]
    Migration { from: String, reason: String },

    /// The background encode/write task did not complete.
    #[error("background task failed: {0}")]
    Background(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
