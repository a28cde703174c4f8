use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("nil identifier is not allowed for {0}")]
    NilIdentifier(&'static str),

    #[error("empty name is not allowed for {0}")]
    EmptyName(&'static str),
}
