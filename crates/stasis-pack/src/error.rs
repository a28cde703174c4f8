use stasis_store::PayloadError;

/// Errors raised by object parts and the reference context.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    /// A part could not produce its snapshot.
    #[error("pack failed for part {part}: {reason}")]
    PackFailed { part: String, reason: String },

    /// A part could not apply a snapshot.
    #[error("unpack failed for part {part}: {reason}")]
    UnpackFailed { part: String, reason: String },

    /// The snapshot package is not the type the part expects.
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] PayloadError),

    /// A part reported the nil key.
    #[error("part of {owner} has a nil key")]
    InvalidPartKey { owner: String },

    /// A deferred reference fixup failed.
    #[error("reference fixup failed: {0}")]
    Fixup(String),
}

impl PackError {
    pub fn pack_failed(part: impl ToString, reason: impl ToString) -> Self {
        Self::PackFailed {
            part: part.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn unpack_failed(part: impl ToString, reason: impl ToString) -> Self {
        Self::UnpackFailed {
            part: part.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias for pack operations.
pub type PackResult<T> = Result<T, PackError>;
