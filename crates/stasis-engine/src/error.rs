use stasis_pack::PackError;
use stasis_store::StoreError;
use stasis_types::{ScopeTag, TemplateId};

use crate::report::RestoreStage;

/// Failures reported by host collaborators.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("spawning template {template} failed: {reason}")]
    SpawnFailed { template: TemplateId, reason: String },

    #[error("loading scope {scope} failed: {reason}")]
    ScopeLoad { scope: ScopeTag, reason: String },

    #[error("unloading scope {scope} failed: {reason}")]
    ScopeUnload { scope: ScopeTag, reason: String },

    #[error("activating scope {scope} failed: {reason}")]
    ScopeActivate { scope: ScopeTag, reason: String },
}

/// Errors from capture, restore, and the persistence session.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("part error: {0}")]
    Pack(#[from] PackError),

    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// Another capture or restore is running.
    #[error("a capture or restore is already in progress")]
    Busy,

    /// The operation was cancelled before `stage` started.
    #[error("cancelled before {stage}")]
    Cancelled { stage: RestoreStage },

    /// A restore stage failed; earlier stages stay applied.
    #[error("restore aborted during {stage}: {source}")]
    Aborted {
        stage: RestoreStage,
        #[source]
        source: Box<EngineError>,
    },

    #[error("save slot error: {0}")]
    Slot(String),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
