//! Capture and restore orchestration for stasis save files.
//!
//! A [`Persistence`] session walks the live object graph into a
//! [`RecordStore`](stasis_store::RecordStore) on save, and on load replays
//! it: saved scopes are reloaded, saved identities are matched against live
//! objects or spawned from their templates, parent links are rebuilt, part
//! state is applied, and post-unpack callbacks run.
//!
//! # Key Types
//!
//! - [`Persistence`]: session facade, one operation at a time
//! - [`Capture`]: writes identity and part records plus the save indices
//! - [`Restore`]: the staged restore state machine
//! - [`RestoreReport`] / [`CaptureReport`]: per-run outcomes and stage timings
//! - [`Host`]: collaborators supplied by the host application
//! - [`SaveSlots`]: slot naming, versioned files, and listing

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod index;
pub mod progress;
pub mod report;
pub mod restore;
pub mod session;
pub mod slots;

#[cfg(test)]
pub(crate) mod testing;

pub use capture::Capture;
pub use config::{CaptureScope, EngineConfig, UnpackPolicy};
pub use error::{EngineError, EngineResult, HostError};
pub use events::{EventBus, EventStream, PersistenceEvent};
pub use host::{AssetSource, Host, NoAssets, ScopeLoader, SpawnProvider};
pub use index::{SaveIndex, ASSET_INDEX_KEY, OBJECT_INDEX_KEY, PART_INDEX_KEY, SCOPE_CONTEXT_KEY};
pub use progress::{CancelToken, Operation, Pacer, ProgressReporter, ProgressState};
pub use report::{CaptureReport, RestoreReport, RestoreStage, StageReport};
pub use restore::{RestoreMode, Restore, MAX_FIXUP_ROUNDS};
pub use session::Persistence;
pub use slots::{SaveSlots, SlotEntry, DEFAULT_EXTENSION};

use stasis_pack::Entity;

/// A short human label for log lines.
pub(crate) fn entity_label(entity: &dyn Entity) -> String {
    let description = entity.describe();
    if !description.is_empty() {
        return description;
    }
    entity
        .instance_id()
        .map_or_else(|| "<unidentified>".to_string(), |id| id.short_id())
}
