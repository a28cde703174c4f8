use std::sync::Arc;

use stasis_identity::Identified;
use stasis_store::{Payload, Persistable};
use stasis_types::{IdentityRecord, InstanceId, PartKey, Placement, ScopeTag, TemplateId, TypeToken};

use crate::context::ReferenceContext;
use crate::error::{PackError, PackResult};

/// Opaque snapshot of one part's state, tagged with its type token.
pub type SnapshotPackage = Payload;

/// Wrap `state` as a snapshot package.
pub fn package<T: Persistable>(state: T) -> SnapshotPackage {
    Payload::live(state)
}

/// Read a snapshot package as the part's state type.
pub fn unpackage<T: Persistable>(package: &SnapshotPackage) -> PackResult<T> {
    package.decode().map_err(PackError::Decode)
}

/// A piece of an object's state that can be captured and restored.
///
/// Parts are owned by an [`Entity`] or stand alone as assets. The
/// orchestrator, not the part, decides when each method runs.
pub trait Part: Send + Sync {
    /// Build-stable key, unique among the owner's parts. Must not be nil.
    fn part_key(&self) -> PartKey;

    /// Token of the payload type produced by [`pack`](Self::pack).
    fn snapshot_type(&self) -> TypeToken;

    /// Capture current state. `Ok(None)` means nothing could be captured;
    /// the part is skipped for this save.
    fn pack(&self) -> PackResult<Option<SnapshotPackage>>;

    /// Apply a previously captured snapshot.
    fn unpack(&self, package: &SnapshotPackage, ctx: &ReferenceContext) -> PackResult<()>;

    /// Runs after every part in the restore batch has been unpacked.
    /// Ordering among parts is unspecified.
    fn on_all_unpacked(&self, _ctx: &ReferenceContext) {}

    /// Variant of [`on_all_unpacked`](Self::on_all_unpacked) for batches
    /// restored because `scope` finished loading.
    fn on_scope_unpacked(&self, _scope: &ScopeTag, ctx: &ReferenceContext) {
        self.on_all_unpacked(ctx);
    }

    /// Human-readable label for logs.
    fn describe(&self) -> String {
        format!("{}<{}>", self.part_key(), self.snapshot_type())
    }
}

/// A live, identified object in the host's scene.
///
/// All mutators take `&self`; implementations use interior mutability so
/// the orchestrator can work through shared handles.
pub trait Entity: Identified {
    /// Template to respawn from, `None` if not spawnable.
    fn template_id(&self) -> Option<TemplateId>;

    fn scope(&self) -> ScopeTag;

    fn placement(&self) -> Placement;

    fn set_placement(&self, placement: Placement);

    fn parent_id(&self) -> Option<InstanceId>;

    /// Attach to `parent`, or make a root with `None`.
    fn set_parent(&self, parent: Option<&Arc<dyn Entity>>);

    fn is_active(&self) -> bool;

    fn set_active(&self, active: bool);

    fn parts(&self) -> Vec<Arc<dyn Part>>;

    /// Free-form description stored with the identity record.
    fn describe(&self) -> String {
        String::new()
    }

    /// The identity record to persist, `None` without an identity.
    fn identity_record(&self) -> Option<IdentityRecord> {
        Some(IdentityRecord {
            instance: self.instance_id()?,
            scope: self.scope(),
            template: self.template_id(),
            parent: self.parent_id(),
            placement: self.placement(),
            description: self.describe(),
        })
    }
}
