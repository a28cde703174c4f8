use std::sync::{Arc, Mutex};

use stasis_identity::IdentityRegistry;
use stasis_types::{InstanceId, PartKey, ScopeTag};

use crate::error::PackResult;
use crate::part::{Entity, Part};

/// Registry of live entities.
pub type EntityRegistry = IdentityRegistry<dyn Entity>;

/// A fixup deferred during unpack and run after the whole batch applied.
pub type Fixup = Box<dyn FnOnce(&ReferenceContext) -> PackResult<()> + Send>;

/// What a part sees while it is being unpacked.
///
/// References to other objects are resolved by identity through the
/// registry, never held across the restore. Because objects are restored
/// in no particular order, a part that needs another object's restored
/// state should [`defer`](Self::defer) the lookup instead of resolving it
/// immediately.
pub struct ReferenceContext {
    registry: Arc<EntityRegistry>,
    scope: Option<ScopeTag>,
    fixups: Mutex<Vec<Fixup>>,
}

impl ReferenceContext {
    /// Context for a full restore.
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            scope: None,
            fixups: Mutex::new(Vec::new()),
        }
    }

    /// Context for the batch restored when `scope` loaded.
    pub fn for_scope(registry: Arc<EntityRegistry>, scope: ScopeTag) -> Self {
        Self {
            scope: Some(scope),
            ..Self::new(registry)
        }
    }

    /// The scope being restored, `None` for a full restore.
    pub fn scope(&self) -> Option<&ScopeTag> {
        self.scope.as_ref()
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// The live entity with identity `id`.
    pub fn resolve(&self, id: &InstanceId) -> Option<Arc<dyn Entity>> {
        self.registry.try_resolve(id)
    }

    /// The part `key` of the live entity `owner`.
    pub fn resolve_part(&self, owner: &InstanceId, key: &PartKey) -> Option<Arc<dyn Part>> {
        self.resolve(owner)?
            .parts()
            .into_iter()
            .find(|part| part.part_key() == *key)
    }

    /// Queue `fixup` to run after every part in the batch is unpacked and
    /// every post-unpack callback has run.
    pub fn defer<F>(&self, fixup: F)
    where
        F: FnOnce(&ReferenceContext) -> PackResult<()> + Send + 'static,
    {
        self.fixups
            .lock()
            .expect("lock poisoned")
            .push(Box::new(fixup));
    }

    pub fn pending_fixups(&self) -> usize {
        self.fixups.lock().expect("lock poisoned").len()
    }

    /// Take every queued fixup, leaving the queue empty.
    pub fn take_fixups(&self) -> Vec<Fixup> {
        std::mem::take(&mut *self.fixups.lock().expect("lock poisoned"))
    }
}

impl std::fmt::Debug for ReferenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceContext")
            .field("scope", &self.scope)
            .field("pending_fixups", &self.pending_fixups())
            .finish()
    }
}
