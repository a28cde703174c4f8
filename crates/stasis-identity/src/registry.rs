use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use stasis_types::{InstanceId, TemplateId};
use tracing::{debug, error, warn};

use crate::error::{IdentityError, IdentityResult};
use crate::traits::Identified;

/// Outcome of a bulk template registration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TemplateReport {
    /// Templates newly added.
    pub registered: usize,
    /// Names offered with the nil identifier.
    pub nil: Vec<String>,
    /// Identifiers already registered under a different name.
    pub duplicates: Vec<TemplateId>,
}

impl TemplateReport {
    pub fn is_clean(&self) -> bool {
        self.nil.is_empty() && self.duplicates.is_empty()
    }
}

/// Session-scoped table from identities to live instances.
///
/// The registry holds only weak handles: an entry whose instance has been
/// dropped or reports itself dead resolves to nothing and may be replaced.
/// It is never persisted; call [`clear`](Self::clear) at session start and
/// rebuild it from registration calls as objects activate.
pub struct IdentityRegistry<T: ?Sized> {
    instances: RwLock<HashMap<InstanceId, Weak<T>>>,
    templates: RwLock<HashMap<TemplateId, String>>,
}

impl<T: ?Sized + Identified> IdentityRegistry<T> {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Map `id` to `instance`.
    ///
    /// Fails with [`IdentityError::Collision`] when `id` already maps to a
    /// different live instance; the existing mapping is kept. A mapping to
    /// the same instance or to a dead one is overwritten.
    pub fn register_or_replace(&self, id: InstanceId, instance: &Arc<T>) -> IdentityResult<()> {
        if id.is_nil() {
            return Err(IdentityError::NilIdentity);
        }
        let mut map = self.instances.write().expect("lock poisoned");
        if let Some(existing) = map.get(&id).and_then(upgrade_live) {
            if !same_instance(&existing, instance) {
                warn!(id = %id, "identity collision, keeping existing registrant");
                return Err(IdentityError::Collision(id));
            }
        }
        map.insert(id, Arc::downgrade(instance));
        Ok(())
    }

    /// Remove `id` if it maps to `instance` or to a dead instance.
    ///
    /// Returns whether an entry was removed. Another live instance's
    /// mapping is left alone.
    pub fn unregister(&self, id: &InstanceId, instance: &Arc<T>) -> bool {
        let mut map = self.instances.write().expect("lock poisoned");
        let removable = match map.get(id) {
            Some(weak) => match upgrade_live(weak) {
                Some(existing) => same_instance(&existing, instance),
                None => true,
            },
            None => false,
        };
        if removable {
            map.remove(id);
        }
        removable
    }

    /// The live instance holding `id`, if any.
    pub fn try_resolve(&self, id: &InstanceId) -> Option<Arc<T>> {
        self.instances
            .read()
            .expect("lock poisoned")
            .get(id)
            .and_then(upgrade_live)
    }

    pub fn is_registered(&self, id: &InstanceId) -> bool {
        self.try_resolve(id).is_some()
    }

    /// Register `owner` under its current identity, or a fresh one if it
    /// has none or its identity is taken.
    pub fn ensure_registered(&self, owner: &Arc<T>) -> Option<InstanceId> {
        if let Some(id) = owner.instance_id() {
            if self.register_or_replace(id, owner).is_ok() {
                return Some(id);
            }
        }
        self.generate_new_instance_identity(owner)
    }

    /// Give `owner` a freshly generated identity.
    ///
    /// The previous identity is released first. On failure `owner` is left
    /// with no identity and `None` is returned.
    pub fn generate_new_instance_identity(&self, owner: &Arc<T>) -> Option<InstanceId> {
        self.assign(owner, InstanceId::generate())
    }

    /// Give `owner` the identity `id`, typically one read from a snapshot.
    ///
    /// The previous identity is released first. On failure `owner` is left
    /// with no identity and `None` is returned.
    pub fn override_instance_identity(&self, owner: &Arc<T>, id: InstanceId) -> Option<InstanceId> {
        self.assign(owner, id)
    }

    /// Unregister `owner` and clear its identity. Call on destruction.
    pub fn release(&self, owner: &Arc<T>) -> Option<InstanceId> {
        let id = owner.instance_id()?;
        self.unregister(&id, owner);
        owner.assign_instance_id(None);
        Some(id)
    }

    /// Every live registered instance.
    pub fn live_instances(&self) -> Vec<Arc<T>> {
        self.instances
            .read()
            .expect("lock poisoned")
            .values()
            .filter_map(upgrade_live)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live_instances().len()
    }

    /// Drop entries whose instance is dead. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut map = self.instances.write().expect("lock poisoned");
        let before = map.len();
        map.retain(|_, weak| upgrade_live(weak).is_some());
        before - map.len()
    }

    /// Forget every instance and template.
    pub fn clear(&self) {
        self.instances.write().expect("lock poisoned").clear();
        self.templates.write().expect("lock poisoned").clear();
        debug!("identity registry cleared");
    }

    // -----------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------

    /// Register every known template for spawn lookup.
    pub fn register_templates<I, S>(&self, templates: I) -> TemplateReport
    where
        I: IntoIterator<Item = (TemplateId, S)>,
        S: Into<String>,
    {
        let mut report = TemplateReport::default();
        let mut map = self.templates.write().expect("lock poisoned");
        for (id, name) in templates {
            let name = name.into();
            if id.is_nil() {
                warn!(template = %name, "template with nil identity skipped");
                report.nil.push(name);
                continue;
            }
            match map.get(&id) {
                Some(existing) if *existing == name => {}
                Some(existing) => {
                    warn!(
                        id = %id,
                        existing = %existing,
                        duplicate = %name,
                        "duplicate template identity"
                    );
                    report.duplicates.push(id);
                }
                None => {
                    map.insert(id, name);
                    report.registered += 1;
                }
            }
        }
        debug!(
            registered = report.registered,
            nil = report.nil.len(),
            duplicates = report.duplicates.len(),
            "templates registered"
        );
        report
    }

    pub fn has_template(&self, id: &TemplateId) -> bool {
        self.templates.read().expect("lock poisoned").contains_key(id)
    }

    pub fn template_name(&self, id: &TemplateId) -> IdentityResult<String> {
        self.templates
            .read()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or(IdentityError::UnknownTemplate(*id))
    }

    pub fn template_count(&self) -> usize {
        self.templates.read().expect("lock poisoned").len()
    }

    fn assign(&self, owner: &Arc<T>, id: InstanceId) -> Option<InstanceId> {
        if let Some(previous) = owner.instance_id() {
            self.unregister(&previous, owner);
        }
        match self.register_or_replace(id, owner) {
            Ok(()) => {
                owner.assign_instance_id(Some(id));
                Some(id)
            }
            Err(e) => {
                owner.assign_instance_id(None);
                error!(id = %id, error = %e, "instance left without identity");
                None
            }
        }
    }
}

impl<T: ?Sized + Identified> Default for IdentityRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for IdentityRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field(
                "instances",
                &self.instances.read().expect("lock poisoned").len(),
            )
            .field(
                "templates",
                &self.templates.read().expect("lock poisoned").len(),
            )
            .finish()
    }
}

fn upgrade_live<T: ?Sized + Identified>(weak: &Weak<T>) -> Option<Arc<T>> {
    weak.upgrade().filter(|instance| instance.is_alive())
}

fn same_instance<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}
