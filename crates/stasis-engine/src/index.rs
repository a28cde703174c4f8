use std::collections::BTreeSet;
use std::sync::Arc;

use stasis_pack::Entity;
use stasis_store::{RecordStore, StoreResult};
use stasis_types::CompositeKey;

/// Store key of the object index.
pub const OBJECT_INDEX_KEY: &str = "__stasis.index.objects";
/// Store key of the part index.
pub const PART_INDEX_KEY: &str = "__stasis.index.parts";
/// Store key of the free-standing asset index.
pub const ASSET_INDEX_KEY: &str = "__stasis.index.assets";
/// Store key of the persisted scope context.
pub const SCOPE_CONTEXT_KEY: &str = "__stasis.scopes";

/// Record keys tracked by a save, split by kind.
///
/// Restore walks these sets instead of scanning the whole store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveIndex {
    pub objects: BTreeSet<String>,
    pub parts: BTreeSet<String>,
    pub assets: BTreeSet<String>,
}

impl SaveIndex {
    /// Read the indices from `store`; absent ones are empty.
    pub fn read(store: &RecordStore) -> StoreResult<Self> {
        Ok(Self {
            objects: store.try_get(OBJECT_INDEX_KEY)?.unwrap_or_default(),
            parts: store.try_get(PART_INDEX_KEY)?.unwrap_or_default(),
            assets: store.try_get(ASSET_INDEX_KEY)?.unwrap_or_default(),
        })
    }

    pub fn write(&self, store: &RecordStore) -> StoreResult<()> {
        store.set(OBJECT_INDEX_KEY, self.objects.clone())?;
        store.set(PART_INDEX_KEY, self.parts.clone())?;
        store.set(ASSET_INDEX_KEY, self.assets.clone())?;
        Ok(())
    }

    /// `(self − deleted) ∪ written`, per kind.
    pub fn advance(&self, deleted: &SaveIndex, written: &SaveIndex) -> Self {
        fn step(
            prev: &BTreeSet<String>,
            del: &BTreeSet<String>,
            new: &BTreeSet<String>,
        ) -> BTreeSet<String> {
            prev.difference(del).chain(new.iter()).cloned().collect()
        }
        Self {
            objects: step(&self.objects, &deleted.objects, &written.objects),
            parts: step(&self.parts, &deleted.parts, &written.parts),
            assets: step(&self.assets, &deleted.assets, &written.assets),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains(key) || self.parts.contains(key) || self.assets.contains(key)
    }

    /// Every key in all three sets.
    pub fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.objects.iter().chain(&self.parts).chain(&self.assets)
    }

    pub fn len(&self) -> usize {
        self.objects.len() + self.parts.len() + self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an object and its parts as deleted.
    pub fn mark_entity(&mut self, entity: &Arc<dyn Entity>) {
        let Some(id) = entity.instance_id() else {
            return;
        };
        self.objects.insert(id.record_key());
        for part in entity.parts() {
            let key = part.part_key();
            if !key.is_nil() {
                self.parts
                    .insert(CompositeKey::derive(&id, &key).record_key());
            }
        }
    }
}
