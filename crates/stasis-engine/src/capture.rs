use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use stasis_pack::{validate_parts, Entity, EntityRegistry, Part};
use stasis_store::RecordStore;
use stasis_types::{CompositeKey, InstanceId, ScopeContext};
use tracing::{debug, info, warn};

use crate::config::{CaptureScope, EngineConfig};
use crate::entity_label;
use crate::error::EngineResult;
use crate::host::Host;
use crate::index::{SaveIndex, SCOPE_CONTEXT_KEY};
use crate::progress::{Pacer, ProgressReporter};
use crate::report::CaptureReport;

/// Parent chains longer than this are treated as cycles.
const MAX_HIERARCHY_DEPTH: usize = 1024;

/// Writes the live object graph into a [`RecordStore`].
///
/// Every in-scope object contributes its identity record under its
/// instance key and one record per part under the part's composite key.
/// The written keys are merged into the save's indices; keys of objects
/// destroyed since the last save are subtracted first, so a save can
/// shrink as well as grow. Capture does not commit.
pub struct Capture<'a> {
    store: &'a RecordStore,
    registry: &'a EntityRegistry,
    host: &'a Host,
    config: &'a EngineConfig,
    progress: &'a ProgressReporter,
}

impl<'a> Capture<'a> {
    pub fn new(
        store: &'a RecordStore,
        registry: &'a EntityRegistry,
        host: &'a Host,
        config: &'a EngineConfig,
        progress: &'a ProgressReporter,
    ) -> Self {
        Self {
            store,
            registry,
            host,
            config,
            progress,
        }
    }

    /// Capture into the store. `deleted` holds keys of objects destroyed
    /// since the previous save.
    pub async fn run(&self, deleted: &SaveIndex) -> EngineResult<CaptureReport> {
        let start = Instant::now();
        let mut report = CaptureReport::default();
        let mut written = SaveIndex::default();
        let mut pacer = Pacer::new(self.config.yield_interval);

        let entities = self.select_entities();
        let assets = self.host.assets.assets();
        self.progress.set_total(entities.len() + assets.len());

        for (done, entity) in entities.iter().enumerate() {
            self.capture_entity(entity, &mut written, &mut report)?;
            if pacer.tick().await {
                self.progress.advance(done + 1);
            }
        }

        for asset in &assets {
            let key = asset.part_key();
            if key.is_nil() {
                warn!(part = %asset.describe(), "asset with nil key excluded");
                report.skipped_parts += 1;
                continue;
            }
            let record_key = key.record_key();
            if written.assets.contains(&record_key) {
                warn!(part = %asset.describe(), "duplicate asset key, keeping first");
                report.skipped_parts += 1;
                continue;
            }
            if self.pack_part(&record_key, asset, &mut report)? {
                written.assets.insert(record_key);
                report.assets += 1;
            }
        }

        let scopes = &self.host.scopes;
        self.store.set(
            SCOPE_CONTEXT_KEY,
            ScopeContext {
                loaded: scopes.loaded_scopes(),
                active: scopes.active_scope(),
            },
        )?;

        let previous = SaveIndex::read(self.store)?;
        let next = previous.advance(deleted, &written);
        for key in deleted.all_keys() {
            if !written.contains(key) && self.store.delete(key)? {
                report.removed += 1;
            }
        }
        next.write(self.store)?;

        report.elapsed = start.elapsed();
        info!(
            objects = report.objects,
            parts = report.parts,
            assets = report.assets,
            removed = report.removed,
            tracked = next.len(),
            "capture complete"
        );
        Ok(report)
    }

    fn capture_entity(
        &self,
        entity: &Arc<dyn Entity>,
        written: &mut SaveIndex,
        report: &mut CaptureReport,
    ) -> EngineResult<()> {
        let Some(record) = entity.identity_record() else {
            debug!("entity without identity skipped");
            return Ok(());
        };
        let id = record.instance;
        let object_key = id.record_key();
        self.store.set(object_key.clone(), record)?;
        written.objects.insert(object_key);
        report.objects += 1;

        let label = entity_label(entity.as_ref());
        let validated = validate_parts(&label, entity.parts());
        report.skipped_parts += validated.rejected.len() + validated.duplicates.len();

        for (key, part) in &validated.parts {
            let record_key = CompositeKey::derive(&id, key).record_key();
            if self.pack_part(&record_key, part, report)? {
                written.parts.insert(record_key);
                report.parts += 1;
            }
        }
        Ok(())
    }

    /// Pack one part into `record_key`. Returns whether a record was written.
    fn pack_part(
        &self,
        record_key: &str,
        part: &Arc<dyn Part>,
        report: &mut CaptureReport,
    ) -> EngineResult<bool> {
        match part.pack() {
            Ok(Some(package)) => {
                let declared = part.snapshot_type();
                if package.token() != &declared {
                    warn!(
                        part = %part.describe(),
                        declared = %declared,
                        actual = %package.token(),
                        "snapshot type differs from declared type"
                    );
                }
                self.store.set_payload(record_key, package)?;
                Ok(true)
            }
            Ok(None) => {
                warn!(part = %part.describe(), "pack produced nothing, part skipped");
                report.skipped_parts += 1;
                Ok(false)
            }
            Err(e) => {
                report.failed_parts += 1;
                self.config.unpack_policy.handle(e, &part.describe())?;
                Ok(false)
            }
        }
    }

    fn select_entities(&self) -> Vec<Arc<dyn Entity>> {
        let mut live = self.registry.live_instances();
        live.retain(|entity| entity.instance_id().is_some());
        if let CaptureScope::Roots(roots) = &self.config.capture_scope {
            let roots: HashSet<InstanceId> = roots.iter().copied().collect();
            live.retain(|entity| self.is_under(entity, &roots));
        }
        live.sort_by_key(|entity| entity.instance_id());
        live
    }

    fn is_under(&self, entity: &Arc<dyn Entity>, roots: &HashSet<InstanceId>) -> bool {
        let mut next = entity.instance_id();
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let Some(id) = next else {
                return false;
            };
            if roots.contains(&id) {
                return true;
            }
            next = self
                .registry
                .try_resolve(&id)
                .and_then(|ancestor| ancestor.parent_id());
        }
        warn!(entity = %entity_label(entity.as_ref()), "parent chain too deep, treated as a cycle");
        false
    }
}
