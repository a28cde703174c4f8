use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use stasis_pack::{validate_parts, Entity, EntityRegistry, Part, ReferenceContext};
use stasis_store::RecordStore;
use stasis_types::{CompositeKey, IdentityRecord, ScopeContext, ScopeTag};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::entity_label;
use crate::error::{EngineError, EngineResult};
use crate::host::Host;
use crate::index::{SaveIndex, SCOPE_CONTEXT_KEY};
use crate::progress::{CancelToken, Pacer, ProgressReporter};
use crate::report::{RestoreReport, RestoreStage, StageReport};

/// Fixup rounds run before leftover fixups are dropped.
pub const MAX_FIXUP_ROUNDS: usize = 16;

/// Stages a restore walks after the store is loaded.
const STAGES: [RestoreStage; 5] = [
    RestoreStage::RestoringScopeContext,
    RestoreStage::ReconcilingObjects,
    RestoreStage::RestoringHierarchy,
    RestoreStage::ApplyingPartState,
    RestoreStage::RunningPostCallbacks,
];

/// What a restore covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreMode {
    /// Every record in the store, plus free-standing assets.
    Full,
    /// Only the records of one scope that just finished loading.
    Scope(ScopeTag),
}

/// Mutable state carried between stages of one run.
struct RunState {
    ctx: ReferenceContext,
    records: Vec<IdentityRecord>,
    /// Objects matched or spawned by reconciliation, inactive until parts apply.
    restored: Vec<Arc<dyn Entity>>,
    activated: bool,
    applied: Vec<Arc<dyn Part>>,
    pacer: Pacer,
}

/// Drives the restore stages against a loaded [`RecordStore`].
///
/// Each stage is timed into a [`StageReport`], mirroring the stage
/// pipeline of a gate: the first failing stage aborts the rest. Stages
/// already applied are not rolled back; objects deactivated by
/// reconciliation are reactivated so the host is left in a usable state.
pub struct Restore<'a> {
    store: &'a RecordStore,
    registry: &'a Arc<EntityRegistry>,
    host: &'a Host,
    config: &'a EngineConfig,
    progress: &'a ProgressReporter,
    cancel: &'a CancelToken,
}

impl<'a> Restore<'a> {
    pub fn new(
        store: &'a RecordStore,
        registry: &'a Arc<EntityRegistry>,
        host: &'a Host,
        config: &'a EngineConfig,
        progress: &'a ProgressReporter,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            store,
            registry,
            host,
            config,
            progress,
            cancel,
        }
    }

    /// Run every stage for `mode`, appending stage results and counters to
    /// `report`. The report is filled in even when the run fails.
    pub async fn run(&self, mode: &RestoreMode, report: &mut RestoreReport) -> EngineResult<()> {
        let ctx = match mode {
            RestoreMode::Full => ReferenceContext::new(Arc::clone(self.registry)),
            RestoreMode::Scope(scope) => {
                ReferenceContext::for_scope(Arc::clone(self.registry), scope.clone())
            }
        };
        let mut run = RunState {
            ctx,
            records: Vec::new(),
            restored: Vec::new(),
            activated: false,
            applied: Vec::new(),
            pacer: Pacer::new(self.config.yield_interval),
        };

        for stage in STAGES {
            if stage == RestoreStage::RestoringScopeContext && !self.restores_scope_context(mode) {
                continue;
            }
            if self.cancel.is_cancelled() {
                info!(stage = %stage, "restore cancelled");
                Self::reactivate(&mut run);
                return Err(EngineError::Cancelled { stage });
            }

            debug!(stage = %stage, "restore stage started");
            self.progress.stage(stage, 0);
            let stage_start = Instant::now();
            let result = match stage {
                RestoreStage::RestoringScopeContext => {
                    self.restore_scope_context(&mut run, report).await
                }
                RestoreStage::ReconcilingObjects => self.reconcile(mode, &mut run, report).await,
                RestoreStage::RestoringHierarchy => self.restore_hierarchy(&mut run, report).await,
                RestoreStage::ApplyingPartState => self.apply_parts(mode, &mut run, report).await,
                RestoreStage::RunningPostCallbacks => {
                    self.run_post_callbacks(mode, &mut run, report).await
                }
                RestoreStage::Idle | RestoreStage::LoadingStore => Ok(()),
            };

            report.stages.push(StageReport {
                stage,
                passed: result.is_ok(),
                reason: result.as_ref().err().map(ToString::to_string),
                elapsed: stage_start.elapsed(),
            });

            if let Err(e) = result {
                error!(stage = %stage, error = %e, "restore aborted");
                Self::reactivate(&mut run);
                return Err(EngineError::Aborted {
                    stage,
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }

    fn restores_scope_context(&self, mode: &RestoreMode) -> bool {
        matches!(mode, RestoreMode::Full) && self.config.restore_scope_context
    }

    fn reactivate(run: &mut RunState) {
        if run.activated {
            return;
        }
        for entity in run.restored.iter().filter(|e| e.is_alive()) {
            entity.set_active(true);
        }
        run.activated = true;
    }

    // ---------------------------------------------------------------
    // Scope context
    // ---------------------------------------------------------------

    async fn restore_scope_context(
        &self,
        run: &mut RunState,
        report: &mut RestoreReport,
    ) -> EngineResult<()> {
        let Some(saved) = self.store.try_get::<ScopeContext>(SCOPE_CONTEXT_KEY)? else {
            debug!("no saved scope context");
            return Ok(());
        };
        let scopes = &self.host.scopes;
        let host_scope = scopes.host_scope();
        let current = scopes.loaded_scopes();
        self.progress
            .stage(RestoreStage::RestoringScopeContext, current.len() + saved.loaded.len());

        let mut done = 0;
        for scope in current.iter().filter(|s| Some(*s) != host_scope.as_ref()) {
            if let Err(e) = scopes.unload(scope).await {
                warn!(scope = %scope, error = %e, "scope unload failed");
                report.scope_failures += 1;
            }
            done += 1;
            if run.pacer.tick().await {
                self.progress.advance(done);
            }
        }

        for scope in &saved.loaded {
            if scopes.is_loaded(scope) {
                continue;
            }
            if let Err(e) = scopes.load(scope).await {
                warn!(scope = %scope, error = %e, "scope load failed");
                report.scope_failures += 1;
            }
            done += 1;
            if run.pacer.tick().await {
                self.progress.advance(done);
            }
        }

        if let Some(active) = &saved.active {
            if let Err(e) = scopes.set_active(active) {
                warn!(scope = %active, error = %e, "activating saved scope failed");
                report.scope_failures += 1;
            }
        }
        info!(loaded = saved.loaded.len(), "scope context restored");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Pass A: reconcile saved identities with live objects
    // ---------------------------------------------------------------

    async fn reconcile(
        &self,
        mode: &RestoreMode,
        run: &mut RunState,
        report: &mut RestoreReport,
    ) -> EngineResult<()> {
        let index = SaveIndex::read(self.store)?;
        self.progress
            .stage(RestoreStage::ReconcilingObjects, index.objects.len());

        for (done, key) in index.objects.iter().enumerate() {
            let record: IdentityRecord = self.store.get(key)?;
            if let RestoreMode::Scope(scope) = mode {
                if &record.scope != scope {
                    continue;
                }
            }
            self.reconcile_record(&record, run, report).await;
            run.records.push(record);
            if run.pacer.tick().await {
                self.progress.advance(done + 1);
            }
        }
        debug!(
            matched = report.matched,
            spawned = report.spawned,
            dropped = report.dropped,
            deferred = report.deferred,
            "reconciliation complete"
        );
        Ok(())
    }

    async fn reconcile_record(
        &self,
        record: &IdentityRecord,
        run: &mut RunState,
        report: &mut RestoreReport,
    ) {
        let id = record.instance;

        if let Some(entity) = self.registry.try_resolve(&id) {
            entity.set_placement(record.placement);
            entity.set_active(false);
            run.restored.push(entity);
            report.matched += 1;
            return;
        }

        let Some(template) = record.template else {
            warn!(
                instance = %id,
                description = %record.description,
                "no live object and no template, record dropped"
            );
            report.dropped += 1;
            return;
        };

        if !self.registry.has_template(&template) {
            warn!(instance = %id, template = %template, "template not registered, record dropped");
            report.dropped += 1;
            return;
        }

        if !self.host.scopes.is_loaded(&record.scope) {
            debug!(instance = %id, scope = %record.scope, "scope not loaded, record deferred");
            report.deferred += 1;
            return;
        }

        let entity = match self
            .host
            .spawner
            .spawn(&template, record.placement, &record.scope)
            .await
        {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                warn!(instance = %id, template = %template, "host has no such template, record dropped");
                report.dropped += 1;
                return;
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "spawn failed, record dropped");
                report.dropped += 1;
                return;
            }
        };

        if self
            .registry
            .override_instance_identity(&entity, id)
            .is_none()
        {
            entity.set_active(false);
            warn!(
                instance = %id,
                entity = %entity_label(entity.as_ref()),
                "identity already taken, spawned instance orphaned and deactivated"
            );
            report.orphaned += 1;
            report.dropped += 1;
            return;
        }
        entity.set_placement(record.placement);
        entity.set_active(false);
        run.restored.push(entity);
        report.spawned += 1;
    }

    // ---------------------------------------------------------------
    // Pass B: hierarchy
    // ---------------------------------------------------------------

    async fn restore_hierarchy(
        &self,
        run: &mut RunState,
        report: &mut RestoreReport,
    ) -> EngineResult<()> {
        self.progress
            .stage(RestoreStage::RestoringHierarchy, run.records.len());

        for (done, record) in run.records.iter().enumerate() {
            let Some(parent_id) = record.parent else {
                continue;
            };
            let Some(child) = self.registry.try_resolve(&record.instance) else {
                continue;
            };
            let parent = self.registry.try_resolve(&parent_id);
            if parent.is_none() {
                debug!(
                    child = %record.instance,
                    parent = %parent_id,
                    "parent not live, attached to root"
                );
            }
            child.set_parent(parent.as_ref());
            report.reparented += 1;
            if run.pacer.tick().await {
                self.progress.advance(done + 1);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Part state
    // ---------------------------------------------------------------

    async fn apply_parts(
        &self,
        mode: &RestoreMode,
        run: &mut RunState,
        report: &mut RestoreReport,
    ) -> EngineResult<()> {
        let entities = match mode {
            RestoreMode::Full => {
                let mut live = self.registry.live_instances();
                live.sort_by_key(|entity| entity.instance_id());
                live
            }
            RestoreMode::Scope(_) => run.restored.clone(),
        };

        let mut batch: Vec<(String, Arc<dyn Part>)> = Vec::new();
        let mut owners: HashMap<String, String> = HashMap::new();
        for entity in &entities {
            let Some(id) = entity.instance_id() else {
                continue;
            };
            let label = entity_label(entity.as_ref());
            let validated = validate_parts(&label, entity.parts());
            for (key, part) in validated.parts {
                let record_key = CompositeKey::derive(&id, &key).record_key();
                admit(record_key, part, &label, &mut owners, &mut batch, report);
            }
        }
        if matches!(mode, RestoreMode::Full) {
            for asset in self.host.assets.assets() {
                let key = asset.part_key();
                if key.is_nil() {
                    continue;
                }
                admit(key.record_key(), asset, "asset", &mut owners, &mut batch, report);
            }
        }

        self.progress
            .stage(RestoreStage::ApplyingPartState, batch.len());
        for (done, (key, part)) in batch.into_iter().enumerate() {
            if let Some(package) = self.store.try_get_payload(&key)? {
                match part.unpack(&package, &run.ctx) {
                    Ok(()) => {
                        run.applied.push(part);
                        report.applied_parts += 1;
                    }
                    Err(e) => {
                        report.failed_parts += 1;
                        self.config.unpack_policy.handle(e, &part.describe())?;
                    }
                }
            }
            if run.pacer.tick().await {
                self.progress.advance(done + 1);
            }
        }

        for entity in run.restored.iter().filter(|e| e.is_alive()) {
            entity.set_active(true);
        }
        run.activated = true;
        debug!(
            applied = report.applied_parts,
            activated = run.restored.len(),
            "part state applied"
        );
        Ok(())
    }

    // ---------------------------------------------------------------
    // Post-unpack callbacks and deferred fixups
    // ---------------------------------------------------------------

    async fn run_post_callbacks(
        &self,
        mode: &RestoreMode,
        run: &mut RunState,
        report: &mut RestoreReport,
    ) -> EngineResult<()> {
        self.progress
            .stage(RestoreStage::RunningPostCallbacks, run.applied.len());

        for (done, part) in run.applied.iter().enumerate() {
            match mode {
                RestoreMode::Full => part.on_all_unpacked(&run.ctx),
                RestoreMode::Scope(scope) => part.on_scope_unpacked(scope, &run.ctx),
            }
            if run.pacer.tick().await {
                self.progress.advance(done + 1);
            }
        }

        for _ in 0..MAX_FIXUP_ROUNDS {
            let fixups = run.ctx.take_fixups();
            if fixups.is_empty() {
                return Ok(());
            }
            for fixup in fixups {
                report.fixups += 1;
                if let Err(e) = fixup(&run.ctx) {
                    report.failed_fixups += 1;
                    self.config.unpack_policy.handle(e, "fixup")?;
                }
            }
        }

        let dropped = run.ctx.take_fixups().len();
        if dropped > 0 {
            warn!(
                dropped,
                rounds = MAX_FIXUP_ROUNDS,
                "fixups still pending after the last round, dropped"
            );
        }
        Ok(())
    }
}

/// Queue a part for unpacking unless another part already derived its key.
fn admit(
    record_key: String,
    part: Arc<dyn Part>,
    owner: &str,
    owners: &mut HashMap<String, String>,
    batch: &mut Vec<(String, Arc<dyn Part>)>,
    report: &mut RestoreReport,
) {
    if let Some(first) = owners.get(&record_key) {
        warn!(
            key = %record_key,
            first = %first,
            second = %owner,
            "duplicate composite key, keeping the first part"
        );
        report.duplicate_keys += 1;
        return;
    }
    owners.insert(record_key.clone(), owner.to_string());
    batch.push((record_key, part));
}
