use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use stasis_identity::TemplateReport;
use stasis_pack::{Entity, EntityRegistry};
use stasis_store::{RecordStore, StoreError};
use stasis_types::{InstanceId, PartKey, ScopeTag, TemplateId};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::capture::Capture;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventStream, PersistenceEvent};
use crate::host::Host;
use crate::index::SaveIndex;
use crate::progress::{CancelToken, Operation, ProgressReporter, ProgressState};
use crate::report::{CaptureReport, RestoreReport, RestoreStage, StageReport};
use crate::restore::{Restore, RestoreMode};

/// Clears the busy flag and resets progress when an operation ends.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    progress: &'a ProgressReporter,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.progress.finish();
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// A persistence session: one store, one identity registry, one host.
///
/// At most one capture or restore runs at a time. Explicit operations
/// started while another is running fail with [`EngineError::Busy`]; the
/// implicit restore triggered by a scope load is skipped instead.
pub struct Persistence {
    store: RecordStore,
    registry: Arc<EntityRegistry>,
    host: Host,
    config: EngineConfig,
    busy: AtomicBool,
    deleted: Mutex<SaveIndex>,
    progress: ProgressReporter,
    events: EventBus,
    cancel: CancelToken,
}

impl Persistence {
    pub fn new(store: RecordStore, host: Host, config: EngineConfig) -> Self {
        Self::with_registry(store, Arc::new(EntityRegistry::new()), host, config)
    }

    /// Create a session over an existing registry.
    pub fn with_registry(
        store: RecordStore,
        registry: Arc<EntityRegistry>,
        host: Host,
        config: EngineConfig,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            store,
            registry,
            host,
            config,
            busy: AtomicBool::new(false),
            deleted: Mutex::new(SaveIndex::default()),
            progress: ProgressReporter::new(),
            events,
            cancel: CancelToken::new(),
        }
    }

    /// Begin a session: forget every tracked object and register the
    /// template catalog restore may spawn from.
    pub fn start_session<I, S>(&self, templates: I) -> TemplateReport
    where
        I: IntoIterator<Item = (TemplateId, S)>,
        S: Into<String>,
    {
        self.registry.clear();
        *self.deleted.lock().expect("lock poisoned") = SaveIndex::default();
        let report = self.registry.register_templates(templates);
        info!(
            templates = report.registered,
            clean = report.is_clean(),
            "persistence session started"
        );
        report
    }

    /// Give `entity` an identity if it has none and start tracking it.
    pub fn track(&self, entity: &Arc<dyn Entity>) -> Option<InstanceId> {
        self.registry.ensure_registered(entity)
    }

    /// Stop tracking a destroyed object; its records are removed by the
    /// next save.
    pub fn destroy(&self, entity: &Arc<dyn Entity>) -> Option<InstanceId> {
        self.deleted
            .lock()
            .expect("lock poisoned")
            .mark_entity(entity);
        let id = self.registry.release(entity);
        debug!(instance = ?id, "entity destroyed");
        id
    }

    /// Drop a free-standing asset's record at the next save.
    pub fn forget_asset(&self, key: &PartKey) {
        self.deleted
            .lock()
            .expect("lock poisoned")
            .assets
            .insert(key.record_key());
    }

    /// Open `path` without restoring anything.
    pub async fn open(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let _guard = self.enter(Operation::Restoring)?;
        self.store.load(path).await?;
        self.reset_deletes();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Save
    // ---------------------------------------------------------------

    /// Capture the live graph into the open store and commit it.
    ///
    /// Waits up to `lock_wait` for a load or commit already running on
    /// the store before capturing.
    pub async fn save(&self) -> EngineResult<CaptureReport> {
        let _guard = self.enter(Operation::Saving)?;
        if !self.store.wait_unlocked(self.config.lock_wait).await {
            let waited = self.config.lock_wait;
            return Err(self.failed("save", StoreError::LockTimeout { waited }.into()));
        }
        let deleted = self.deleted.lock().expect("lock poisoned").clone();

        let capture = Capture::new(
            &self.store,
            &self.registry,
            &self.host,
            &self.config,
            &self.progress,
        );
        let result = async {
            let report = capture.run(&deleted).await?;
            self.store.commit().await?;
            Ok::<_, EngineError>(report)
        }
        .await;

        match result {
            Ok(report) => {
                {
                    let mut pending = self.deleted.lock().expect("lock poisoned");
                    *pending = pending.advance(&deleted, &SaveIndex::default());
                }
                let path = self.store.path().unwrap_or_default();
                info!(path = %path.display(), objects = report.objects, "save complete");
                self.events.publish(PersistenceEvent::SaveCompleted {
                    path,
                    records: self.store.len(),
                });
                Ok(report)
            }
            Err(e) => Err(self.failed("save", e)),
        }
    }

    /// Open `path`, then save into it.
    pub async fn save_to(&self, path: impl AsRef<Path>) -> EngineResult<CaptureReport> {
        let path = path.as_ref();
        if self.store.path().as_deref() != Some(path) {
            {
                let _guard = self.enter(Operation::Saving)?;
                self.store.load(path).await?;
            }
            self.reset_deletes();
        }
        self.save().await
    }

    // ---------------------------------------------------------------
    // Restore
    // ---------------------------------------------------------------

    /// Load `path` and run a full restore from it.
    pub async fn load_and_restore(&self, path: impl AsRef<Path>) -> EngineResult<RestoreReport> {
        let _guard = self.enter(Operation::Restoring)?;
        let path = path.as_ref();
        let start = Instant::now();
        let mut report = RestoreReport::default();

        self.progress.stage(RestoreStage::LoadingStore, 1);
        let stage_start = Instant::now();
        let loaded = self.store.load(path).await;
        report.stages.push(StageReport {
            stage: RestoreStage::LoadingStore,
            passed: loaded.is_ok(),
            reason: loaded.as_ref().err().map(ToString::to_string),
            elapsed: stage_start.elapsed(),
        });
        if let Err(e) = loaded {
            return Err(self.failed(
                "load",
                EngineError::Aborted {
                    stage: RestoreStage::LoadingStore,
                    source: Box::new(e.into()),
                },
            ));
        }
        self.reset_deletes();

        let result = self.restorer().run(&RestoreMode::Full, &mut report).await;
        report.elapsed = start.elapsed();
        match result {
            Ok(()) => {
                info!(
                    path = %path.display(),
                    matched = report.matched,
                    spawned = report.spawned,
                    parts = report.applied_parts,
                    "restore complete"
                );
                self.events.publish(PersistenceEvent::LoadCompleted {
                    path: path.to_path_buf(),
                    objects: report.matched + report.spawned,
                });
                Ok(report)
            }
            Err(e) => Err(self.failed("load", e)),
        }
    }

    /// Run a full restore from the already open store.
    pub async fn restore(&self) -> EngineResult<RestoreReport> {
        let _guard = self.enter(Operation::Restoring)?;
        if !self.store.is_loaded() {
            return Err(StoreError::NotLoaded.into());
        }
        let start = Instant::now();
        let mut report = RestoreReport::default();
        let result = self.restorer().run(&RestoreMode::Full, &mut report).await;
        report.elapsed = start.elapsed();
        match result {
            Ok(()) => {
                self.events.publish(PersistenceEvent::LoadCompleted {
                    path: self.store.path().unwrap_or_default(),
                    objects: report.matched + report.spawned,
                });
                Ok(report)
            }
            Err(e) => Err(self.failed("restore", e)),
        }
    }

    /// Restore the records of a scope that just finished loading.
    ///
    /// Returns `Ok(None)` when the restore was skipped: no store is open,
    /// the store stayed locked past the configured wait, or another
    /// operation is running.
    pub async fn on_scope_loaded(&self, scope: &ScopeTag) -> EngineResult<Option<RestoreReport>> {
        if !self.store.is_loaded() {
            debug!(scope = %scope, "no store open, scope restore skipped");
            return Ok(None);
        }
        if !self.store.wait_unlocked(self.config.lock_wait).await {
            warn!(
                scope = %scope,
                waited_ms = self.config.lock_wait.as_millis() as u64,
                "store stayed locked, scope restore skipped"
            );
            return Ok(None);
        }
        let Ok(_guard) = self.enter(Operation::Restoring) else {
            warn!(scope = %scope, "session busy, scope restore skipped");
            return Ok(None);
        };

        let start = Instant::now();
        let mut report = RestoreReport::default();
        let result = self
            .restorer()
            .run(&RestoreMode::Scope(scope.clone()), &mut report)
            .await;
        report.elapsed = start.elapsed();
        match result {
            Ok(()) => {
                debug!(scope = %scope, parts = report.applied_parts, "scope restored");
                self.events.publish(PersistenceEvent::ScopeRestored {
                    scope: scope.clone(),
                    parts: report.applied_parts,
                });
                Ok(Some(report))
            }
            Err(e) => Err(self.failed("scope restore", e)),
        }
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    /// Stop a running restore before its next stage.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> watch::Receiver<ProgressState> {
        self.progress.subscribe()
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Keys queued for removal at the next save.
    pub fn pending_deletes(&self) -> SaveIndex {
        self.deleted.lock().expect("lock poisoned").clone()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.store.path()
    }

    // ---------------------------------------------------------------
    // Internal
    // ---------------------------------------------------------------

    fn enter(&self, operation: Operation) -> EngineResult<BusyGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::Busy);
        }
        self.cancel.reset();
        self.progress.begin(operation);
        Ok(BusyGuard {
            busy: &self.busy,
            progress: &self.progress,
        })
    }

    fn restorer(&self) -> Restore<'_> {
        Restore::new(
            &self.store,
            &self.registry,
            &self.host,
            &self.config,
            &self.progress,
            &self.cancel,
        )
    }

    fn reset_deletes(&self) {
        *self.deleted.lock().expect("lock poisoned") = SaveIndex::default();
    }

    fn failed(&self, operation: &'static str, error: EngineError) -> EngineError {
        error!(operation, error = %error, "persistence operation failed");
        self.events.publish(PersistenceEvent::Failed {
            operation,
            message: error.to_string(),
        });
        error
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use stasis_identity::Identified;
    use stasis_store::{Backend, MemoryMedium, StoreConfig};
    use stasis_types::{CompositeKey, Placement, Uid};

    use super::*;
    use crate::config::CaptureScope;
    use crate::host::ScopeLoader;
    use crate::testing::*;

    #[tokio::test]
    async fn restore_matches_spawns_and_drops() {
        let w = world(EngineConfig::default());
        let kept = w.spawn_live("kept", Some(crate_template()), "level", 1);
        let respawned = w.spawn_live("respawned", Some(crate_template()), "level", 2);
        let lost = w.spawn_live("lost", None, "level", 3);
        respawned.set_placement(Placement::at([4.0, 5.0, 6.0]));
        let respawned_id = w.id(&respawned);

        let saved = w.session.save_to(&w.path).await.unwrap();
        assert_eq!(saved.objects, 3);
        assert_eq!(saved.parts, 3);

        kept.counter.set(99);
        respawned.kill();
        lost.kill();

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!((report.matched, report.spawned, report.dropped), (1, 1, 1));
        assert!(report.all_passed());
        assert_eq!(kept.counter.value(), 1);
        assert!(kept.is_active());

        let spawned = w.spawner.find(respawned_id).unwrap();
        assert_eq!(spawned.counter.value(), 2);
        assert_eq!(spawned.placement(), Placement::at([4.0, 5.0, 6.0]));
        assert!(spawned.is_active());
        assert!(w.session.registry().is_registered(&respawned_id));
    }

    #[tokio::test]
    async fn restore_records_every_stage() {
        let w = world(EngineConfig::default());
        w.spawn_live("a", None, "level", 1);
        w.session.save_to(&w.path).await.unwrap();

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        let stages: Vec<_> = report.stages.iter().map(|s| s.stage).collect();
        assert_eq!(
            stages,
            [
                RestoreStage::LoadingStore,
                RestoreStage::RestoringScopeContext,
                RestoreStage::ReconcilingObjects,
                RestoreStage::RestoringHierarchy,
                RestoreStage::ApplyingPartState,
                RestoreStage::RunningPostCallbacks,
            ]
        );
        assert!(report.all_passed());
        assert!(!w.session.is_busy());
    }

    #[tokio::test]
    async fn hierarchy_is_rebuilt_for_spawned_children() {
        let w = world(EngineConfig::default());
        let parent = w.spawn_live("parent", None, "level", 0);
        let child = w.spawn_live("child", Some(crate_template()), "level", 5);
        child.set_parent(Some(&parent.as_entity()));
        let parent_id = w.id(&parent);
        let child_id = w.id(&child);

        w.session.save_to(&w.path).await.unwrap();
        child.kill();

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(report.reparented, 1);
        let spawned = w.spawner.find(child_id).unwrap();
        assert_eq!(spawned.parent_id(), Some(parent_id));
        assert_eq!(spawned.counter.value(), 5);
    }

    #[tokio::test]
    async fn missing_parent_attaches_to_root() {
        let w = world(EngineConfig::default());
        let parent = w.spawn_live("parent", None, "level", 0);
        let child = w.spawn_live("child", Some(crate_template()), "level", 5);
        child.set_parent(Some(&parent.as_entity()));
        let child_id = w.id(&child);

        w.session.save_to(&w.path).await.unwrap();
        parent.kill();
        child.kill();

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(report.dropped, 1);
        let spawned = w.spawner.find(child_id).unwrap();
        assert_eq!(spawned.parent_id(), None);
    }

    #[tokio::test]
    async fn unknown_template_is_dropped() {
        let w = world(EngineConfig::default());
        let other = TemplateId::named("prefabs/barrel").unwrap();
        let barrel = w.spawn_live("barrel", Some(other), "level", 1);
        w.session.save_to(&w.path).await.unwrap();
        barrel.kill();

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(w.spawner.spawned().is_empty());
    }

    #[tokio::test]
    async fn lenient_policy_skips_failing_parts() {
        let w = world(EngineConfig::default());
        let good = w.spawn_live("good", None, "level", 1);
        let bad = w.spawn_live("bad", None, "level", 2);
        w.session.save_to(&w.path).await.unwrap();

        good.counter.set(10);
        bad.counter.set(20);
        bad.counter.fail_unpack.store(true, Ordering::SeqCst);

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(report.applied_parts, 1);
        assert_eq!(report.failed_parts, 1);
        assert_eq!(good.counter.value(), 1);
        assert_eq!(bad.counter.value(), 20);
    }

    #[tokio::test]
    async fn strict_policy_aborts_and_reactivates() {
        let w = world(EngineConfig::strict());
        let good = w.spawn_live("good", None, "level", 1);
        let bad = w.spawn_live("bad", None, "level", 2);
        w.session.save_to(&w.path).await.unwrap();
        bad.counter.fail_unpack.store(true, Ordering::SeqCst);

        let err = w.session.load_and_restore(&w.path).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Aborted {
                stage: RestoreStage::ApplyingPartState,
                ..
            }
        ));
        assert!(good.is_active());
        assert!(bad.is_active());
        assert!(!w.session.is_busy());
    }

    #[tokio::test]
    async fn strict_capture_propagates_pack_failure() {
        let w = world(EngineConfig::strict());
        let a = w.spawn_live("a", None, "level", 1);
        a.counter.fail_pack.store(true, Ordering::SeqCst);

        let err = w.session.save_to(&w.path).await.unwrap_err();
        assert!(matches!(err, EngineError::Pack(_)));
    }

    #[tokio::test]
    async fn lenient_capture_skips_failing_part() {
        let w = world(EngineConfig::default());
        let a = w.spawn_live("a", None, "level", 1);
        w.spawn_live("b", None, "level", 2);
        a.counter.fail_pack.store(true, Ordering::SeqCst);

        let report = w.session.save_to(&w.path).await.unwrap();
        assert_eq!(report.objects, 2);
        assert_eq!(report.parts, 1);
        assert_eq!(report.failed_parts, 1);
    }

    #[tokio::test]
    async fn parts_unpack_before_activation_and_callbacks() {
        let w = world(EngineConfig::default());
        w.spawn_live("a", Some(crate_template()), "level", 1);
        w.spawn_live("b", None, "level", 2);
        w.session.save_to(&w.path).await.unwrap();
        w.clear_log();

        w.session.load_and_restore(&w.path).await.unwrap();
        let log = entries(&w.log);
        let last_unpack = position(&log, "unpack:a").max(position(&log, "unpack:b"));
        let first_callback = position(&log, "callback:a").min(position(&log, "callback:b"));

        assert!(position(&log, "active:a=false") < position(&log, "unpack:a"));
        assert!(last_unpack < position(&log, "active:a=true"));
        assert!(last_unpack < position(&log, "active:b=true"));
        assert!(position(&log, "active:a=true") < first_callback);
    }

    #[tokio::test]
    async fn deferred_fixups_run_after_callbacks() {
        let w = world(EngineConfig::default());
        let a = w.spawn_live("a", None, "level", 1);
        a.counter.defer_fixup.store(true, Ordering::SeqCst);
        w.session.save_to(&w.path).await.unwrap();
        w.clear_log();

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(report.fixups, 1);
        assert_eq!(report.failed_fixups, 0);
        let log = entries(&w.log);
        assert!(position(&log, "callback:a") < position(&log, "fixup:a"));
    }

    #[tokio::test]
    async fn duplicate_composite_key_keeps_first_part() {
        let w = world(EngineConfig::default());
        let a = w.spawn_live("a", None, "level", 1);
        let b = w.spawn_live("b", None, "level", 2);
        let colliding = PartKey::from_uid(
            w.id(&a)
                .uid()
                .xor(counter_key().uid())
                .xor(w.id(&b).uid()),
        );
        assert_eq!(
            CompositeKey::derive(&w.id(&b), &colliding),
            CompositeKey::derive(&w.id(&a), &counter_key())
        );
        b.add_part(Counter::new("b-extra", colliding, 7, &w.log));

        w.session.save_to(&w.path).await.unwrap();
        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(report.duplicate_keys, 1);
        assert_eq!(report.applied_parts, 2);
    }

    #[tokio::test]
    async fn destroyed_objects_leave_the_save() {
        let w = world(EngineConfig::default());
        let a = w.spawn_live("a", None, "level", 1);
        let b = w.spawn_live("b", None, "level", 2);
        w.session.save_to(&w.path).await.unwrap();

        let a_key = w.id(&a).record_key();
        let b_id = w.id(&b);
        let b_key = b_id.record_key();
        let b_part = CompositeKey::derive(&b_id, &counter_key()).record_key();
        assert!(w.session.store().contains(&b_key).unwrap());

        assert_eq!(w.session.destroy(&b.as_entity()), Some(b_id));
        assert!(w.session.pending_deletes().objects.contains(&b_key));

        let report = w.session.save().await.unwrap();
        assert_eq!(report.removed, 2);
        let store = w.session.store();
        assert!(!store.contains(&b_key).unwrap());
        assert!(!store.contains(&b_part).unwrap());
        assert!(w.session.pending_deletes().is_empty());

        let index = SaveIndex::read(store).unwrap();
        assert!(index.objects.contains(&a_key));
        assert!(!index.objects.contains(&b_key));
        assert!(!index.parts.contains(&b_part));
    }

    #[tokio::test]
    async fn capture_roots_limits_to_descendants() {
        let root_id = InstanceId::generate();
        let w = world(EngineConfig {
            capture_scope: CaptureScope::Roots(vec![root_id]),
            ..EngineConfig::default()
        });

        let root = MockEntity::new("root", None, &ScopeTag::from("level"), 0, &w.log);
        root.assign_instance_id(Some(root_id));
        assert_eq!(w.session.track(&root.as_entity()), Some(root_id));

        let child = w.spawn_live("child", None, "level", 1);
        child.set_parent(Some(&root.as_entity()));
        let grandchild = w.spawn_live("grandchild", None, "level", 2);
        grandchild.set_parent(Some(&child.as_entity()));
        let stray = w.spawn_live("stray", None, "level", 3);

        let report = w.session.save_to(&w.path).await.unwrap();
        assert_eq!(report.objects, 3);
        let store = w.session.store();
        assert!(store.contains(&w.id(&grandchild).record_key()).unwrap());
        assert!(!store.contains(&w.id(&stray).record_key()).unwrap());
    }

    #[tokio::test]
    async fn cancel_stops_before_next_stage() {
        let w = world(EngineConfig::default());
        let a = w.spawn_live("a", None, "level", 1);
        w.session.save_to(&w.path).await.unwrap();

        w.scopes.cancel_on_load(w.session.cancel_token());
        a.counter.set(50);

        let err = w.session.load_and_restore(&w.path).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Cancelled {
                stage: RestoreStage::ReconcilingObjects
            }
        ));
        assert_eq!(a.counter.value(), 50);
        assert!(a.is_active());
        assert!(!w.session.is_busy());
    }

    #[tokio::test]
    async fn deferred_scope_restores_when_loaded() {
        let w = world(EngineConfig {
            restore_scope_context: false,
            ..EngineConfig::default()
        });
        w.scopes.mark_loaded("dungeon");
        let guard = w.spawn_live("guard", Some(crate_template()), "dungeon", 8);
        let guard_id = w.id(&guard);
        w.spawn_live("hero", None, "level", 1);
        w.session.save_to(&w.path).await.unwrap();

        guard.kill();
        w.scopes.mark_unloaded("dungeon");

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.spawned, 0);
        assert!(report.stage(RestoreStage::RestoringScopeContext).is_none());

        w.scopes.mark_loaded("dungeon");
        let scoped = w
            .session
            .on_scope_loaded(&ScopeTag::from("dungeon"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scoped.spawned, 1);
        assert_eq!(scoped.matched, 0);
        assert_eq!(scoped.applied_parts, 1);

        let spawned = w.spawner.find(guard_id).unwrap();
        assert_eq!(spawned.counter.value(), 8);
        assert!(entries(&w.log).contains(&"scope-callback:spawned-0".to_string()));
    }

    #[tokio::test]
    async fn scope_restore_without_open_store_is_skipped() {
        let w = world(EngineConfig::default());
        let skipped = w
            .session
            .on_scope_loaded(&ScopeTag::from("level"))
            .await
            .unwrap();
        assert!(skipped.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scope_restore_skipped_while_store_locked() {
        let medium = Arc::new(SlowMedium {
            inner: MemoryMedium::new(),
            delay: Duration::from_millis(400),
        });
        let w = world_with_medium(
            EngineConfig {
                lock_wait: Duration::from_millis(20),
                ..EngineConfig::default()
            },
            Some(medium),
        );
        w.spawn_live("a", None, "level", 1);
        w.session.save_to(&w.path).await.unwrap();

        w.session.store().set("marker", 1u32).unwrap();
        let store = w.session.store().clone();
        let commit = tokio::spawn(async move { store.commit().await });
        for _ in 0..200 {
            if w.session.store().is_locked() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let skipped = w
            .session
            .on_scope_loaded(&ScopeTag::from("level"))
            .await
            .unwrap();
        assert!(skipped.is_none());

        assert!(commit.await.unwrap().unwrap());
        let ran = w
            .session
            .on_scope_loaded(&ScopeTag::from("level"))
            .await
            .unwrap();
        assert!(ran.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_waits_out_inflight_commit() {
        let cases = [
            (Duration::from_secs(2), true),
            (Duration::from_millis(20), false),
        ];
        for (lock_wait, completes) in cases {
            let medium = Arc::new(SlowMedium {
                inner: MemoryMedium::new(),
                delay: Duration::from_millis(200),
            });
            let w = world_with_medium(
                EngineConfig {
                    lock_wait,
                    ..EngineConfig::default()
                },
                Some(medium),
            );
            w.spawn_live("a", None, "level", 1);
            w.session.save_to(&w.path).await.unwrap();

            w.session.store().set("marker", 1u32).unwrap();
            let store = w.session.store().clone();
            let commit = tokio::spawn(async move { store.commit().await });
            for _ in 0..200 {
                if w.session.store().is_locked() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            let saved = w.session.save().await;
            if completes {
                assert!(saved.is_ok());
            } else {
                assert!(matches!(
                    saved,
                    Err(EngineError::Store(StoreError::LockTimeout { .. }))
                ));
            }
            assert!(commit.await.unwrap().unwrap());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_operations_are_rejected() {
        let medium = Arc::new(SlowMedium {
            inner: MemoryMedium::new(),
            delay: Duration::from_millis(300),
        });
        let w = world_with_medium(EngineConfig::default(), Some(medium));
        w.spawn_live("a", None, "level", 1);
        w.session.save_to(&w.path).await.unwrap();

        let session = Arc::clone(&w.session);
        let save = tokio::spawn(async move { session.save().await });
        for _ in 0..200 {
            if w.session.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(matches!(w.session.save().await, Err(EngineError::Busy)));
        assert!(matches!(
            w.session.load_and_restore(&w.path).await,
            Err(EngineError::Busy)
        ));

        save.await.unwrap().unwrap();
        assert!(!w.session.is_busy());
    }

    #[tokio::test]
    async fn events_report_outcomes() {
        let w = world(EngineConfig::default());
        w.spawn_live("a", None, "level", 1);
        let mut events = w.session.subscribe();

        w.session.save_to(&w.path).await.unwrap();
        match events.try_recv().unwrap() {
            PersistenceEvent::SaveCompleted { path, records } => {
                assert_eq!(path, w.path);
                assert!(records > 0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            PersistenceEvent::LoadCompleted {
                path: w.path.clone(),
                objects: 1
            }
        );

        let corrupt = w.path.with_file_name("corrupt.sav");
        std::fs::write(&corrupt, b"not a save file").unwrap();
        let err = w.session.load_and_restore(&corrupt).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Aborted {
                stage: RestoreStage::LoadingStore,
                ..
            }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            PersistenceEvent::Failed {
                operation: "load",
                ..
            }
        ));
        assert_eq!(w.session.progress().borrow().clone(), ProgressState::default());
    }

    #[tokio::test]
    async fn start_session_forgets_tracked_objects() {
        let w = world(EngineConfig::default());
        w.spawn_live("a", None, "level", 1);
        assert_eq!(w.session.registry().live_count(), 1);

        let report = w.session.start_session([(crate_template(), "prefabs/crate")]);
        assert!(report.is_clean());
        assert_eq!(w.session.registry().live_count(), 0);
        assert!(w.session.registry().has_template(&crate_template()));
    }

    #[tokio::test]
    async fn restore_round_trips_on_every_backend() {
        for backend in [Backend::Tree, Backend::Boxed, Backend::Binary] {
            let w = world_with_store(
                EngineConfig::default(),
                StoreConfig {
                    backend,
                    ..StoreConfig::default()
                },
            );
            let kept = w.spawn_live("kept", Some(crate_template()), "level", 1);
            let respawned = w.spawn_live("respawned", Some(crate_template()), "level", 2);
            let lost = w.spawn_live("lost", None, "level", 3);
            respawned.set_placement(Placement::at([1.0, 2.0, 3.0]));
            let respawned_id = w.id(&respawned);

            w.session.save_to(&w.path).await.unwrap();
            kept.counter.set(40);
            respawned.kill();
            lost.kill();

            let report = w.session.load_and_restore(&w.path).await.unwrap();
            assert_eq!(
                (report.matched, report.spawned, report.dropped),
                (1, 1, 1),
                "{backend}"
            );
            assert_eq!(kept.counter.value(), 1, "{backend}");
            let spawned = w.spawner.find(respawned_id).unwrap();
            assert_eq!(spawned.counter.value(), 2, "{backend}");
            assert_eq!(spawned.placement(), Placement::at([1.0, 2.0, 3.0]), "{backend}");
        }
    }

    #[tokio::test]
    async fn scope_context_is_replayed() {
        let w = world(EngineConfig::default());
        w.scopes.mark_loaded("hub");
        w.scopes.mark_loaded("arena");
        w.scopes.set_host("hub");
        w.spawn_live("a", None, "level", 1);
        w.session.save_to(&w.path).await.unwrap();

        w.scopes.mark_unloaded("level");
        w.scopes.mark_unloaded("arena");
        w.scopes.mark_loaded("town");
        w.scopes.set_active_scope("town");
        w.scopes.break_scope("arena");
        w.clear_log();

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert!(report.all_passed());
        assert_eq!(report.scope_failures, 1);

        let log = entries(&w.log);
        assert!(log.contains(&"unload:town".to_string()));
        assert!(!log.contains(&"unload:hub".to_string()));
        assert!(log.contains(&"load:level".to_string()));
        assert!(log.contains(&"load-failed:arena".to_string()));
        assert!(position(&log, "unload:town") < position(&log, "load:level"));

        let loaded = w.scopes.loaded_scopes();
        assert!(loaded.contains(&ScopeTag::from("hub")));
        assert!(loaded.contains(&ScopeTag::from("level")));
        assert!(!loaded.contains(&ScopeTag::from("town")));
        assert_eq!(w.scopes.active_scope(), Some(ScopeTag::from("level")));
    }

    #[tokio::test]
    async fn scope_context_replay_can_be_disabled() {
        let w = world(EngineConfig {
            restore_scope_context: false,
            ..EngineConfig::default()
        });
        w.spawn_live("a", None, "level", 1);
        w.session.save_to(&w.path).await.unwrap();
        w.scopes.mark_loaded("town");
        w.clear_log();

        w.session.load_and_restore(&w.path).await.unwrap();
        assert!(!entries(&w.log).contains(&"unload:town".to_string()));
        assert!(w.scopes.is_loaded(&ScopeTag::from("town")));
    }

    #[tokio::test]
    async fn assets_are_captured_restored_and_forgotten() {
        let w = world(EngineConfig::default());
        let gold_key = PartKey::named("assets/gold").unwrap();
        let quests_key = PartKey::named("assets/quests").unwrap();
        let gold = Counter::new("gold", gold_key, 5, &w.log);
        let quests = Counter::new("quests", quests_key, 7, &w.log);
        w.assets.push(gold.clone());
        w.assets.push(quests.clone());
        w.spawn_live("a", None, "level", 1);

        let saved = w.session.save_to(&w.path).await.unwrap();
        assert_eq!((saved.objects, saved.assets), (1, 2));
        let index = SaveIndex::read(w.session.store()).unwrap();
        assert!(index.assets.contains(&gold_key.record_key()));
        assert!(index.assets.contains(&quests_key.record_key()));

        gold.set(50);
        quests.set(70);
        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(report.applied_parts, 3);
        assert_eq!((gold.value(), quests.value()), (5, 7));
        let log = entries(&w.log);
        assert!(position(&log, "unpack:gold") < position(&log, "callback:gold"));

        w.assets.remove(&quests_key);
        w.session.forget_asset(&quests_key);
        let saved = w.session.save().await.unwrap();
        assert_eq!((saved.assets, saved.removed), (1, 1));
        assert!(!w.session.store().contains(&quests_key.record_key()).unwrap());
        assert!(w.session.store().contains(&gold_key.record_key()).unwrap());
        let index = SaveIndex::read(w.session.store()).unwrap();
        assert!(!index.assets.contains(&quests_key.record_key()));
        assert!(w.session.pending_deletes().is_empty());
    }

    #[tokio::test]
    async fn asset_key_conflicts_keep_the_first() {
        let w = world(EngineConfig::default());
        let key = PartKey::named("assets/gold").unwrap();
        let first = Counter::new("gold", key, 5, &w.log);
        let second = Counter::new("gold-copy", key, 9, &w.log);
        let unkeyed = Counter::new("unkeyed", PartKey::from_uid(Uid::NIL), 3, &w.log);
        w.assets.push(first.clone());
        w.assets.push(second.clone());
        w.assets.push(unkeyed.clone());

        let saved = w.session.save_to(&w.path).await.unwrap();
        assert_eq!((saved.assets, saved.skipped_parts), (1, 2));
        assert_eq!(SaveIndex::read(w.session.store()).unwrap().assets.len(), 1);

        first.set(0);
        second.set(0);
        unkeyed.set(0);
        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!(report.duplicate_keys, 1);
        assert_eq!(first.value(), 5);
        assert_eq!(second.value(), 0);
        assert_eq!(unkeyed.value(), 0);
    }

    #[tokio::test]
    async fn spawn_losing_its_identity_is_deactivated() {
        let w = world(EngineConfig::default());
        let original = w.spawn_live("original", Some(crate_template()), "level", 2);
        let id = w.id(&original);
        w.session.save_to(&w.path).await.unwrap();
        original.kill();

        let squatter = MockEntity::new("squatter", None, &ScopeTag::from("level"), 0, &w.log);
        let claimant = squatter.as_entity();
        let registry = Arc::clone(w.session.registry());
        w.spawner.before_spawn(move || {
            registry.override_instance_identity(&claimant, id);
        });

        let report = w.session.load_and_restore(&w.path).await.unwrap();
        assert_eq!((report.spawned, report.orphaned, report.dropped), (0, 1, 1));

        let spawned = w.spawner.spawned();
        assert_eq!(spawned.len(), 1);
        assert!(!spawned[0].is_active());
        assert!(spawned[0].instance_id().is_none());
        let holder = w.session.registry().try_resolve(&id).unwrap();
        assert_eq!(holder.describe(), "squatter");
    }
}
