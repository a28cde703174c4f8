//! Mock host objects shared by the engine tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{io, thread};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stasis_identity::{Identified, Tracked};
use stasis_pack::{
    package, unpackage, Entity, PackError, PackResult, Part, ReferenceContext, SnapshotPackage,
};
use stasis_store::{MemoryMedium, RecordStore, SaveMedium, StoreConfig};
use stasis_types::{
    impl_typed, InstanceId, PartKey, Placement, ScopeTag, TemplateId, TypeToken, Typed,
};
use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::error::HostError;
use crate::host::{AssetSource, Host, ScopeLoader, SpawnProvider};
use crate::progress::CancelToken;
use crate::session::Persistence;

/// Ordered record of callbacks across every mock object.
pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

pub(crate) fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub(crate) fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} not logged in {log:?}"))
}

// ---------------------------------------------------------------
// Parts
// ---------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct CounterState {
    pub value: i64,
}

impl_typed!(CounterState => "test.counter");

pub(crate) struct Counter {
    key: PartKey,
    name: String,
    value: Mutex<i64>,
    pub fail_unpack: AtomicBool,
    pub fail_pack: AtomicBool,
    pub defer_fixup: AtomicBool,
    log: CallLog,
}

impl Counter {
    pub fn new(name: &str, key: PartKey, value: i64, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            key,
            name: name.to_string(),
            value: Mutex::new(value),
            fail_unpack: AtomicBool::new(false),
            fail_pack: AtomicBool::new(false),
            defer_fixup: AtomicBool::new(false),
            log: Arc::clone(log),
        })
    }

    pub fn value(&self) -> i64 {
        *self.value.lock().unwrap()
    }

    pub fn set(&self, value: i64) {
        *self.value.lock().unwrap() = value;
    }

    fn record(&self, what: &str) {
        self.log.lock().unwrap().push(format!("{what}:{}", self.name));
    }
}

impl Part for Counter {
    fn part_key(&self) -> PartKey {
        self.key
    }

    fn snapshot_type(&self) -> TypeToken {
        CounterState::type_token()
    }

    fn pack(&self) -> PackResult<Option<SnapshotPackage>> {
        if self.fail_pack.load(Ordering::SeqCst) {
            return Err(PackError::pack_failed(&self.name, "pack refused"));
        }
        Ok(Some(package(CounterState {
            value: self.value(),
        })))
    }

    fn unpack(&self, pkg: &SnapshotPackage, ctx: &ReferenceContext) -> PackResult<()> {
        if self.fail_unpack.load(Ordering::SeqCst) {
            return Err(PackError::unpack_failed(&self.name, "corrupt counter"));
        }
        let state: CounterState = unpackage(pkg)?;
        self.set(state.value);
        self.record("unpack");
        if self.defer_fixup.load(Ordering::SeqCst) {
            let log = Arc::clone(&self.log);
            let name = self.name.clone();
            ctx.defer(move |_ctx| {
                log.lock().unwrap().push(format!("fixup:{name}"));
                Ok(())
            });
        }
        Ok(())
    }

    fn on_all_unpacked(&self, _ctx: &ReferenceContext) {
        self.record("callback");
    }

    fn on_scope_unpacked(&self, _scope: &ScopeTag, _ctx: &ReferenceContext) {
        self.record("scope-callback");
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

pub(crate) fn counter_key() -> PartKey {
    PartKey::named("counter").unwrap()
}

// ---------------------------------------------------------------
// Entities
// ---------------------------------------------------------------

pub(crate) struct MockEntity {
    name: String,
    id: Mutex<Option<InstanceId>>,
    template: Option<TemplateId>,
    scope: ScopeTag,
    placement: Mutex<Placement>,
    parent: Mutex<Option<InstanceId>>,
    active: AtomicBool,
    alive: AtomicBool,
    pub counter: Arc<Counter>,
    extra: Mutex<Vec<Arc<dyn Part>>>,
    log: CallLog,
}

impl MockEntity {
    pub fn new(
        name: &str,
        template: Option<TemplateId>,
        scope: &ScopeTag,
        value: i64,
        log: &CallLog,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            id: Mutex::new(None),
            template,
            scope: scope.clone(),
            placement: Mutex::new(Placement::IDENTITY),
            parent: Mutex::new(None),
            active: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            counter: Counter::new(name, counter_key(), value, log),
            extra: Mutex::new(Vec::new()),
            log: Arc::clone(log),
        })
    }

    pub fn add_part(&self, part: Arc<dyn Part>) {
        self.extra.lock().unwrap().push(part);
    }

    /// Simulate the host destroying the object.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn as_entity(self: &Arc<Self>) -> Arc<dyn Entity> {
        Arc::clone(self) as Arc<dyn Entity>
    }
}

impl Tracked for MockEntity {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Identified for MockEntity {
    fn instance_id(&self) -> Option<InstanceId> {
        *self.id.lock().unwrap()
    }

    fn assign_instance_id(&self, id: Option<InstanceId>) {
        *self.id.lock().unwrap() = id;
    }
}

impl Entity for MockEntity {
    fn template_id(&self) -> Option<TemplateId> {
        self.template
    }

    fn scope(&self) -> ScopeTag {
        self.scope.clone()
    }

    fn placement(&self) -> Placement {
        *self.placement.lock().unwrap()
    }

    fn set_placement(&self, placement: Placement) {
        *self.placement.lock().unwrap() = placement;
    }

    fn parent_id(&self) -> Option<InstanceId> {
        *self.parent.lock().unwrap()
    }

    fn set_parent(&self, parent: Option<&Arc<dyn Entity>>) {
        *self.parent.lock().unwrap() = parent.and_then(|p| p.instance_id());
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push(format!("active:{}={active}", self.name));
    }

    fn parts(&self) -> Vec<Arc<dyn Part>> {
        let mut parts: Vec<Arc<dyn Part>> = vec![Arc::clone(&self.counter) as Arc<dyn Part>];
        parts.extend(self.extra.lock().unwrap().iter().cloned());
        parts
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

// ---------------------------------------------------------------
// Host
// ---------------------------------------------------------------

pub(crate) fn crate_template() -> TemplateId {
    TemplateId::named("prefabs/crate").unwrap()
}

type SpawnHook = Box<dyn Fn() + Send + Sync>;

pub(crate) struct MockSpawner {
    log: CallLog,
    spawned: Mutex<Vec<Arc<MockEntity>>>,
    /// Runs at the start of every spawn.
    before_spawn: Mutex<Option<SpawnHook>>,
}

impl MockSpawner {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: Arc::clone(log),
            spawned: Mutex::new(Vec::new()),
            before_spawn: Mutex::new(None),
        }
    }

    pub fn before_spawn(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.before_spawn.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn spawned(&self) -> Vec<Arc<MockEntity>> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn find(&self, id: InstanceId) -> Option<Arc<MockEntity>> {
        self.spawned()
            .into_iter()
            .find(|e| e.instance_id() == Some(id))
    }
}

#[async_trait]
impl SpawnProvider for MockSpawner {
    async fn spawn(
        &self,
        template: &TemplateId,
        placement: Placement,
        scope: &ScopeTag,
    ) -> Result<Option<Arc<dyn Entity>>, HostError> {
        if let Some(hook) = self.before_spawn.lock().unwrap().as_ref() {
            hook();
        }
        if *template != crate_template() {
            return Ok(None);
        }
        let count = self.spawned.lock().unwrap().len();
        let name = format!("spawned-{count}");
        let entity = MockEntity::new(&name, Some(*template), scope, 0, &self.log);
        entity.set_placement(placement);
        self.spawned.lock().unwrap().push(Arc::clone(&entity));
        Ok(Some(entity.as_entity()))
    }
}

pub(crate) struct MockScopes {
    loaded: Mutex<Vec<ScopeTag>>,
    active: Mutex<Option<ScopeTag>>,
    host: Mutex<Option<ScopeTag>>,
    /// Scopes whose load always fails.
    broken: Mutex<Vec<ScopeTag>>,
    /// Cancelled whenever a scope is loaded.
    cancel_on_load: Mutex<Option<CancelToken>>,
    log: CallLog,
}

impl MockScopes {
    pub fn new(loaded: &[&str], log: &CallLog) -> Self {
        Self {
            loaded: Mutex::new(loaded.iter().map(|s| ScopeTag::from(*s)).collect()),
            active: Mutex::new(loaded.first().map(|s| ScopeTag::from(*s))),
            host: Mutex::new(None),
            broken: Mutex::new(Vec::new()),
            cancel_on_load: Mutex::new(None),
            log: Arc::clone(log),
        }
    }

    pub fn cancel_on_load(&self, token: CancelToken) {
        *self.cancel_on_load.lock().unwrap() = Some(token);
    }

    pub fn mark_loaded(&self, scope: &str) {
        self.loaded.lock().unwrap().push(ScopeTag::from(scope));
    }

    pub fn mark_unloaded(&self, scope: &str) {
        self.loaded.lock().unwrap().retain(|s| s.as_str() != scope);
    }

    pub fn set_host(&self, scope: &str) {
        *self.host.lock().unwrap() = Some(ScopeTag::from(scope));
    }

    pub fn break_scope(&self, scope: &str) {
        self.broken.lock().unwrap().push(ScopeTag::from(scope));
    }

    pub fn set_active_scope(&self, scope: &str) {
        *self.active.lock().unwrap() = Some(ScopeTag::from(scope));
    }
}

#[async_trait]
impl ScopeLoader for MockScopes {
    fn loaded_scopes(&self) -> Vec<ScopeTag> {
        self.loaded.lock().unwrap().clone()
    }

    fn active_scope(&self) -> Option<ScopeTag> {
        self.active.lock().unwrap().clone()
    }

    fn host_scope(&self) -> Option<ScopeTag> {
        self.host.lock().unwrap().clone()
    }

    async fn load(&self, scope: &ScopeTag) -> Result<(), HostError> {
        if self.broken.lock().unwrap().contains(scope) {
            self.log.lock().unwrap().push(format!("load-failed:{scope}"));
            return Err(HostError::ScopeLoad {
                scope: scope.clone(),
                reason: "missing on disk".to_string(),
            });
        }
        self.log.lock().unwrap().push(format!("load:{scope}"));
        self.loaded.lock().unwrap().push(scope.clone());
        if let Some(token) = self.cancel_on_load.lock().unwrap().as_ref() {
            token.cancel();
        }
        Ok(())
    }

    async fn unload(&self, scope: &ScopeTag) -> Result<(), HostError> {
        self.log.lock().unwrap().push(format!("unload:{scope}"));
        self.loaded.lock().unwrap().retain(|s| s != scope);
        Ok(())
    }

    fn set_active(&self, scope: &ScopeTag) -> Result<(), HostError> {
        *self.active.lock().unwrap() = Some(scope.clone());
        Ok(())
    }
}

/// Free-standing parts handed to capture and restore.
#[derive(Default)]
pub(crate) struct MockAssets {
    parts: Mutex<Vec<Arc<dyn Part>>>,
}

impl MockAssets {
    pub fn push(&self, part: Arc<dyn Part>) {
        self.parts.lock().unwrap().push(part);
    }

    pub fn remove(&self, key: &PartKey) {
        self.parts.lock().unwrap().retain(|p| p.part_key() != *key);
    }
}

impl AssetSource for MockAssets {
    fn assets(&self) -> Vec<Arc<dyn Part>> {
        self.parts.lock().unwrap().clone()
    }
}

/// A medium whose writes take `delay`, for holding the store lock.
pub(crate) struct SlowMedium {
    pub inner: MemoryMedium,
    pub delay: Duration,
}

impl SaveMedium for SlowMedium {
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        self.inner.read(path)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        thread::sleep(self.delay);
        self.inner.write(path, bytes)
    }
}

// ---------------------------------------------------------------
// World
// ---------------------------------------------------------------

pub(crate) struct World {
    pub _dir: TempDir,
    pub path: PathBuf,
    pub log: CallLog,
    pub spawner: Arc<MockSpawner>,
    pub scopes: Arc<MockScopes>,
    pub assets: Arc<MockAssets>,
    pub session: Arc<Persistence>,
}

impl World {
    /// Create a live, tracked entity in `scope`.
    pub fn spawn_live(
        &self,
        name: &str,
        template: Option<TemplateId>,
        scope: &str,
        value: i64,
    ) -> Arc<MockEntity> {
        let entity = MockEntity::new(name, template, &ScopeTag::from(scope), value, &self.log);
        self.session.track(&entity.as_entity()).unwrap();
        entity
    }

    pub fn id(&self, entity: &Arc<MockEntity>) -> InstanceId {
        entity.instance_id().unwrap()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

pub(crate) fn world(config: EngineConfig) -> World {
    world_with_medium(config, None)
}

/// Build a world whose store writes through `medium` instead of the disk.
pub(crate) fn world_with_medium(config: EngineConfig, medium: Option<Arc<dyn SaveMedium>>) -> World {
    build_world(config, StoreConfig::default(), medium)
}

/// Build a world over a store with `store_config`.
pub(crate) fn world_with_store(config: EngineConfig, store_config: StoreConfig) -> World {
    build_world(config, store_config, None)
}

fn build_world(
    config: EngineConfig,
    store_config: StoreConfig,
    medium: Option<Arc<dyn SaveMedium>>,
) -> World {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("world.sav");
    let log = CallLog::default();
    let spawner = Arc::new(MockSpawner::new(&log));
    let scopes = Arc::new(MockScopes::new(&["level"], &log));
    let assets = Arc::new(MockAssets::default());

    let mut builder = RecordStore::builder(store_config);
    if let Some(medium) = medium {
        builder = builder.medium(medium);
    }
    let store = builder.build().unwrap();

    let host = Host::new(spawner.clone(), scopes.clone()).with_assets(assets.clone());
    let session = Arc::new(Persistence::new(store, host, config));
    session.start_session([(crate_template(), "prefabs/crate")]);

    World {
        _dir: dir,
        path,
        log,
        spawner,
        scopes,
        assets,
        session,
    }
}
