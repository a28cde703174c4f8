use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stasis_crypto::Envelope;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::container::{StoreSnapshot, FORMAT_TAG};
use crate::error::{StoreError, StoreResult};
use crate::medium::{DiskMedium, SaveMedium};
use crate::payload::{Payload, Persistable};

/// Hook run once over the whole record set when a loaded file carries a
/// different format tag. Receives the file's tag.
pub type MigrationHook =
    Arc<dyn Fn(&str, &mut BTreeMap<String, Payload>) -> Result<(), String> + Send + Sync>;

type Loaded = Option<(BTreeMap<String, Payload>, StoreMetadata)>;

/// Held critical section. Moved into blocking workers so it outlives a
/// dropped caller.
type Gate = OwnedMutexGuard<()>;

/// Header fields of the most recently loaded or committed file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub format: String,
    pub build_tag: String,
    pub modified_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    path: Option<PathBuf>,
    records: BTreeMap<String, Payload>,
    dirty: bool,
    /// Whether `path` holds the current records.
    persisted: bool,
    metadata: Option<StoreMetadata>,
}

struct Inner {
    config: StoreConfig,
    envelope: Envelope,
    medium: Arc<dyn SaveMedium>,
    migration: Option<MigrationHook>,
    /// Critical section for load, commit, revert, copy, and mutation.
    gate: Arc<Mutex<()>>,
    state: RwLock<State>,
}

/// Keyed record store bound to one database file at a time.
///
/// Cloning yields another handle to the same store. Mutations apply to
/// the in-memory record set and mark the store dirty; [`commit`] writes
/// the whole set as one file. Load, commit, revert, and copy hold the
/// store's critical section for their full duration, acquired with a
/// bounded wait; mutations made while it is held fail with
/// [`StoreError::LockTimeout`] instead of blocking. Dropping one of those
/// futures does not release the section early: the background read or
/// write keeps it until the file operation finishes.
///
/// [`commit`]: RecordStore::commit
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<Inner>,
}

/// Builder for [`RecordStore`].
pub struct RecordStoreBuilder {
    config: StoreConfig,
    medium: Arc<dyn SaveMedium>,
    migration: Option<MigrationHook>,
}

impl RecordStoreBuilder {
    /// Read and write through `medium` instead of the file system.
    pub fn medium(mut self, medium: Arc<dyn SaveMedium>) -> Self {
        self.medium = medium;
        self
    }

    /// Install a migration hook.
    pub fn migration<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &mut BTreeMap<String, Payload>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.migration = Some(Arc::new(hook));
        self
    }

    /// Validate the configuration and build the store.
    pub fn build(self) -> StoreResult<RecordStore> {
        if !self.config.compression.is_supported() {
            return Err(StoreError::Unsupported(format!(
                "compression '{}' has no implementation",
                self.config.compression
            )));
        }
        let envelope = Envelope::new(self.config.compression, self.config.obfuscate);
        Ok(RecordStore {
            inner: Arc::new(Inner {
                config: self.config,
                envelope,
                medium: self.medium,
                migration: self.migration,
                gate: Arc::new(Mutex::new(())),
                state: RwLock::new(State::default()),
            }),
        })
    }
}

impl RecordStore {
    pub fn builder(config: StoreConfig) -> RecordStoreBuilder {
        RecordStoreBuilder {
            config,
            medium: Arc::new(DiskMedium),
            migration: None,
        }
    }

    /// A store over the file system.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------
    // Whole-file operations
    // -----------------------------------------------------------------

    /// Bind the store to `path` and read its records.
    ///
    /// A missing file yields an empty store bound to `path`; the first
    /// commit creates it. On failure the previous in-memory state is kept.
    pub async fn load(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref().to_path_buf();
        let gate = self.acquire().await?;

        if self.read_state().dirty {
            return Err(StoreError::UncommittedChanges { path });
        }

        match self.read_file(gate, path.clone()).await {
            Ok((_gate, loaded)) => {
                let count = loaded.as_ref().map_or(0, |(records, _)| records.len());
                self.install(path.clone(), loaded);
                info!(path = %path.display(), records = count, "store loaded");
                Ok(())
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "store load failed");
                Err(e)
            }
        }
    }

    /// Write the full record set to the bound path.
    ///
    /// Returns `false` without writing when nothing changed since the last
    /// load or commit. A failed commit leaves the store dirty.
    pub async fn commit(&self) -> StoreResult<bool> {
        let gate = self.acquire().await?;

        let (path, records) = {
            let state = self.read_state();
            let path = state.path.clone().ok_or(StoreError::NotLoaded)?;
            if !state.dirty && state.persisted {
                debug!(path = %path.display(), "commit skipped, store clean");
                return Ok(false);
            }
            (path, state.records.clone())
        };

        let count = records.len();
        match self.write_file(gate, path.clone(), records).await {
            Ok((_gate, metadata)) => {
                let mut state = self.write_state();
                state.dirty = false;
                state.persisted = true;
                state.metadata = Some(metadata);
                info!(path = %path.display(), records = count, "store committed");
                Ok(true)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "store commit failed");
                Err(e)
            }
        }
    }

    /// Discard in-memory changes and reload from the bound path.
    pub async fn revert(&self) -> StoreResult<()> {
        let gate = self.acquire().await?;
        let path = self.read_state().path.clone().ok_or(StoreError::NotLoaded)?;

        match self.read_file(gate, path.clone()).await {
            Ok((_gate, loaded)) => {
                self.install(path.clone(), loaded);
                debug!(path = %path.display(), "store reverted");
                Ok(())
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "store revert failed");
                Err(e)
            }
        }
    }

    /// Merge the in-memory records into the file at `destination`.
    ///
    /// Keys only present at the destination are kept; colliding keys take
    /// this store's value. Returns the number of records written.
    pub async fn copy_to(&self, destination: impl AsRef<Path>) -> StoreResult<usize> {
        let destination = destination.as_ref().to_path_buf();
        let gate = self.acquire().await?;

        let records = {
            let state = self.read_state();
            if state.path.is_none() {
                return Err(StoreError::NotLoaded);
            }
            state.records.clone()
        };

        let (gate, existing) = self.read_file(gate, destination.clone()).await?;
        let mut merged = match existing {
            Some((existing, _)) => existing,
            None => BTreeMap::new(),
        };
        let kept = merged.len();
        merged.extend(records);
        let count = merged.len();

        let (_gate, _) = self.write_file(gate, destination.clone(), merged).await?;
        info!(
            destination = %destination.display(),
            records = count,
            destination_records = kept,
            "store copied"
        );
        Ok(count)
    }

    /// Wait up to `timeout` for the critical section to be free.
    pub async fn wait_unlocked(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.gate.lock())
            .await
            .is_ok()
    }

    /// Returns `true` while a load, commit, revert, or copy is running.
    pub fn is_locked(&self) -> bool {
        self.inner.gate.try_lock().is_err()
    }

    // -----------------------------------------------------------------
    // Record operations
    // -----------------------------------------------------------------

    /// Store `value` under `key`, encoded per the configured backend.
    pub fn set<T: Persistable>(&self, key: impl Into<String>, value: T) -> StoreResult<()> {
        let key = key.into();
        let payload = self
            .inner
            .config
            .backend
            .encode(value)
            .map_err(|e| StoreError::Serialization(format!("{key}: {e}")))?;
        self.insert(key, payload)
    }

    /// Store a prebuilt payload under `key`.
    pub fn set_payload(&self, key: impl Into<String>, payload: Payload) -> StoreResult<()> {
        let key = key.into();
        let payload = self
            .inner
            .config
            .backend
            .conform(payload)
            .map_err(|e| StoreError::Serialization(format!("{key}: {e}")))?;
        self.insert(key, payload)
    }

    /// Read `key` as `T`.
    pub fn get<T: Persistable>(&self, key: &str) -> StoreResult<T> {
        self.try_get(key)?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    /// Read `key` as `T`, or `None` if absent. A present record of the
    /// wrong type is still an error.
    pub fn try_get<T: Persistable>(&self, key: &str) -> StoreResult<Option<T>> {
        let state = self.loaded_state()?;
        match state.records.get(key) {
            Some(payload) => payload
                .decode()
                .map(Some)
                .map_err(|e| StoreError::TypeMismatch {
                    key: key.to_string(),
                    source: e,
                }),
            None => Ok(None),
        }
    }

    pub fn get_payload(&self, key: &str) -> StoreResult<Payload> {
        self.try_get_payload(key)?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    pub fn try_get_payload(&self, key: &str) -> StoreResult<Option<Payload>> {
        Ok(self.loaded_state()?.records.get(key).cloned())
    }

    /// Overwrite `target` in place from the record under `key`.
    ///
    /// Unsupported under the boxed backend, where callers must replace.
    pub fn populate<T: Persistable>(&self, key: &str, target: &mut T) -> StoreResult<()> {
        if !self.inner.config.backend.supports_populate() {
            return Err(StoreError::Unsupported(format!(
                "populate is not available with the {} backend",
                self.inner.config.backend
            )));
        }
        let payload = self.get_payload(key)?;
        payload
            .merge_into(target)
            .map_err(|e| StoreError::TypeMismatch {
                key: key.to_string(),
                source: e,
            })
    }

    pub fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.loaded_state()?.records.contains_key(key))
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let _gate = self.try_acquire()?;
        let mut state = self.write_state();
        if state.path.is_none() {
            return Err(StoreError::NotLoaded);
        }
        let removed = state.records.remove(key).is_some();
        if removed {
            state.dirty = true;
        }
        Ok(removed)
    }

    /// Remove every record.
    pub fn clear(&self) -> StoreResult<()> {
        let _gate = self.try_acquire()?;
        let mut state = self.write_state();
        if state.path.is_none() {
            return Err(StoreError::NotLoaded);
        }
        state.records.clear();
        state.dirty = true;
        Ok(())
    }

    /// All keys in order.
    pub fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.loaded_state()?.records.keys().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.read_state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_state().records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.read_state().dirty
    }

    pub fn is_loaded(&self) -> bool {
        self.read_state().path.is_some()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.read_state().path.clone()
    }

    pub fn metadata(&self) -> Option<StoreMetadata> {
        self.read_state().metadata.clone()
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn acquire(&self) -> StoreResult<Gate> {
        let waited = self.inner.config.lock_timeout();
        tokio::time::timeout(waited, Arc::clone(&self.inner.gate).lock_owned())
            .await
            .map_err(|_| {
                warn!(waited_ms = waited.as_millis() as u64, "store lock wait expired");
                StoreError::LockTimeout { waited }
            })
    }

    fn try_acquire(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.inner.gate.try_lock().map_err(|_| StoreError::LockTimeout {
            waited: Duration::ZERO,
        })
    }

    fn insert(&self, key: String, payload: Payload) -> StoreResult<()> {
        let _gate = self.try_acquire()?;
        let mut state = self.write_state();
        if state.path.is_none() {
            return Err(StoreError::NotLoaded);
        }
        state.records.insert(key, payload);
        state.dirty = true;
        Ok(())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.inner.state.read().expect("lock poisoned")
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.inner.state.write().expect("lock poisoned")
    }

    fn loaded_state(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, State>> {
        let state = self.read_state();
        if state.path.is_none() {
            return Err(StoreError::NotLoaded);
        }
        Ok(state)
    }

    fn install(&self, path: PathBuf, loaded: Loaded) {
        let mut state = self.write_state();
        state.path = Some(path);
        state.dirty = false;
        match loaded {
            Some((records, metadata)) => {
                state.records = records;
                state.persisted = true;
                state.metadata = Some(metadata);
            }
            None => {
                state.records = BTreeMap::new();
                state.persisted = false;
                state.metadata = None;
            }
        }
    }

    /// Read, open, decode, and migrate the file at `path` off the async task.
    async fn read_file(&self, gate: Gate, path: PathBuf) -> StoreResult<(Gate, Loaded)> {
        let medium = Arc::clone(&self.inner.medium);
        let envelope = self.inner.envelope.clone();
        let migration = self.inner.migration.clone();

        tokio::task::spawn_blocking(move || -> StoreResult<(Gate, Loaded)> {
            let Some(blob) = medium.read(&path)? else {
                debug!(path = %path.display(), "no file, starting empty");
                return Ok((gate, None));
            };
            let bytes = envelope.open(&blob)?;
            let snapshot = StoreSnapshot::decode(&bytes)?;
            let metadata = StoreMetadata {
                format: snapshot.format.clone(),
                build_tag: snapshot.build_tag.clone(),
                modified_at: snapshot.modified_at,
            };
            let mut records = snapshot.into_records();

            if metadata.format != FORMAT_TAG {
                match &migration {
                    Some(hook) => {
                        hook(&metadata.format, &mut records).map_err(|reason| {
                            StoreError::Migration {
                                from: metadata.format.clone(),
                                reason,
                            }
                        })?;
                        info!(from = %metadata.format, to = FORMAT_TAG, "store migrated");
                    }
                    None => warn!(
                        format = %metadata.format,
                        expected = FORMAT_TAG,
                        "format mismatch and no migration hook"
                    ),
                }
            }
            Ok((gate, Some((records, metadata))))
        })
        .await
        .map_err(|e| StoreError::Background(e.to_string()))?
    }

    /// Encode, seal, and write `records` to `path` off the async task.
    async fn write_file(
        &self,
        gate: Gate,
        path: PathBuf,
        records: BTreeMap<String, Payload>,
    ) -> StoreResult<(Gate, StoreMetadata)> {
        let medium = Arc::clone(&self.inner.medium);
        let envelope = self.inner.envelope.clone();
        let build_tag = self.inner.config.build_tag.clone();
        let binary = self.inner.config.backend.writes_binary();

        tokio::task::spawn_blocking(move || -> StoreResult<(Gate, StoreMetadata)> {
            let modified_at = Utc::now();
            let snapshot = StoreSnapshot::capture(&records, &build_tag, modified_at, binary)?;
            let bytes = snapshot.encode(binary)?;
            let sealed = envelope.seal(&bytes)?;
            medium.write(&path, &sealed)?;
            debug!(path = %path.display(), bytes = sealed.len(), "store file written");
            let metadata = StoreMetadata {
                format: snapshot.format,
                build_tag: snapshot.build_tag,
                modified_at,
            };
            Ok((gate, metadata))
        })
        .await
        .map_err(|e| StoreError::Background(e.to_string()))?
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("RecordStore")
            .field("path", &state.path)
            .field("records", &state.records.len())
            .field("dirty", &state.dirty)
            .field("backend", &self.inner.config.backend)
            .finish()
    }
}
