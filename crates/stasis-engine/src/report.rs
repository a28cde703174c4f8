use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// States of the restore state machine, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    Idle,
    LoadingStore,
    RestoringScopeContext,
    ReconcilingObjects,
    RestoringHierarchy,
    ApplyingPartState,
    RunningPostCallbacks,
}

impl RestoreStage {
    /// The stage after this one; `Idle` after the last.
    pub fn next(self) -> Self {
        match self {
            Self::Idle => Self::LoadingStore,
            Self::LoadingStore => Self::RestoringScopeContext,
            Self::RestoringScopeContext => Self::ReconcilingObjects,
            Self::ReconcilingObjects => Self::RestoringHierarchy,
            Self::RestoringHierarchy => Self::ApplyingPartState,
            Self::ApplyingPartState => Self::RunningPostCallbacks,
            Self::RunningPostCallbacks => Self::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LoadingStore => "loading-store",
            Self::RestoringScopeContext => "restoring-scope-context",
            Self::ReconcilingObjects => "reconciling-objects",
            Self::RestoringHierarchy => "restoring-hierarchy",
            Self::ApplyingPartState => "applying-part-state",
            Self::RunningPostCallbacks => "running-post-callbacks",
        }
    }
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Timing and outcome of one restore stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageReport {
    pub stage: RestoreStage,
    pub passed: bool,
    pub reason: Option<String>,
    pub elapsed: Duration,
}

/// What a restore did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RestoreReport {
    /// One entry per stage that ran, in order.
    pub stages: Vec<StageReport>,
    /// Live objects whose record was applied in place.
    pub matched: usize,
    /// Objects spawned from their template.
    pub spawned: usize,
    /// Records that could not be restored.
    pub dropped: usize,
    /// Spawned instances left without an identity, deactivated and
    /// counted in `dropped` as well.
    pub orphaned: usize,
    /// Records left for when their scope loads.
    pub deferred: usize,
    /// Objects whose parent link was set.
    pub reparented: usize,
    pub applied_parts: usize,
    pub failed_parts: usize,
    /// Parts excluded because another part derived the same record key.
    pub duplicate_keys: usize,
    pub fixups: usize,
    pub failed_fixups: usize,
    /// Scopes that failed to load or unload.
    pub scope_failures: usize,
    pub elapsed: Duration,
}

impl RestoreReport {
    pub fn stage(&self, stage: RestoreStage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Returns `true` if every recorded stage passed.
    pub fn all_passed(&self) -> bool {
        self.stages.iter().all(|s| s.passed)
    }
}

/// What a capture wrote.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CaptureReport {
    pub objects: usize,
    pub parts: usize,
    pub assets: usize,
    /// Parts that packed nothing or had an invalid key.
    pub skipped_parts: usize,
    pub failed_parts: usize,
    /// Records removed because their objects were destroyed.
    pub removed: usize,
    pub elapsed: Duration,
}
