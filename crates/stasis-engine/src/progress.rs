use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use crate::report::RestoreStage;

/// The long-running operation a session is performing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    #[default]
    Idle,
    Saving,
    Restoring,
}

/// Read-only progress snapshot for presentation layers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    pub operation: Operation,
    pub stage: Option<RestoreStage>,
    pub completed: usize,
    pub total: usize,
}

impl ProgressState {
    /// Fraction of the current stage completed, `0.0..=1.0`.
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f32 / self.total as f32).min(1.0)
    }
}

/// Publishes [`ProgressState`] updates over a watch channel.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<ProgressState>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ProgressState {
        self.tx.borrow().clone()
    }

    pub fn begin(&self, operation: Operation) {
        self.tx.send_replace(ProgressState {
            operation,
            ..ProgressState::default()
        });
    }

    pub fn stage(&self, stage: RestoreStage, total: usize) {
        self.tx.send_modify(|state| {
            state.stage = Some(stage);
            state.completed = 0;
            state.total = total;
        });
    }

    /// Set the work total without changing the stage.
    pub fn set_total(&self, total: usize) {
        self.tx.send_modify(|state| {
            state.completed = 0;
            state.total = total;
        });
    }

    pub fn advance(&self, completed: usize) {
        self.tx.send_modify(|state| state.completed = completed);
    }

    pub fn finish(&self) {
        self.tx.send_replace(ProgressState::default());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Yields to the scheduler once `interval` has passed since the last yield.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last_yield: Instant,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_yield: Instant::now(),
        }
    }

    /// Returns `true` if it yielded.
    pub async fn tick(&mut self) -> bool {
        if self.last_yield.elapsed() < self.interval {
            return false;
        }
        tokio::task::yield_now().await;
        self.last_yield = Instant::now();
        true
    }
}

/// Shared cancellation flag.
///
/// Cancelling stops a restore from entering its next stage. Stages already
/// applied stay applied.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
