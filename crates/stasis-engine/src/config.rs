use std::time::Duration;

use serde::{Deserialize, Serialize};
use stasis_pack::PackError;
use stasis_types::InstanceId;
use tracing::warn;

use crate::error::EngineResult;

/// What happens when a part fails to pack or unpack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnpackPolicy {
    /// Abort the remaining batch with the part's error.
    Strict,
    /// Log, skip the offending part, and continue.
    #[default]
    Lenient,
}

impl UnpackPolicy {
    /// Apply the policy to a part failure: strict propagates, lenient logs.
    pub(crate) fn handle(&self, error: PackError, part: &str) -> EngineResult<()> {
        match self {
            Self::Strict => Err(error.into()),
            Self::Lenient => {
                warn!(part = %part, error = %error, "part failed, skipped");
                Ok(())
            }
        }
    }
}

/// Which live objects a capture walks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureScope {
    /// Every live object with a valid identity.
    #[default]
    AllLive,
    /// Only these roots and their descendants.
    Roots(Vec<InstanceId>),
}

/// Configuration for the capture and restore orchestrators.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global pack/unpack failure policy.
    pub unpack_policy: UnpackPolicy,
    pub capture_scope: CaptureScope,
    /// How long a save, or an implicit per-scope restore, waits for a
    /// store whose file operation is in flight. A save then fails with a
    /// lock timeout; the scope restore is skipped.
    pub lock_wait: Duration,
    /// Long loops yield to the scheduler at least this often.
    pub yield_interval: Duration,
    /// Whether a full restore replays the saved set of loaded scopes.
    pub restore_scope_context: bool,
    /// Capacity of the notification channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unpack_policy: UnpackPolicy::default(),
            capture_scope: CaptureScope::default(),
            lock_wait: Duration::from_secs(2),
            yield_interval: Duration::from_millis(20),
            restore_scope_context: true,
            event_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Configuration that aborts on the first part failure.
    pub fn strict() -> Self {
        Self {
            unpack_policy: UnpackPolicy::Strict,
            ..Default::default()
        }
    }
}
