use std::time::Duration;

use serde::{Deserialize, Serialize};
use stasis_crypto::Compression;

use crate::backend::Backend;

/// Configuration for a [`RecordStore`](crate::RecordStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// In-memory representation and commit partition.
    pub backend: Backend,
    /// Compression applied before obfuscation.
    pub compression: Compression,
    /// Whether committed files are obfuscated.
    pub obfuscate: bool,
    /// Bound on waiting for the store's critical section (default: 5000).
    pub lock_timeout_ms: u64,
    /// Free-form tag of the build writing the file.
    pub build_tag: String,
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            compression: Compression::default(),
            obfuscate: false,
            lock_timeout_ms: 5_000,
            build_tag: String::from("dev"),
        }
    }
}
