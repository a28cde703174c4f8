//! Keyed record store for stasis save files.
//!
//! A [`RecordStore`] holds string-keyed [`Payload`]s for one database file
//! at a time. Values are encoded per the configured [`Backend`] and the
//! whole set is written on commit as `seal(encode(StoreSnapshot))`, where
//! the seal is the compression and obfuscation [`Envelope`] from
//! `stasis-crypto`.
//!
//! # Key Types
//!
//! - [`RecordStore`]: get/set/delete plus async load, commit, revert, copy
//! - [`Payload`]: type-erased value tagged with a type token
//! - [`Backend`]: tree, boxed, or binary in-memory representation
//! - [`StoreSnapshot`]: the versioned on-disk container
//! - [`SaveMedium`]: where bytes are read and written
//!
//! [`Envelope`]: stasis_crypto::Envelope

pub mod backend;
pub mod config;
pub mod container;
pub mod error;
pub mod medium;
pub mod payload;
pub mod store;

pub use backend::Backend;
pub use config::StoreConfig;
pub use container::{StoreSnapshot, BINARY_MAGIC, FORMAT_TAG};
pub use error::{PayloadError, StoreError, StoreResult};
pub use medium::{DiskMedium, MemoryMedium, SaveMedium};
pub use payload::{Payload, PayloadKind, Persistable};
pub use store::{MigrationHook, RecordStore, RecordStoreBuilder, StoreMetadata};
