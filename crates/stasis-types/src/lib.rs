//! Foundation types for stasis.
//!
//! This crate provides the identity, keying and record types shared by every
//! other stasis crate. Nothing here touches the file system or the live
//! object graph.
//!
//! # Key Types
//!
//! - [`Uid`]: Fixed-width 128-bit identifier underlying every identity
//! - [`InstanceId`]: Identity of one live object for its lifetime
//! - [`TemplateId`]: Authoring-time identity of a spawnable archetype
//! - [`PartKey`]: Build-stable key of a part, unique within its owner
//! - [`CompositeKey`]: Store-unique key derived from owner and part
//! - [`TypeToken`]: Stable name of a snapshot payload type
//! - [`IdentityRecord`]: Persisted identity, placement and parentage of an object

pub mod error;
pub mod identity;
pub mod record;
pub mod token;

pub use error::TypeError;
pub use identity::{CompositeKey, InstanceId, PartKey, TemplateId, Uid, UID_LEN};
pub use record::{IdentityRecord, Placement, ScopeContext, ScopeTag};
pub use token::{TypeToken, Typed};
