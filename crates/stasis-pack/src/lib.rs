//! Pack/unpack contract between stasis and application objects.
//!
//! Application code implements [`Entity`] for each persistable object and
//! [`Part`] for each piece of state it carries. The orchestrators in
//! `stasis-engine` drive these traits; parts never call each other
//! directly and resolve cross-object references through the
//! [`ReferenceContext`].
//!
//! # Key Types
//!
//! - [`Entity`]: an identified live object with placement and parts
//! - [`Part`]: captures and applies one [`SnapshotPackage`]
//! - [`ReferenceContext`]: identity lookups and deferred fixups during unpack

pub mod context;
pub mod error;
pub mod part;
pub mod validate;

pub use context::{EntityRegistry, Fixup, ReferenceContext};
pub use error::{PackError, PackResult};
pub use part::{package, unpackage, Entity, Part, SnapshotPackage};
pub use validate::{validate_parts, ValidatedParts};
