//! Identity registry for stasis.
//!
//! The [`IdentityRegistry`] is the single authority on whether an object
//! with a given [`InstanceId`](stasis_types::InstanceId) is currently live.
//! It is an explicit, session-scoped value rather than process-global state:
//! the caller creates one per session, clears it at session start, and
//! passes it to the capture and restore orchestrators.
//!
//! Registration failures never panic. They are logged and leave the caller
//! in a well-defined state (no identity) that it must check.

pub mod error;
pub mod registry;
pub mod traits;

pub use error::{IdentityError, IdentityResult};
pub use registry::{IdentityRegistry, TemplateReport};
pub use traits::{Identified, Tracked};
