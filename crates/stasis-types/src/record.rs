use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{InstanceId, TemplateId};

/// Name of a loadable container (level, scene, zone) that partitions which
/// persisted objects are relevant to what is currently loaded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeTag(String);

impl ScopeTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeTag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Spatial placement of an object: position and orientation quaternion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub position: [f32; 3],
    /// Orientation as `[x, y, z, w]`.
    pub rotation: [f32; 4],
}

impl Placement {
    /// Origin with no rotation.
    pub const IDENTITY: Self = Self {
        position: [0.0; 3],
        rotation: [0.0, 0.0, 0.0, 1.0],
    };

    /// A placement at `position` with no rotation.
    pub const fn at(position: [f32; 3]) -> Self {
        Self {
            position,
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Persisted identity of one object.
///
/// Written by capture under [`InstanceId::record_key`] and read back by the
/// reconciliation passes of restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub instance: InstanceId,
    /// The scope the object belongs to.
    pub scope: ScopeTag,
    /// Template to spawn from when the object is not live. `None` means
    /// the object cannot be recreated by restore.
    pub template: Option<TemplateId>,
    /// Parent object, `None` for roots.
    pub parent: Option<InstanceId>,
    pub placement: Placement,
    /// Free-form description for debugging and tooling.
    #[serde(default)]
    pub description: String,
}

impl IdentityRecord {
    /// Returns `true` if restore can spawn this object from a template.
    pub fn is_spawnable(&self) -> bool {
        self.template.is_some()
    }
}

/// Persisted set of loaded scopes and the active one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeContext {
    pub loaded: Vec<ScopeTag>,
    pub active: Option<ScopeTag>,
}
