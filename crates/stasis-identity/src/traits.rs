use stasis_types::InstanceId;

/// An object whose destruction the registry can observe.
pub trait Tracked: Send + Sync {
    /// Returns `false` once the object has been destroyed, even if handles
    /// to it are still held.
    fn is_alive(&self) -> bool;
}

/// An object carrying an instance identity.
///
/// The identity is stored on the object itself and written only by the
/// [`IdentityRegistry`](crate::IdentityRegistry), which is why assignment
/// takes `&self`.
pub trait Identified: Tracked {
    fn instance_id(&self) -> Option<InstanceId>;

    fn assign_instance_id(&self, id: Option<InstanceId>);
}
