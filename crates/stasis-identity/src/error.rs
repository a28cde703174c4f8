use stasis_types::{InstanceId, TemplateId};

/// Errors from identity registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// Another live instance already holds the identity.
    #[error("identity {0} is held by another live instance")]
    Collision(InstanceId),

    /// The nil identifier was offered as an identity.
    #[error("nil identity rejected")]
    NilIdentity,

    #[error("template {0} is not registered")]
    UnknownTemplate(TemplateId),
}

/// Result alias for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
