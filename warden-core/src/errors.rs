use uuid::Uuid;

use crate::types::{PolicyId, RoleId};

/// Errors surfaced by the authorization core.
///
/// A denied permission check is not an error: `has_permission` returns
/// `Ok(false)`. Errors mean the write was rejected or the check could not be
/// evaluated at all.
#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    /// Role-parent write where the child equals the parent.
    #[error("role {0} cannot be its own parent")]
    SelfParent(RoleId),

    /// Role-parent write that would close an inheritance cycle.
    #[error("making role {parent} a parent of role {role} would create a circular dependency")]
    CircularDependency { role: RoleId, parent: RoleId },

    /// Malformed role or policy input, rejected before persistence.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("role {0} not found")]
    RoleNotFound(RoleId),

    #[error("policy {0} not found")]
    PolicyNotFound(PolicyId),

    #[error("role-policy grant {0} not found")]
    GrantNotFound(Uuid),

    #[error("role-parent edge {0} not found")]
    EdgeNotFound(Uuid),

    /// A live policy with this key already exists, or a soft-deleted one does
    /// and must be restored instead of recreated.
    #[error("a policy with key `{0}` already exists")]
    DuplicateKey(String),

    /// Backend failure; never mapped to an allow/deny decision.
    #[error("store error: {0}")]
    Store(String),
}

impl AuthzError {
    /// True for errors caused by the request itself rather than the system.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, AuthzError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, AuthzError>;
