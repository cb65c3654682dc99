//! Persistence seam for the authorization core.
//!
//! Real deployments back this with their database layer; [`MemoryStore`]
//! serves tests and single-process embedders. Implementations only persist
//! rows; all invariants (hierarchy acyclicity, key uniqueness, validation)
//! are enforced above the seam by the service.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::types::{Policy, PolicyId, Role, RoleId, RoleParent, RolePolicy};

pub use memory::MemoryStore;

/// Filter for policy listings.
#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    /// Restrict to these ids.
    pub ids: Option<Vec<PolicyId>>,
    /// Restrict to these canonical keys.
    pub keys: Option<Vec<String>>,
    /// Include soft-deleted rows. Off by default.
    pub include_deleted: bool,
}

impl PolicyFilter {
    pub fn include_deleted() -> Self {
        Self {
            include_deleted: true,
            ..Self::default()
        }
    }

    pub fn by_ids(ids: Vec<PolicyId>, include_deleted: bool) -> Self {
        Self {
            ids: Some(ids),
            include_deleted,
            ..Self::default()
        }
    }

    pub fn by_keys(keys: Vec<String>, include_deleted: bool) -> Self {
        Self {
            keys: Some(keys),
            include_deleted,
            ..Self::default()
        }
    }

    pub fn matches(&self, policy: &Policy) -> bool {
        if policy.is_deleted() && !self.include_deleted {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&policy.id) {
                return false;
            }
        }
        if let Some(keys) = &self.keys {
            if !keys.contains(&policy.key) {
                return false;
            }
        }
        true
    }
}

/// Persisted storage for roles, policies and their associations.
///
/// All mutating operations are batched; single-row writes pass a one-element
/// batch. Batches are applied atomically where the backend supports it.
#[async_trait]
pub trait RbacStore: Send + Sync {
    // Policies
    async fn policy(&self, id: PolicyId) -> Result<Option<Policy>>;
    async fn policies(&self, filter: PolicyFilter) -> Result<Vec<Policy>>;
    async fn create_policies(&self, rows: Vec<Policy>) -> Result<()>;
    /// Upsert keyed by canonical `key`, not id: when a row with the same key
    /// already exists (live or soft-deleted), that row is updated in place
    /// and keeps its id and `created_at`. Racing writers for the same key
    /// therefore converge on one row instead of inserting duplicates.
    async fn upsert_policies(&self, rows: Vec<Policy>) -> Result<()>;
    /// Full-row replace, keyed by id. Unknown ids are an error.
    async fn update_policies(&self, rows: Vec<Policy>) -> Result<()>;
    async fn soft_delete_policies(&self, ids: &[PolicyId], at: DateTime<Utc>) -> Result<()>;
    async fn restore_policies(&self, ids: &[PolicyId]) -> Result<()>;

    // Roles
    async fn role(&self, id: RoleId) -> Result<Option<Role>>;
    async fn role_by_name(&self, name: &str) -> Result<Option<Role>>;
    async fn roles(&self) -> Result<Vec<Role>>;
    async fn create_roles(&self, rows: Vec<Role>) -> Result<()>;
    async fn update_roles(&self, rows: Vec<Role>) -> Result<()>;
    /// Also removes the deleted roles' grants and parent edges (both
    /// directions); removing a node cannot introduce a cycle.
    async fn delete_roles(&self, ids: &[RoleId]) -> Result<()>;

    // Role-policy grants
    async fn grant(&self, id: Uuid) -> Result<Option<RolePolicy>>;
    async fn grants_for_role(&self, role: RoleId) -> Result<Vec<RolePolicy>>;
    async fn create_grants(&self, rows: Vec<RolePolicy>) -> Result<()>;
    /// Full-row replace, keyed by id. Unknown ids are an error.
    async fn update_grants(&self, rows: Vec<RolePolicy>) -> Result<()>;
    async fn delete_grants(&self, ids: &[Uuid]) -> Result<()>;

    // Role-parent edges
    async fn edge(&self, id: Uuid) -> Result<Option<RoleParent>>;
    async fn parents_of(&self, role: RoleId) -> Result<Vec<RoleParent>>;
    async fn create_edges(&self, rows: Vec<RoleParent>) -> Result<()>;
    /// Full-row replace of one edge, keyed by id.
    async fn update_edge(&self, row: RoleParent) -> Result<()>;
    async fn delete_edges(&self, ids: &[Uuid]) -> Result<()>;
}
