use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::utils::snake_case;

/// Opaque key-value bag carried by every entity.
pub type Metadata = serde_json::Map<String, Value>;

/// Effective grants of a role set: resource -> operations allowed on it.
pub type GrantMap = HashMap<String, HashSet<Operation>>;

/// Identifier of a persisted role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub Uuid);

impl RoleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a persisted policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub Uuid);

impl PolicyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PolicyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An operation on a resource, or the `*` wildcard meaning "any operation".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Named(String),
    Wildcard,
}

impl Operation {
    /// Parse and normalize an operation name; `*` becomes the wildcard.
    pub fn parse(s: &str) -> Operation {
        if s.trim() == "*" {
            Operation::Wildcard
        } else {
            Operation::Named(snake_case(s))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operation::Named(s) => s,
            Operation::Wildcard => "*",
        }
    }

    /// Whether this granted operation satisfies a required one.
    pub fn satisfies(&self, required: &Operation) -> bool {
        matches!(self, Operation::Wildcard) || self == required
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Operation {
    fn from(s: String) -> Self {
        Operation::parse(&s)
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

/// Canonical policy key: `"<resource>:<operation>"`, both already normalized.
pub fn policy_key(resource: &str, operation: &Operation) -> String {
    format!("{resource}:{operation}")
}

/// A permission atom: an operation allowed on a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    /// Unique among non-deleted policies; derived from resource and operation.
    pub key: String,
    pub resource: String,
    pub operation: Operation,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Policy {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Input for creating a policy. Resource and operation are normalized on
/// creation, so any casing/separator style is accepted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPolicy {
    pub resource: String,
    pub operation: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Partial update of a policy; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
}

/// A named bundle of direct policy grants, optionally inheriting from
/// parent roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRole {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
}

/// Partial update of a role-policy grant; only the metadata bag is mutable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantUpdate {
    pub metadata: Option<Metadata>,
}

/// A direct grant of a policy to a role. Survives policy soft-delete and
/// restore: the association is keyed by policy id, not key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePolicy {
    pub id: Uuid,
    pub role_id: RoleId,
    pub policy_id: PolicyId,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// An inheritance edge: `role_id` inherits every policy `parent_id` resolves
/// to. The edge set must stay acyclic; all writes go through the hierarchy
/// validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleParent {
    pub id: Uuid,
    pub role_id: RoleId,
    pub parent_id: RoleId,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A required action: one resource plus one or more operations, all of which
/// must be granted (AND across operations).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub resource: String,
    pub operations: Vec<Operation>,
}

impl Action {
    pub fn new(resource: &str, operations: &[&str]) -> Self {
        Self {
            resource: snake_case(resource),
            operations: operations.iter().map(|op| Operation::parse(op)).collect(),
        }
    }

    pub fn single(resource: &str, operation: &str) -> Self {
        Self::new(resource, &[operation])
    }
}
