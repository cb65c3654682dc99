//! Validation of role-parent edges.
//!
//! The role hierarchy is a DAG of `role -> parent` edges stored as flat rows.
//! Every edge write runs through [`validate_edge`] first, so an accepted
//! write can never close a cycle. Traversal is still bounded and
//! visited-tracked so a malformed graph cannot hang the validator.

use uuid::Uuid;

use std::collections::{HashSet, VecDeque};

use crate::errors::{AuthzError, Result};
use crate::store::RbacStore;
use crate::types::RoleId;

/// Hard bound on upward traversal depth. Deeper hierarchies than this are
/// not legitimate; hitting the bound just stops the walk.
pub(crate) const MAX_DEPTH: usize = 64;

/// Reject the proposed edge `role -> parent` if it is a self-reference or
/// would close a cycle.
///
/// `replacing` carries the id of an existing edge about to be overwritten by
/// this write (a `parent_id` update), which is excluded from the traversal so
/// the check runs against the graph as it would exist after the edit.
pub async fn validate_edge(
    store: &dyn RbacStore,
    role: RoleId,
    parent: RoleId,
    replacing: Option<Uuid>,
) -> Result<()> {
    // Distinct precondition, checked before any graph work.
    if role == parent {
        return Err(AuthzError::SelfParent(role));
    }

    // Walk up from the proposed parent. If `role` is reachable, the parent
    // already (transitively) inherits from it and the new edge would loop.
    let mut visited: HashSet<RoleId> = HashSet::new();
    let mut frontier: VecDeque<RoleId> = VecDeque::new();
    visited.insert(parent);
    frontier.push_back(parent);

    let mut depth = 0;
    while !frontier.is_empty() && depth < MAX_DEPTH {
        let mut next = VecDeque::new();
        while let Some(current) = frontier.pop_front() {
            for edge in store.parents_of(current).await? {
                if Some(edge.id) == replacing {
                    continue;
                }
                if edge.parent_id == role {
                    return Err(AuthzError::CircularDependency { role, parent });
                }
                if visited.insert(edge.parent_id) {
                    next.push_back(edge.parent_id);
                }
            }
        }
        frontier = next;
        depth += 1;
    }

    Ok(())
}
