//! Inheritance-aware policy resolution.
//!
//! A role's effective policies are its direct grants unioned with everything
//! reachable by walking parent edges upward, deduplicated by policy id.
//! Soft-deleted policies are excluded from the result but still reported as
//! dependencies, so a later restore can invalidate stale cache entries.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::errors::Result;
use crate::hierarchy::MAX_DEPTH;
use crate::store::{PolicyFilter, RbacStore};
use crate::types::{GrantMap, Policy, PolicyId, RoleId};

/// The outcome of resolving one role.
#[derive(Debug, Clone)]
pub struct ResolvedPolicies {
    /// The role itself plus every ancestor reached during the walk.
    pub role_closure: HashSet<RoleId>,
    /// Live effective policies, deduplicated by id.
    pub policies: Vec<Policy>,
    /// Every policy id associated directly or through ancestors, including
    /// soft-deleted ones. These are the entry's cache dependencies.
    pub associated_policy_ids: HashSet<PolicyId>,
}

impl ResolvedPolicies {
    /// Collapse the effective policies into a `resource -> operations` map.
    pub fn grant_map(&self) -> GrantMap {
        let mut map = GrantMap::new();
        for policy in &self.policies {
            map.entry(policy.resource.clone())
                .or_default()
                .insert(policy.operation.clone());
        }
        map
    }
}

/// Resolve the effective policy set of a single role.
pub async fn resolve(store: &dyn RbacStore, role: RoleId) -> Result<ResolvedPolicies> {
    let mut results = resolve_many(store, &[role]).await?;
    // resolve_many returns an entry for every requested role
    Ok(results.remove(&role).unwrap_or_else(|| ResolvedPolicies {
        role_closure: HashSet::from([role]),
        policies: Vec::new(),
        associated_policy_ids: HashSet::new(),
    }))
}

/// Resolve several roles at once, sharing the graph walk: parent edges and
/// grants are fetched once per role even when closures overlap, and all
/// policy rows are loaded in a single store query.
pub async fn resolve_many(
    store: &dyn RbacStore,
    roles: &[RoleId],
) -> Result<HashMap<RoleId, ResolvedPolicies>> {
    let mut parents: HashMap<RoleId, Vec<RoleId>> = HashMap::new();
    let mut direct_policies: HashMap<RoleId, HashSet<PolicyId>> = HashMap::new();

    // Collect each requested role's closure, memoizing per-role edge and
    // grant lookups across the whole call.
    let mut closures: HashMap<RoleId, HashSet<RoleId>> = HashMap::new();
    for &root in roles {
        if closures.contains_key(&root) {
            continue;
        }
        let mut closure = HashSet::from([root]);
        let mut frontier = VecDeque::from([root]);
        let mut depth = 0;
        while !frontier.is_empty() && depth < MAX_DEPTH {
            let mut next = VecDeque::new();
            while let Some(current) = frontier.pop_front() {
                if !parents.contains_key(&current) {
                    let edges = store.parents_of(current).await?;
                    parents.insert(current, edges.into_iter().map(|e| e.parent_id).collect());
                }
                for &parent in &parents[&current] {
                    // Diamond inheritance converges here; each role is
                    // visited once per closure.
                    if closure.insert(parent) {
                        next.push_back(parent);
                    }
                }
            }
            frontier = next;
            depth += 1;
        }
        closures.insert(root, closure);
    }

    // Fetch direct grants for every role in any closure.
    let all_roles: HashSet<RoleId> = closures.values().flatten().copied().collect();
    for &role in &all_roles {
        let grants = store.grants_for_role(role).await?;
        direct_policies.insert(role, grants.into_iter().map(|g| g.policy_id).collect());
    }

    // One query for all referenced policy rows; soft-deleted rows are
    // included so they can be reported as dependencies, but never granted.
    let all_policy_ids: HashSet<PolicyId> =
        direct_policies.values().flatten().copied().collect();
    let rows = store
        .policies(PolicyFilter::by_ids(all_policy_ids.into_iter().collect(), true))
        .await?;
    let by_id: HashMap<PolicyId, Policy> = rows.into_iter().map(|p| (p.id, p)).collect();

    let mut results = HashMap::new();
    for &root in roles {
        let closure = closures.get(&root).cloned().unwrap_or_default();
        let mut associated: HashSet<PolicyId> = HashSet::new();
        for member in &closure {
            if let Some(ids) = direct_policies.get(member) {
                associated.extend(ids.iter().copied());
            }
        }
        let mut policies: Vec<Policy> = associated
            .iter()
            .filter_map(|id| by_id.get(id))
            .filter(|p| !p.is_deleted())
            .cloned()
            .collect();
        policies.sort_by(|a, b| a.key.cmp(&b.key));

        debug!(
            "Resolved role {root}: {} effective policies over {} roles",
            policies.len(),
            closure.len()
        );
        results.insert(
            root,
            ResolvedPolicies {
                role_closure: closure,
                policies,
                associated_policy_ids: associated,
            },
        );
    }

    Ok(results)
}
