//! The authorization service: administrative mutations, the request-time
//! permission check, and the cache wiring between them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::TaggedCache;
use crate::errors::{AuthzError, Result};
use crate::hierarchy;
use crate::registry::PolicyRegistry;
use crate::resolver;
use crate::settings::AuthzSettings;
use crate::store::{PolicyFilter, RbacStore};
use crate::sync::{self, SyncReport};
use crate::types::{
    policy_key, Action, GrantMap, GrantUpdate, Metadata, NewPolicy, NewRole, Operation, Policy,
    PolicyId, PolicyUpdate, Role, RoleId, RoleParent, RolePolicy, RoleUpdate,
};
use crate::utils::snake_case;

fn role_tag(id: RoleId) -> String {
    format!("role:{id}")
}

fn policy_tag(id: PolicyId) -> String {
    format!("policy:{id}")
}

/// RBAC authorization service.
///
/// Admin mutations invalidate the affected cache entries synchronously, in
/// the same call; permission checks read through a per-role cache of
/// resolved grant maps.
pub struct AuthorizationService {
    store: Arc<dyn RbacStore>,
    registry: Arc<PolicyRegistry>,
    settings: AuthzSettings,
    cache: TaggedCache<RoleId, GrantMap>,
    /// Serializes hierarchy-edge writes: two concurrent edge inserts could
    /// each pass the cycle check and jointly close a cycle otherwise.
    edge_writes: Mutex<()>,
}

impl AuthorizationService {
    pub fn new(
        store: Arc<dyn RbacStore>,
        registry: Arc<PolicyRegistry>,
        settings: AuthzSettings,
    ) -> Self {
        info!(
            "Authorization service initialized, enforcement {}",
            if settings.enabled { "on" } else { "off" }
        );
        Self {
            cache: TaggedCache::new(settings.cache_ttl()),
            store,
            registry,
            settings,
            edge_writes: Mutex::new(()),
        }
    }

    /// Startup hook: reconcile the policy registry into the store.
    ///
    /// Safe to call repeatedly; a pass that wrote anything drops the whole
    /// cache since restored policies may revive grants on any role.
    pub async fn sync_registry(&self) -> Result<SyncReport> {
        let report = sync::reconcile(&self.registry, self.store.as_ref()).await?;
        if !report.is_noop() {
            self.cache.clear().await;
        }
        Ok(report)
    }

    // --- Roles ---

    pub async fn create_role(&self, input: NewRole) -> Result<Role> {
        let row = build_role(input)?;
        self.store.create_roles(vec![row.clone()]).await?;
        info!("Created role '{}'", row.name);
        Ok(row)
    }

    pub async fn create_roles(&self, inputs: Vec<NewRole>) -> Result<Vec<Role>> {
        let rows = inputs
            .into_iter()
            .map(build_role)
            .collect::<Result<Vec<_>>>()?;
        self.store.create_roles(rows.clone()).await?;
        info!("Created {} roles", rows.len());
        Ok(rows)
    }

    pub async fn update_role(&self, id: RoleId, update: RoleUpdate) -> Result<Role> {
        let mut roles = self.update_roles(vec![(id, update)]).await?;
        Ok(roles.swap_remove(0))
    }

    /// Batched role update: every row is fetched and validated first, then
    /// written in a single store call.
    pub async fn update_roles(&self, updates: Vec<(RoleId, RoleUpdate)>) -> Result<Vec<Role>> {
        let mut rows = Vec::with_capacity(updates.len());
        for (id, update) in updates {
            let mut role = self
                .store
                .role(id)
                .await?
                .ok_or(AuthzError::RoleNotFound(id))?;
            apply_role_update(&mut role, update)?;
            rows.push(role);
        }
        self.store.update_roles(rows.clone()).await?;
        for role in &rows {
            self.cache.invalidate_tag(&role_tag(role.id)).await;
        }
        Ok(rows)
    }

    pub async fn delete_role(&self, id: RoleId) -> Result<()> {
        self.delete_roles(&[id]).await
    }

    /// Deleting roles also drops their grants and parent edges; descendants
    /// are invalidated through the deleted roles' tags.
    pub async fn delete_roles(&self, ids: &[RoleId]) -> Result<()> {
        self.store.delete_roles(ids).await?;
        for id in ids {
            self.cache.invalidate_tag(&role_tag(*id)).await;
        }
        info!("Deleted {} roles", ids.len());
        Ok(())
    }

    pub async fn role(&self, id: RoleId) -> Result<Option<Role>> {
        self.store.role(id).await
    }

    pub async fn role_by_name(&self, name: &str) -> Result<Option<Role>> {
        self.store.role_by_name(name).await
    }

    pub async fn roles(&self) -> Result<Vec<Role>> {
        self.store.roles().await
    }

    // --- Policies ---

    pub async fn create_policy(&self, input: NewPolicy) -> Result<Policy> {
        let row = self.build_policy(input).await?;
        self.store.create_policies(vec![row.clone()]).await?;
        info!("Created policy '{}'", row.key);
        Ok(row)
    }

    pub async fn create_policies(&self, inputs: Vec<NewPolicy>) -> Result<Vec<Policy>> {
        let mut rows = Vec::with_capacity(inputs.len());
        let mut seen: HashSet<String> = HashSet::new();
        for input in inputs {
            let row = self.build_policy(input).await?;
            if !seen.insert(row.key.clone()) {
                return Err(AuthzError::DuplicateKey(row.key));
            }
            rows.push(row);
        }
        self.store.create_policies(rows.clone()).await?;
        info!("Created {} policies", rows.len());
        Ok(rows)
    }

    pub async fn update_policy(&self, id: PolicyId, update: PolicyUpdate) -> Result<Policy> {
        let mut policies = self.update_policies(vec![(id, update)]).await?;
        Ok(policies.swap_remove(0))
    }

    /// Batched policy update; the key (resource and operation) is immutable,
    /// only name, description and metadata change.
    pub async fn update_policies(
        &self,
        updates: Vec<(PolicyId, PolicyUpdate)>,
    ) -> Result<Vec<Policy>> {
        let mut rows = Vec::with_capacity(updates.len());
        for (id, update) in updates {
            let mut policy = self
                .store
                .policy(id)
                .await?
                .ok_or(AuthzError::PolicyNotFound(id))?;
            apply_policy_update(&mut policy, update)?;
            rows.push(policy);
        }
        self.store.update_policies(rows.clone()).await?;
        for policy in &rows {
            self.cache.invalidate_tag(&policy_tag(policy.id)).await;
        }
        Ok(rows)
    }

    pub async fn delete_policy(&self, id: PolicyId) -> Result<()> {
        self.delete_policies(&[id]).await
    }

    /// Soft delete. Role associations survive and revive on restore.
    pub async fn delete_policies(&self, ids: &[PolicyId]) -> Result<()> {
        self.store.soft_delete_policies(ids, Utc::now()).await?;
        for id in ids {
            self.cache.invalidate_tag(&policy_tag(*id)).await;
        }
        info!("Soft-deleted {} policies", ids.len());
        Ok(())
    }

    pub async fn restore_policy(&self, id: PolicyId) -> Result<()> {
        self.store.restore_policies(&[id]).await?;
        self.cache.invalidate_tag(&policy_tag(id)).await;
        info!("Restored policy {id}");
        Ok(())
    }

    pub async fn policy(&self, id: PolicyId) -> Result<Option<Policy>> {
        self.store.policy(id).await
    }

    pub async fn policy_by_key(&self, key: &str) -> Result<Option<Policy>> {
        let mut rows = self
            .store
            .policies(PolicyFilter::by_keys(vec![key.to_string()], false))
            .await?;
        Ok(rows.pop())
    }

    pub async fn policies(&self, filter: PolicyFilter) -> Result<Vec<Policy>> {
        self.store.policies(filter).await
    }

    // --- Role-policy grants ---

    pub async fn grant_policy(&self, role: RoleId, policy: PolicyId) -> Result<RolePolicy> {
        let mut grants = self.grant_policies(role, &[policy]).await?;
        Ok(grants.swap_remove(0))
    }

    pub async fn grant_policies(
        &self,
        role: RoleId,
        policies: &[PolicyId],
    ) -> Result<Vec<RolePolicy>> {
        self.store
            .role(role)
            .await?
            .ok_or(AuthzError::RoleNotFound(role))?;
        let mut rows = Vec::with_capacity(policies.len());
        for &policy in policies {
            // The policy may be soft-deleted; the grant is still recorded
            // and takes effect once the policy is restored.
            self.store
                .policy(policy)
                .await?
                .ok_or(AuthzError::PolicyNotFound(policy))?;
            rows.push(RolePolicy {
                id: Uuid::new_v4(),
                role_id: role,
                policy_id: policy,
                metadata: Metadata::default(),
                created_at: Utc::now(),
            });
        }
        self.store.create_grants(rows.clone()).await?;
        self.cache.invalidate_tag(&role_tag(role)).await;
        info!("Granted {} policies to role {role}", rows.len());
        Ok(rows)
    }

    pub async fn update_grant(&self, id: Uuid, update: GrantUpdate) -> Result<RolePolicy> {
        let mut grants = self.update_grants(vec![(id, update)]).await?;
        Ok(grants.swap_remove(0))
    }

    pub async fn update_grants(
        &self,
        updates: Vec<(Uuid, GrantUpdate)>,
    ) -> Result<Vec<RolePolicy>> {
        let mut rows = Vec::with_capacity(updates.len());
        for (id, update) in updates {
            let mut grant = self
                .store
                .grant(id)
                .await?
                .ok_or(AuthzError::GrantNotFound(id))?;
            if let Some(metadata) = update.metadata {
                grant.metadata = metadata;
            }
            rows.push(grant);
        }
        self.store.update_grants(rows.clone()).await?;
        for grant in &rows {
            self.cache.invalidate_tag(&role_tag(grant.role_id)).await;
        }
        Ok(rows)
    }

    pub async fn revoke_grant(&self, id: Uuid) -> Result<()> {
        self.revoke_grants(&[id]).await
    }

    pub async fn revoke_grants(&self, ids: &[Uuid]) -> Result<()> {
        let mut affected: HashSet<RoleId> = HashSet::new();
        for &id in ids {
            let grant = self
                .store
                .grant(id)
                .await?
                .ok_or(AuthzError::GrantNotFound(id))?;
            affected.insert(grant.role_id);
        }
        self.store.delete_grants(ids).await?;
        for role in affected {
            self.cache.invalidate_tag(&role_tag(role)).await;
        }
        Ok(())
    }

    pub async fn grants_of(&self, role: RoleId) -> Result<Vec<RolePolicy>> {
        self.store.grants_for_role(role).await
    }

    // --- Role-parent edges ---

    pub async fn add_parent(&self, role: RoleId, parent: RoleId) -> Result<RoleParent> {
        let mut edges = self.add_parents(role, &[parent]).await?;
        Ok(edges.swap_remove(0))
    }

    pub async fn add_parents(&self, role: RoleId, parents: &[RoleId]) -> Result<Vec<RoleParent>> {
        self.store
            .role(role)
            .await?
            .ok_or(AuthzError::RoleNotFound(role))?;
        for &parent in parents {
            self.store
                .role(parent)
                .await?
                .ok_or(AuthzError::RoleNotFound(parent))?;
        }

        // Guard held across the cycle check and the write (check-then-act).
        let guard = self.edge_writes.lock().await;
        let mut rows = Vec::with_capacity(parents.len());
        for &parent in parents {
            hierarchy::validate_edge(self.store.as_ref(), role, parent, None).await?;
            rows.push(RoleParent {
                id: Uuid::new_v4(),
                role_id: role,
                parent_id: parent,
                metadata: Metadata::default(),
                created_at: Utc::now(),
            });
        }
        self.store.create_edges(rows.clone()).await?;
        drop(guard);

        self.cache.invalidate_tag(&role_tag(role)).await;
        info!("Role {role} now inherits from {} parents", rows.len());
        Ok(rows)
    }

    /// Repoint an existing edge to a new parent. The edge's child role is
    /// fixed at creation; the cycle check runs against the graph as it would
    /// exist after the edit.
    pub async fn reparent(&self, edge_id: Uuid, new_parent: RoleId) -> Result<RoleParent> {
        let mut edge = self
            .store
            .edge(edge_id)
            .await?
            .ok_or(AuthzError::EdgeNotFound(edge_id))?;
        self.store
            .role(new_parent)
            .await?
            .ok_or(AuthzError::RoleNotFound(new_parent))?;

        let guard = self.edge_writes.lock().await;
        hierarchy::validate_edge(self.store.as_ref(), edge.role_id, new_parent, Some(edge_id))
            .await?;
        edge.parent_id = new_parent;
        self.store.update_edge(edge.clone()).await?;
        drop(guard);

        self.cache.invalidate_tag(&role_tag(edge.role_id)).await;
        info!("Edge {edge_id} repointed to parent {new_parent}");
        Ok(edge)
    }

    pub async fn remove_parent(&self, edge_id: Uuid) -> Result<()> {
        self.remove_parents(&[edge_id]).await
    }

    pub async fn remove_parents(&self, edge_ids: &[Uuid]) -> Result<()> {
        let mut affected: HashSet<RoleId> = HashSet::new();
        for &id in edge_ids {
            let edge = self
                .store
                .edge(id)
                .await?
                .ok_or(AuthzError::EdgeNotFound(id))?;
            affected.insert(edge.role_id);
        }
        self.store.delete_edges(edge_ids).await?;
        for role in affected {
            self.cache.invalidate_tag(&role_tag(role)).await;
        }
        Ok(())
    }

    pub async fn parents_of(&self, role: RoleId) -> Result<Vec<RoleParent>> {
        self.store.parents_of(role).await
    }

    // --- Resolution and checks ---

    /// Direct plus inherited live policies of one role.
    pub async fn effective_policies(&self, role: RoleId) -> Result<Vec<Policy>> {
        Ok(resolver::resolve(self.store.as_ref(), role).await?.policies)
    }

    /// Merged `resource -> operations` map for a set of roles.
    pub async fn grants_for_roles(&self, roles: &[RoleId]) -> Result<GrantMap> {
        let mut merged = GrantMap::new();
        for map in self.grant_maps(roles).await? {
            for (resource, operations) in map {
                merged.entry(resource).or_default().extend(operations);
            }
        }
        Ok(merged)
    }

    /// True iff every operation of every action is granted by at least one
    /// of the given roles, directly or through inheritance. Wildcard grants
    /// (`resource:*`) satisfy any operation on their resource.
    pub async fn has_permission(&self, roles: &[RoleId], actions: &[Action]) -> Result<bool> {
        if !self.settings.enabled {
            debug!("Authorization disabled, permitting by configuration");
            return Ok(true);
        }
        // Nothing to enforce.
        if roles.is_empty() || actions.is_empty() {
            return Ok(true);
        }

        let merged = self.grants_for_roles(roles).await?;
        for action in actions {
            let resource = snake_case(&action.resource);
            let granted = merged.get(&resource);
            for required in &action.operations {
                // Two hash lookups per required operation, no scan.
                let allowed = granted
                    .map(|ops| ops.contains(required) || ops.contains(&Operation::Wildcard))
                    .unwrap_or(false);
                if !allowed {
                    debug!("Permission denied, no role grants {resource}:{required}");
                    return Ok(false);
                }
            }
        }
        debug!(
            "Permission granted, {} actions across {} roles",
            actions.len(),
            roles.len()
        );
        Ok(true)
    }

    /// Cached per-role grant maps; misses are resolved in bulk without
    /// holding any lock, so concurrent fills for the same role may race
    /// (last write wins, the value is a pure function of store state).
    async fn grant_maps(&self, roles: &[RoleId]) -> Result<Vec<GrantMap>> {
        let mut maps = Vec::with_capacity(roles.len());
        let mut missing: Vec<RoleId> = Vec::new();
        for &role in roles {
            match self.cache.get(&role).await {
                Some(map) => maps.push(map),
                None => missing.push(role),
            }
        }
        if missing.is_empty() {
            return Ok(maps);
        }

        let resolved = resolver::resolve_many(self.store.as_ref(), &missing).await?;
        for role in missing {
            let Some(entry) = resolved.get(&role) else {
                continue;
            };
            let map = entry.grant_map();
            // Tag with the whole role closure and every associated policy,
            // so any dependency mutation clears this entry in O(1).
            let mut tags: Vec<String> =
                entry.role_closure.iter().map(|id| role_tag(*id)).collect();
            tags.extend(entry.associated_policy_ids.iter().map(|id| policy_tag(*id)));
            self.cache.insert(role, map.clone(), tags).await;
            maps.push(map);
        }
        Ok(maps)
    }

    #[cfg(test)]
    pub(crate) async fn cached_roles(&self) -> usize {
        self.cache.len().await
    }
}

fn apply_role_update(role: &mut Role, update: RoleUpdate) -> Result<()> {
    if let Some(name) = update.name {
        if name.trim().is_empty() {
            return Err(AuthzError::Validation("role name is required".into()));
        }
        role.name = name.trim().to_string();
    }
    if let Some(description) = update.description {
        role.description = Some(description);
    }
    if let Some(metadata) = update.metadata {
        role.metadata = metadata;
    }
    Ok(())
}

fn apply_policy_update(policy: &mut Policy, update: PolicyUpdate) -> Result<()> {
    if let Some(name) = update.name {
        if name.trim().is_empty() {
            return Err(AuthzError::Validation("policy name is required".into()));
        }
        policy.name = name.trim().to_string();
    }
    if let Some(description) = update.description {
        policy.description = Some(description);
    }
    if let Some(metadata) = update.metadata {
        policy.metadata = metadata;
    }
    Ok(())
}

fn build_role(input: NewRole) -> Result<Role> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AuthzError::Validation("role name is required".into()));
    }
    Ok(Role {
        id: RoleId::new(),
        name: name.to_string(),
        description: input.description,
        metadata: input.metadata,
        created_at: Utc::now(),
    })
}

impl AuthorizationService {
    async fn build_policy(&self, input: NewPolicy) -> Result<Policy> {
        if input.name.trim().is_empty() {
            return Err(AuthzError::Validation("policy name is required".into()));
        }
        let resource = snake_case(&input.resource);
        if resource.is_empty() {
            return Err(AuthzError::Validation("policy resource is required".into()));
        }
        let operation = Operation::parse(&input.operation);
        if matches!(&operation, Operation::Named(op) if op.is_empty()) {
            return Err(AuthzError::Validation("policy operation is required".into()));
        }
        let key = policy_key(&resource, &operation);

        // Key uniqueness covers soft-deleted rows too: a deleted policy with
        // this key must be restored, not shadowed by a new row.
        let existing = self
            .store
            .policies(PolicyFilter::by_keys(vec![key.clone()], true))
            .await?;
        if !existing.is_empty() {
            return Err(AuthzError::DuplicateKey(key));
        }

        Ok(Policy {
            id: PolicyId::new(),
            key,
            resource,
            operation,
            name: input.name.trim().to_string(),
            description: input.description,
            metadata: input.metadata,
            created_at: Utc::now(),
            deleted_at: None,
        })
    }
}

impl std::fmt::Debug for AuthorizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationService")
            .field("enabled", &self.settings.enabled)
            .finish_non_exhaustive()
    }
}
