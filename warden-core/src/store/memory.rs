use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{AuthzError, Result};
use crate::store::{PolicyFilter, RbacStore};
use crate::types::{Policy, PolicyId, Role, RoleId, RoleParent, RolePolicy};

#[derive(Debug, Default)]
struct Tables {
    policies: HashMap<PolicyId, Policy>,
    roles: HashMap<RoleId, Role>,
    grants: HashMap<Uuid, RolePolicy>,
    edges: HashMap<Uuid, RoleParent>,
}

/// In-memory [`RbacStore`] backed by a single `RwLock`.
///
/// Batches are applied under one write-lock acquisition, so they are atomic
/// with respect to concurrent readers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RbacStore for MemoryStore {
    async fn policy(&self, id: PolicyId) -> Result<Option<Policy>> {
        Ok(self.tables.read().await.policies.get(&id).cloned())
    }

    async fn policies(&self, filter: PolicyFilter) -> Result<Vec<Policy>> {
        Ok(self
            .tables
            .read()
            .await
            .policies
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn create_policies(&self, rows: Vec<Policy>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for row in rows {
            tables.policies.insert(row.id, row);
        }
        Ok(())
    }

    async fn upsert_policies(&self, rows: Vec<Policy>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for mut row in rows {
            let existing = tables
                .policies
                .values()
                .find(|p| p.key == row.key)
                .map(|p| (p.id, p.created_at));
            if let Some((id, created_at)) = existing {
                row.id = id;
                row.created_at = created_at;
            }
            tables.policies.insert(row.id, row);
        }
        Ok(())
    }

    async fn update_policies(&self, rows: Vec<Policy>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for row in &rows {
            if !tables.policies.contains_key(&row.id) {
                return Err(AuthzError::PolicyNotFound(row.id));
            }
        }
        for row in rows {
            tables.policies.insert(row.id, row);
        }
        Ok(())
    }

    async fn soft_delete_policies(&self, ids: &[PolicyId], at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for id in ids {
            let policy = tables
                .policies
                .get_mut(id)
                .ok_or(AuthzError::PolicyNotFound(*id))?;
            policy.deleted_at = Some(at);
        }
        Ok(())
    }

    async fn restore_policies(&self, ids: &[PolicyId]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for id in ids {
            let policy = tables
                .policies
                .get_mut(id)
                .ok_or(AuthzError::PolicyNotFound(*id))?;
            policy.deleted_at = None;
        }
        Ok(())
    }

    async fn role(&self, id: RoleId) -> Result<Option<Role>> {
        Ok(self.tables.read().await.roles.get(&id).cloned())
    }

    async fn role_by_name(&self, name: &str) -> Result<Option<Role>> {
        Ok(self
            .tables
            .read()
            .await
            .roles
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn roles(&self) -> Result<Vec<Role>> {
        Ok(self.tables.read().await.roles.values().cloned().collect())
    }

    async fn create_roles(&self, rows: Vec<Role>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for row in rows {
            tables.roles.insert(row.id, row);
        }
        Ok(())
    }

    async fn update_roles(&self, rows: Vec<Role>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for row in &rows {
            if !tables.roles.contains_key(&row.id) {
                return Err(AuthzError::RoleNotFound(row.id));
            }
        }
        for row in rows {
            tables.roles.insert(row.id, row);
        }
        Ok(())
    }

    async fn delete_roles(&self, ids: &[RoleId]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for id in ids {
            tables.roles.remove(id);
        }
        tables.grants.retain(|_, g| !ids.contains(&g.role_id));
        tables
            .edges
            .retain(|_, e| !ids.contains(&e.role_id) && !ids.contains(&e.parent_id));
        Ok(())
    }

    async fn grant(&self, id: Uuid) -> Result<Option<RolePolicy>> {
        Ok(self.tables.read().await.grants.get(&id).cloned())
    }

    async fn grants_for_role(&self, role: RoleId) -> Result<Vec<RolePolicy>> {
        Ok(self
            .tables
            .read()
            .await
            .grants
            .values()
            .filter(|g| g.role_id == role)
            .cloned()
            .collect())
    }

    async fn create_grants(&self, rows: Vec<RolePolicy>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for row in rows {
            tables.grants.insert(row.id, row);
        }
        Ok(())
    }

    async fn update_grants(&self, rows: Vec<RolePolicy>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for row in &rows {
            if !tables.grants.contains_key(&row.id) {
                return Err(AuthzError::GrantNotFound(row.id));
            }
        }
        for row in rows {
            tables.grants.insert(row.id, row);
        }
        Ok(())
    }

    async fn delete_grants(&self, ids: &[Uuid]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for id in ids {
            tables.grants.remove(id);
        }
        Ok(())
    }

    async fn edge(&self, id: Uuid) -> Result<Option<RoleParent>> {
        Ok(self.tables.read().await.edges.get(&id).cloned())
    }

    async fn parents_of(&self, role: RoleId) -> Result<Vec<RoleParent>> {
        Ok(self
            .tables
            .read()
            .await
            .edges
            .values()
            .filter(|e| e.role_id == role)
            .cloned()
            .collect())
    }

    async fn create_edges(&self, rows: Vec<RoleParent>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for row in rows {
            tables.edges.insert(row.id, row);
        }
        Ok(())
    }

    async fn update_edge(&self, row: RoleParent) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.edges.contains_key(&row.id) {
            return Err(AuthzError::EdgeNotFound(row.id));
        }
        tables.edges.insert(row.id, row);
        Ok(())
    }

    async fn delete_edges(&self, ids: &[Uuid]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for id in ids {
            tables.edges.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;

    fn policy(resource: &str, operation: &str) -> Policy {
        let op = Operation::parse(operation);
        Policy {
            id: PolicyId::new(),
            key: crate::types::policy_key(resource, &op),
            resource: resource.to_string(),
            operation: op,
            name: format!("{resource} {operation}"),
            description: None,
            metadata: Default::default(),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn policy_filter_excludes_deleted_by_default() {
        let store = MemoryStore::new();
        let live = policy("product", "read");
        let mut dead = policy("product", "write");
        dead.deleted_at = Some(Utc::now());
        let dead_id = dead.id;
        store.create_policies(vec![live.clone(), dead]).await.unwrap();

        let visible = store.policies(PolicyFilter::default()).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, live.id);

        let all = store.policies(PolicyFilter::include_deleted()).await.unwrap();
        assert_eq!(all.len(), 2);

        let by_key = store
            .policies(PolicyFilter::by_keys(vec!["product:write".into()], true))
            .await
            .unwrap();
        assert_eq!(by_key[0].id, dead_id);
    }

    #[tokio::test]
    async fn soft_delete_and_restore_keep_the_row() {
        let store = MemoryStore::new();
        let row = policy("order", "read");
        let id = row.id;
        store.create_policies(vec![row]).await.unwrap();

        store.soft_delete_policies(&[id], Utc::now()).await.unwrap();
        assert!(store.policy(id).await.unwrap().unwrap().is_deleted());

        store.restore_policies(&[id]).await.unwrap();
        assert!(!store.policy(id).await.unwrap().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn deleting_a_role_removes_its_associations() {
        let store = MemoryStore::new();
        let role = RoleId::new();
        let parent = RoleId::new();
        let pol = policy("product", "read");
        let pol_id = pol.id;
        store.create_policies(vec![pol]).await.unwrap();
        store
            .create_grants(vec![RolePolicy {
                id: Uuid::new_v4(),
                role_id: role,
                policy_id: pol_id,
                metadata: Default::default(),
                created_at: Utc::now(),
            }])
            .await
            .unwrap();
        store
            .create_edges(vec![RoleParent {
                id: Uuid::new_v4(),
                role_id: role,
                parent_id: parent,
                metadata: Default::default(),
                created_at: Utc::now(),
            }])
            .await
            .unwrap();

        store.delete_roles(&[role]).await.unwrap();
        assert!(store.grants_for_role(role).await.unwrap().is_empty());
        assert!(store.parents_of(role).await.unwrap().is_empty());
        // The policy row itself is untouched.
        assert!(store.policy(pol_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn upsert_converges_on_one_row_per_key() {
        let store = MemoryStore::new();

        // Two writers that both saw an empty store mint distinct ids for the
        // same key; the second upsert must land on the first writer's row.
        let first = policy("product", "read");
        let mut second = policy("product", "read");
        second.name = "second writer".to_string();
        assert_ne!(first.id, second.id);

        store.upsert_policies(vec![first.clone()]).await.unwrap();
        store.upsert_policies(vec![second]).await.unwrap();

        let rows = store
            .policies(PolicyFilter::by_keys(vec!["product:read".into()], true))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, first.id);
        assert_eq!(rows[0].created_at, first.created_at);
        assert_eq!(rows[0].name, "second writer");
    }

    #[tokio::test]
    async fn update_of_unknown_edge_is_an_error() {
        let store = MemoryStore::new();
        let row = RoleParent {
            id: Uuid::new_v4(),
            role_id: RoleId::new(),
            parent_id: RoleId::new(),
            metadata: Default::default(),
            created_at: Utc::now(),
        };
        let err = store.update_edge(row).await.unwrap_err();
        assert!(matches!(err, AuthzError::EdgeNotFound(_)));
    }
}
