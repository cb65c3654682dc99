//! Startup reconciliation of code-declared policies into the store.
//!
//! The registry holds desired state; the store holds actual state keyed by
//! canonical policy key. Reconciliation creates what is missing, restores
//! soft-deleted rows whose declaration reappeared (preserving their id and
//! with it every role association), updates drifted metadata and
//! soft-deletes rows no longer declared. Re-running with an unchanged
//! registry is a no-op.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, warn};

use crate::errors::Result;
use crate::registry::PolicyRegistry;
use crate::store::{PolicyFilter, RbacStore};
use crate::types::{policy_key, Operation, Policy, PolicyId};
use crate::utils::snake_case;

/// Counts of writes performed by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub restored: usize,
    pub removed: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        *self == SyncReport::default()
    }
}

/// Diff the registry against the store and apply the batched changes.
pub async fn reconcile(registry: &PolicyRegistry, store: &dyn RbacStore) -> Result<SyncReport> {
    let mut declarations = registry.all().await;
    // Deterministic fold order, so a key collision always resolves to the
    // same declaration no matter how the registry iterates.
    declarations.sort_by(|a, b| a.name.cmp(&b.name));

    // Desired state, keyed by canonical key. Two declarations normalizing to
    // the same key collapse into one row (last name in sort order wins); the
    // collision is worth a warning.
    let mut desired: HashMap<String, _> = HashMap::new();
    for declaration in declarations {
        let key = declaration.key();
        if let Some(previous) = desired.insert(key.clone(), declaration) {
            warn!(
                "Policy declarations '{}' and '{}' both normalize to key `{key}`",
                previous.name, desired[&key].name
            );
        }
    }

    // Actual state, including soft-deleted rows: restoration must win over
    // creation when a key reappears.
    let existing = store.policies(PolicyFilter::include_deleted()).await?;
    let mut by_key: HashMap<String, Policy> = HashMap::new();
    for row in existing {
        match by_key.get(&row.key) {
            // Prefer the live row when both a live and a deleted row carry
            // the key (possible only through out-of-band writes).
            Some(current) if !current.is_deleted() => {}
            _ => {
                by_key.insert(row.key.clone(), row);
            }
        }
    }

    let now = Utc::now();
    let mut to_create: Vec<Policy> = Vec::new();
    let mut to_update: Vec<Policy> = Vec::new();
    let mut report = SyncReport::default();

    for (key, declaration) in &desired {
        match by_key.get(key) {
            None => {
                let resource = snake_case(&declaration.resource);
                let operation = Operation::parse(&declaration.operation);
                to_create.push(Policy {
                    id: PolicyId::new(),
                    key: policy_key(&resource, &operation),
                    resource,
                    operation,
                    name: declaration.name.clone(),
                    description: declaration.description.clone(),
                    metadata: Default::default(),
                    created_at: now,
                    deleted_at: None,
                });
                report.created += 1;
            }
            Some(row) => {
                let drifted = row.name != declaration.name
                    || row.description != declaration.description;
                if row.is_deleted() {
                    // Same row, same id: associations referencing it revive.
                    let mut restored = row.clone();
                    restored.deleted_at = None;
                    restored.name = declaration.name.clone();
                    restored.description = declaration.description.clone();
                    to_update.push(restored);
                    report.restored += 1;
                } else if drifted {
                    let mut updated = row.clone();
                    updated.name = declaration.name.clone();
                    updated.description = declaration.description.clone();
                    to_update.push(updated);
                    report.updated += 1;
                }
            }
        }
    }

    // Live rows whose key is no longer declared get soft-deleted.
    let to_remove: Vec<PolicyId> = by_key
        .values()
        .filter(|row| !row.is_deleted() && !desired.contains_key(&row.key))
        .map(|row| row.id)
        .collect();
    report.removed = to_remove.len();

    // Upsert keyed by `key`: a concurrent reconcile from another process may
    // have inserted a row for the same key since the read above, and two
    // blind inserts would leave duplicate live keys.
    if !to_create.is_empty() {
        store.upsert_policies(to_create).await?;
    }
    if !to_update.is_empty() {
        store.update_policies(to_update).await?;
    }
    if !to_remove.is_empty() {
        store.soft_delete_policies(&to_remove, now).await?;
    }

    if report.is_noop() {
        info!("Policy registry in sync, nothing to do");
    } else {
        info!(
            "Policy registry synced: {} created, {} updated, {} restored, {} removed",
            report.created, report.updated, report.restored, report.removed
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PolicyDeclaration;
    use crate::store::MemoryStore;

    fn decl(name: &str, resource: &str, operation: &str) -> PolicyDeclaration {
        PolicyDeclaration {
            name: name.to_string(),
            resource: resource.to_string(),
            operation: operation.to_string(),
            description: None,
        }
    }

    async fn setup(decls: Vec<PolicyDeclaration>) -> (PolicyRegistry, MemoryStore) {
        let registry = PolicyRegistry::new();
        for d in decls {
            registry.declare(d).await;
        }
        (registry, MemoryStore::new())
    }

    #[tokio::test]
    async fn creates_missing_policies() {
        let (registry, store) = setup(vec![
            decl("read products", "product", "read"),
            decl("write products", "product", "write"),
        ])
        .await;

        let report = reconcile(&registry, &store).await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(store.policies(PolicyFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_run_is_a_noop() {
        let (registry, store) = setup(vec![decl("read products", "product", "read")]).await;
        reconcile(&registry, &store).await.unwrap();
        let report = reconcile(&registry, &store).await.unwrap();
        assert!(report.is_noop());
    }

    #[tokio::test]
    async fn undeclared_policies_are_soft_deleted() {
        let (registry, store) = setup(vec![
            decl("read products", "product", "read"),
            decl("write products", "product", "write"),
        ])
        .await;
        reconcile(&registry, &store).await.unwrap();

        registry.clear().await;
        registry.declare(decl("read products", "product", "read")).await;
        let report = reconcile(&registry, &store).await.unwrap();
        assert_eq!(report.removed, 1);

        let live = store.policies(PolicyFilter::default()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key, "product:read");
        // The undeclared row still exists, soft-deleted.
        let all = store.policies(PolicyFilter::include_deleted()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn redeclared_policy_restores_the_original_row() {
        let (registry, store) = setup(vec![decl("read products", "product", "read")]).await;
        reconcile(&registry, &store).await.unwrap();
        let original = &store.policies(PolicyFilter::default()).await.unwrap()[0];
        let original_id = original.id;

        registry.clear().await;
        reconcile(&registry, &store).await.unwrap();
        assert!(store.policies(PolicyFilter::default()).await.unwrap().is_empty());

        registry.declare(decl("read products v2", "product", "read")).await;
        let report = reconcile(&registry, &store).await.unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.created, 0);

        let live = store.policies(PolicyFilter::default()).await.unwrap();
        assert_eq!(live.len(), 1);
        // Identity preserved, metadata refreshed in the same pass.
        assert_eq!(live[0].id, original_id);
        assert_eq!(live[0].name, "read products v2");
    }

    #[tokio::test]
    async fn drifted_name_and_description_are_updated_in_place() {
        let (registry, store) = setup(vec![decl("old name", "product", "read")]).await;
        reconcile(&registry, &store).await.unwrap();
        let original_id = store.policies(PolicyFilter::default()).await.unwrap()[0].id;

        registry.clear().await;
        registry
            .declare(PolicyDeclaration {
                name: "new name".into(),
                resource: "product".into(),
                operation: "read".into(),
                description: Some("now documented".into()),
            })
            .await;
        let report = reconcile(&registry, &store).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 0);

        let live = store.policies(PolicyFilter::default()).await.unwrap();
        assert_eq!(live[0].id, original_id);
        assert_eq!(live[0].name, "new name");
        assert_eq!(live[0].description.as_deref(), Some("now documented"));
    }

    #[tokio::test]
    async fn declaration_keys_are_normalized_before_diffing() {
        let (registry, store) = setup(vec![decl("read", "Product Catalog", "Read")]).await;
        reconcile(&registry, &store).await.unwrap();

        let live = store.policies(PolicyFilter::default()).await.unwrap();
        assert_eq!(live[0].key, "product_catalog:read");

        // Re-declaring with different casing hits the same key: no-op.
        registry.clear().await;
        registry.declare(decl("read", "product-catalog", "READ")).await;
        let report = reconcile(&registry, &store).await.unwrap();
        assert!(report.is_noop());
    }

    #[tokio::test]
    async fn racing_reconciles_converge_on_one_row_per_key() {
        let (registry, store) = setup(vec![decl("read products", "product", "read")]).await;
        reconcile(&registry, &store).await.unwrap();
        let original_id = store.policies(PolicyFilter::default()).await.unwrap()[0].id;

        // A second instance that read the store before our create landed
        // writes its own freshly-minted row for the same key.
        let racer = Policy {
            id: PolicyId::new(),
            key: "product:read".into(),
            resource: "product".into(),
            operation: Operation::parse("read"),
            name: "read products".into(),
            description: None,
            metadata: Default::default(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        store.upsert_policies(vec![racer]).await.unwrap();

        let all = store.policies(PolicyFilter::include_deleted()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, original_id);
        // Converged state needs no further writes.
        assert!(reconcile(&registry, &store).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn colliding_declarations_resolve_deterministically() {
        // Both normalize to product:read; the fold is sorted by name, so
        // "b wins" survives regardless of registry iteration order.
        let (registry, store) = setup(vec![
            decl("a loses", "Product", "Read"),
            decl("b wins", "product", "read"),
        ])
        .await;
        reconcile(&registry, &store).await.unwrap();

        let live = store.policies(PolicyFilter::default()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "b wins");
        assert!(reconcile(&registry, &store).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn empty_registry_removes_everything_once() {
        let (registry, store) = setup(vec![
            decl("a", "product", "read"),
            decl("b", "order", "read"),
        ])
        .await;
        reconcile(&registry, &store).await.unwrap();

        registry.clear().await;
        let report = reconcile(&registry, &store).await.unwrap();
        assert_eq!(report.removed, 2);
        // Deleted rows are not deleted again.
        let report = reconcile(&registry, &store).await.unwrap();
        assert!(report.is_noop());
    }
}
