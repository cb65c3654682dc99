use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{policy_key, Operation};
use crate::utils::snake_case;

/// A code-declared policy: the desired state fed to the registry
/// synchronizer. Not persisted itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDeclaration {
    pub name: String,
    pub resource: String,
    pub operation: String,
    pub description: Option<String>,
}

impl PolicyDeclaration {
    /// Canonical key of the declared policy, with resource and operation
    /// normalized to snake case.
    pub fn key(&self) -> String {
        policy_key(&snake_case(&self.resource), &Operation::parse(&self.operation))
    }
}

/// In-process table of policy declarations, keyed by declaration name.
///
/// Application modules declare their policies at load time; the synchronizer
/// reconciles the table into the store on startup. Explicitly injectable
/// rather than a process global so tests can reset it deterministically.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    declarations: RwLock<HashMap<String, PolicyDeclaration>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declaration. Re-declaring a name replaces the previous
    /// declaration for that name.
    pub async fn declare(&self, declaration: PolicyDeclaration) {
        debug!(
            "Declaring policy '{}' ({})",
            declaration.name,
            declaration.key()
        );
        self.declarations
            .write()
            .await
            .insert(declaration.name.clone(), declaration);
    }

    /// Snapshot of all current declarations.
    pub async fn all(&self) -> Vec<PolicyDeclaration> {
        self.declarations.read().await.values().cloned().collect()
    }

    /// Drop every declaration. Test harnesses call this between cases.
    pub async fn clear(&self) {
        self.declarations.write().await.clear();
    }

    pub async fn is_empty(&self) -> bool {
        self.declarations.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, resource: &str, operation: &str) -> PolicyDeclaration {
        PolicyDeclaration {
            name: name.to_string(),
            resource: resource.to_string(),
            operation: operation.to_string(),
            description: None,
        }
    }

    #[tokio::test]
    async fn declare_and_clear() {
        let registry = PolicyRegistry::new();
        assert!(registry.is_empty().await);

        registry.declare(decl("read-products", "product", "read")).await;
        registry.declare(decl("write-products", "product", "write")).await;
        assert_eq!(registry.all().await.len(), 2);

        registry.clear().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn redeclaring_a_name_replaces_it() {
        let registry = PolicyRegistry::new();
        registry.declare(decl("manage", "product", "read")).await;
        registry.declare(decl("manage", "product", "write")).await;

        let all = registry.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key(), "product:write");
    }

    #[test]
    fn declaration_key_is_normalized() {
        assert_eq!(decl("p", "Product Catalog", "Read").key(), "product_catalog:read");
        assert_eq!(decl("p", "order", "*").key(), "order:*");
    }
}
