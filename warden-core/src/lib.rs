//! Role-based access control core.
//!
//! This crate answers one question, "may this set of roles perform these
//! operations on these resources?", and owns everything that question
//! depends on: the role/policy data model, role inheritance over an acyclic
//! parent graph, code-declared policy registration synced into the store at
//! startup, and a tag-invalidated cache of resolved grants.
//!
//! It is a library-level component: no HTTP routes, no CLI. Persistence is
//! behind the [`store::RbacStore`] trait; [`store::MemoryStore`] backs tests
//! and single-process embedders.

pub mod cache;
pub mod errors;
pub mod hierarchy;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod settings;
pub mod store;
pub mod sync;
pub mod types;
pub mod utils;


// Re-export the main types and service for easy access
pub use errors::{AuthzError, Result};
pub use registry::{PolicyDeclaration, PolicyRegistry};
pub use service::AuthorizationService;
pub use settings::AuthzSettings;
pub use store::{MemoryStore, PolicyFilter, RbacStore};
pub use sync::SyncReport;
pub use types::{
    Action, GrantMap, GrantUpdate, NewPolicy, NewRole, Operation, Policy, PolicyId, PolicyUpdate,
    Role, RoleId, RoleParent, RolePolicy, RoleUpdate,
};
