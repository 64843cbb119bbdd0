//! Business Services
//!
//! The public API of the repository:
//!
//! - [`NodeService`] - node/association CRUD, hierarchy management,
//!   cascading delete, search entry points
//! - [`AclService`] - access control lists with primary-parent inheritance
//! - [`QueryBuilder`] - structured search predicates
//! - [`FullTextIndexer`] - optional external indexer seam
//!
//! Services coordinate the storage engine and the transactional caches;
//! they hold no durable state of their own.

pub mod acl_service;
pub mod indexer;
pub mod node_service;
pub mod query;

pub use acl_service::AclService;
pub use indexer::FullTextIndexer;
pub use node_service::NodeService;
pub use query::QueryBuilder;
