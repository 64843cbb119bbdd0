//! Strata Core - Schema-less Document/Graph Repository
//!
//! A property-graph abstraction over an embedded relational store: entities
//! ("nodes") with typed properties, directed typed associations, a
//! primary-parent tree driving cascading deletion and ACL inheritance, and
//! an access-control layer - all kept consistent by a transaction-scoped
//! two-level cache and per-node optimistic locking.
//!
//! # Architecture
//!
//! - **Four relations**: `nodes`, `node_props`, `node_assocs`, `node_aces`
//!   over libsql/SQLite; the storage engine is their sole reader/writer
//! - **Dual-slot values**: every property value lands in a (type tag,
//!   string slot, numeric slot) row; multi-valued properties take one row
//!   per element
//! - **Optimistic locking**: single-node updates are gated on an unchanged
//!   modified timestamp and fail with a retryable conflict otherwise
//! - **L1/L2 caching**: a transaction-local overlay over a process-wide
//!   shared cache, with changed-id bookkeeping that evicts on commit and
//!   fails second writers fast
//!
//! # Modules
//!
//! - [`models`] - data objects (`Node`, `PropValue`, `Assoc`, `Ace`, guids)
//! - [`db`] - connection management, schema bootstrap, storage engine
//! - [`cache`] - the transactional two-level cache
//! - [`txn`] - explicit transaction-scope handle and the retry helper
//! - [`services`] - `NodeService`, `AclService`, query builder, indexer seam
//! - [`error`] - the `RepoError` taxonomy
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use strata_core::db::{DatabaseService, RepositoryDao};
//! use strata_core::models::{Node, PropValue};
//! use strata_core::services::NodeService;
//! use strata_core::txn::TxnContext;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Arc::new(DatabaseService::new(PathBuf::from("./data/strata.db")).await?);
//!     let service = NodeService::new(Arc::new(RepositoryDao::new(db)));
//!
//!     let txn = TxnContext::read_write();
//!     let mut node = Node::new("document");
//!     node.put("title", PropValue::from("hello"));
//!     let id = service.create_node(&txn, None, &node, None, None).await?;
//!     txn.commit();
//!     println!("created {id}");
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod txn;

// Re-export commonly used types
pub use error::RepoError;
pub use models::{Ace, Assoc, Node, PropValue};
pub use services::{AclService, FullTextIndexer, NodeService, QueryBuilder};
