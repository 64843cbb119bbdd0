//! Full-Text Indexer Seam
//!
//! The repository can notify a plugged-in full-text engine so an external
//! index stays in sync with node mutations. The engine is optional and the
//! calls are fire-and-forget: a failing indexer is logged and never fails
//! the repository operation that triggered it.

use crate::models::Node;
use anyhow::Result;
use async_trait::async_trait;

/// Interface for plugged-in full-text search engines.
///
/// Implementations receive the id, a node snapshot where one is available,
/// and enough context to keep their index consistent. All methods tolerate
/// being invoked for ids they have never seen.
#[async_trait]
pub trait FullTextIndexer: Send + Sync {
    /// A node was created.
    async fn create(&self, id: &str, node: &Node) -> Result<()>;

    /// Several nodes were created in one batch.
    async fn create_bulk(&self, ids: &[String], nodes: &[Node]) -> Result<()>;

    /// A node's properties changed. With `delete_old` the given properties
    /// replace the indexed document, otherwise they merge into it.
    async fn update(&self, node: &Node, delete_old: bool) -> Result<()>;

    /// Bulk variant of [`update`](Self::update).
    async fn update_bulk(&self, nodes: &[Node], delete_old: bool) -> Result<()>;

    /// One property changed; `value` is `None` when removed or not textual.
    async fn update_property(&self, id: &str, name: &str, value: Option<&str>) -> Result<()>;

    /// A node was deleted.
    async fn remove(&self, id: &str) -> Result<()>;
}
