//! Node Service - Repository Orchestration
//!
//! The public node/association API. This layer owns no durable state; it
//! enforces argument and id-format validation, keeps the transactional
//! cache regions consistent around every storage engine call, implements
//! cascading deletion over the primary-parent tree, and notifies the
//! optional full-text indexer.
//!
//! # Cache regions
//!
//! - `nodes` - full node snapshots by id
//! - `children` - association lists by source node
//! - `parents` - association lists by target node
//! - `assoc_by_type` - association lists by type
//!
//! Every write path marks the affected keys changed *before* touching the
//! storage engine, so concurrent transactions fail fast instead of
//! repopulating the shared layer with data about to go stale. Read paths
//! populate on miss. Invalidation is per key and covers every node whose
//! visible state changed, including the former parent on move and delete.
//!
//! # Locking
//!
//! Single-node property mutations ride the storage engine's optimistic
//! modified check and can fail with a concurrency conflict - wrap calls in
//! [`crate::txn::run_in_txn`] to retry. The bulk variants
//! ([`update_properties_bulk`](NodeService::update_properties_bulk),
//! [`set_property_bulk`](NodeService::set_property_bulk)) skip locking by
//! design and are meant for migration-style writes.

use crate::cache::TransactionalCache;
use crate::db::RepositoryDao;
use crate::error::RepoError;
use crate::models::{guid, Assoc, Node, PropValue};
use crate::services::indexer::FullTextIndexer;
use crate::services::query::QueryBuilder;
use crate::txn::TxnContext;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const NODES_CACHE: &str = "nodes";
const CHILDREN_CACHE: &str = "children";
const PARENTS_CACHE: &str = "parents";
const ASSOC_CACHE: &str = "assoc_by_type";

/// Node and association operations over the storage engine, with
/// transactional caching and cascade semantics.
pub struct NodeService {
    dao: Arc<RepositoryDao>,
    indexer: Option<Arc<dyn FullTextIndexer>>,
    nodes: Arc<TransactionalCache<Node>>,
    children: Arc<TransactionalCache<Vec<Assoc>>>,
    parents: Arc<TransactionalCache<Vec<Assoc>>>,
    assoc_by_type: Arc<TransactionalCache<Vec<Assoc>>>,
}

impl NodeService {
    pub fn new(dao: Arc<RepositoryDao>) -> Self {
        Self {
            dao,
            indexer: None,
            nodes: TransactionalCache::new(NODES_CACHE),
            children: TransactionalCache::new(CHILDREN_CACHE),
            parents: TransactionalCache::new(PARENTS_CACHE),
            assoc_by_type: TransactionalCache::new(ASSOC_CACHE),
        }
    }

    /// Attach an optional full-text indexer to be notified of mutations.
    pub fn with_indexer(dao: Arc<RepositoryDao>, indexer: Arc<dyn FullTextIndexer>) -> Self {
        let mut service = Self::new(dao);
        service.indexer = Some(indexer);
        service
    }

    //
    // CREATE
    //

    /// Create a node, optionally under a primary parent. When both
    /// `parent_id` and `assoc_type` are given the primary-parent edge is
    /// also materialized as an association. Returns the node id.
    pub async fn create_node(
        &self,
        txn: &TxnContext,
        parent_id: Option<&str>,
        node: &Node,
        assoc_type: Option<&str>,
        assoc_name: Option<&str>,
    ) -> Result<String, RepoError> {
        check_node_id(node)?;
        if let Some(id) = &node.id {
            if self.exists(txn, id).await? {
                return Err(RepoError::invalid_argument(format!(
                    "node id already exists: {}",
                    id
                )));
            }
        }
        let id = self.dao.create_node(node, parent_id).await?;
        if let (Some(parent_id), Some(assoc_type)) = (parent_id, assoc_type) {
            self.dao
                .create_assoc(parent_id, &id, assoc_type, assoc_name)
                .await?;
            self.children.mark_created(txn, parent_id)?;
            self.assoc_by_type.mark_created(txn, assoc_type)?;
        }
        if let Some(indexer) = &self.indexer {
            if let Err(e) = indexer.create(&id, node).await {
                tracing::warn!(id = %id, error = %e, "indexer create failed");
            }
        }
        Ok(id)
    }

    /// Bulk creation inside one parent.
    pub async fn create_nodes(
        &self,
        txn: &TxnContext,
        parent_id: Option<&str>,
        nodes: &[Node],
        assoc_type: Option<&str>,
    ) -> Result<Vec<String>, RepoError> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        for node in nodes {
            check_node_id(node)?;
        }
        let provided: Vec<String> = nodes.iter().filter_map(|n| n.id.clone()).collect();
        if self.any_exists(txn, &provided).await? {
            return Err(RepoError::invalid_argument("node id already exists"));
        }
        let ids = self.dao.create_nodes(nodes, parent_id).await?;
        debug_assert_eq!(ids.len(), nodes.len());
        if let Some(parent_id) = parent_id {
            if let Some(assoc_type) = assoc_type {
                self.dao.create_assocs(parent_id, &ids, assoc_type).await?;
                self.assoc_by_type.mark_created(txn, assoc_type)?;
            }
            self.children.mark_created(txn, parent_id)?;
        }
        if let Some(indexer) = &self.indexer {
            if let Err(e) = indexer.create_bulk(&ids, nodes).await {
                tracing::warn!(error = %e, "indexer bulk create failed");
            }
        }
        Ok(ids)
    }

    /// Bulk creation across several parents, preserving the grouping in
    /// the returned map.
    pub async fn create_nodes_by_parent(
        &self,
        txn: &TxnContext,
        nodes_in_parent: &HashMap<String, Vec<Node>>,
        assoc_type: Option<&str>,
    ) -> Result<HashMap<String, Vec<String>>, RepoError> {
        let ids_by_parent = self.dao.create_nodes_by_parent(nodes_in_parent).await?;
        for (parent_id, ids) in &ids_by_parent {
            if let Some(assoc_type) = assoc_type {
                self.dao.create_assocs(parent_id, ids, assoc_type).await?;
            }
            if let Some(indexer) = &self.indexer {
                if let Some(nodes) = nodes_in_parent.get(parent_id) {
                    if let Err(e) = indexer.create_bulk(ids, nodes).await {
                        tracing::warn!(parent_id = %parent_id, error = %e, "indexer bulk create failed");
                    }
                }
            }
            self.children.mark_created(txn, parent_id)?;
        }
        if let Some(assoc_type) = assoc_type {
            self.assoc_by_type.mark_created(txn, assoc_type)?;
        }
        Ok(ids_by_parent)
    }

    //
    // PROPERTIES
    //

    /// Update a node's properties. With `delete_old` the given map replaces
    /// everything stored; otherwise it merges in. Rides the optimistic
    /// modified check.
    pub async fn update_properties(
        &self,
        txn: &TxnContext,
        updated: &Node,
        delete_old: bool,
    ) -> Result<(), RepoError> {
        let id = updated
            .id
            .as_deref()
            .ok_or_else(|| RepoError::invalid_argument("node id is missing"))?;
        self.nodes.remove(txn, id)?;
        self.dao.update_node(id, updated, delete_old).await?;
        if let Some(indexer) = &self.indexer {
            if let Err(e) = indexer.update(updated, delete_old).await {
                tracing::warn!(id = %id, error = %e, "indexer update failed");
            }
        }
        Ok(())
    }

    /// Bulk property update. No optimistic locking - intended for
    /// migration-style writes, callers coordinate externally.
    pub async fn update_properties_bulk(
        &self,
        txn: &TxnContext,
        nodes: &[Node],
        delete_old: bool,
    ) -> Result<(), RepoError> {
        if nodes.is_empty() {
            return Ok(());
        }
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            ids.push(
                node.id
                    .clone()
                    .ok_or_else(|| RepoError::invalid_argument("node id is missing"))?,
            );
        }
        let old = self.get_properties_bulk(txn, &ids).await?;
        self.dao.update_properties(nodes, &old, delete_old).await?;
        for id in &ids {
            self.nodes.remove(txn, id)?;
        }
        if let Some(indexer) = &self.indexer {
            if let Err(e) = indexer.update_bulk(nodes, delete_old).await {
                tracing::warn!(error = %e, "indexer bulk update failed");
            }
        }
        Ok(())
    }

    /// Set (add, update or remove) one property by name; `None` removes it.
    /// No-op when the stored value already matches. Rides the optimistic
    /// modified check when the node is cached.
    pub async fn set_property(
        &self,
        txn: &TxnContext,
        id: &str,
        name: &str,
        value: Option<PropValue>,
    ) -> Result<(), RepoError> {
        let old_value = self.get_property(txn, id, name).await?;
        if old_value == value {
            return Ok(());
        }
        let modified = self.nodes.get(txn, id).and_then(|cached| cached.modified);
        match &value {
            None => self.dao.remove_property(id, name, modified).await?,
            Some(value) => {
                self.dao
                    .set_property(id, name, modified, value, old_value.as_ref())
                    .await?
            }
        }
        self.nodes.remove(txn, id)?;
        if let Some(indexer) = &self.indexer {
            let text = value.as_ref().and_then(PropValue::as_str);
            if let Err(e) = indexer.update_property(id, name, text).await {
                tracing::warn!(id = %id, name = %name, error = %e, "indexer property update failed");
            }
        }
        Ok(())
    }

    /// Set one property across many nodes. No optimistic locking.
    pub async fn set_property_bulk(
        &self,
        txn: &TxnContext,
        ids: &[String],
        name: &str,
        value: Option<PropValue>,
    ) -> Result<(), RepoError> {
        if ids.is_empty() {
            return Ok(());
        }
        match &value {
            None => self.dao.remove_property_bulk(ids, name).await?,
            Some(v) => {
                if ids.len() == 1 {
                    return self.set_property(txn, &ids[0], name, value).await;
                }
                let old_values = self.get_property_bulk(txn, ids, name).await?;
                self.dao
                    .set_property_bulk(ids, name, v, &old_values)
                    .await?;
            }
        }
        for id in ids {
            self.nodes.remove(txn, id)?;
        }
        if let Some(indexer) = &self.indexer {
            let text = value.as_ref().and_then(PropValue::as_str);
            for id in ids {
                if let Err(e) = indexer.update_property(id, name, text).await {
                    tracing::warn!(id = %id, name = %name, error = %e, "indexer property update failed");
                }
            }
        }
        Ok(())
    }

    /// Remove one property by name. Rides the optimistic modified check
    /// when the node is cached.
    pub async fn remove_property(
        &self,
        txn: &TxnContext,
        id: &str,
        name: &str,
    ) -> Result<(), RepoError> {
        let modified = self.nodes.get(txn, id).and_then(|cached| cached.modified);
        self.dao.remove_property(id, name, modified).await?;
        self.nodes.remove(txn, id)?;
        if let Some(indexer) = &self.indexer {
            if let Err(e) = indexer.update_property(id, name, None).await {
                tracing::warn!(id = %id, name = %name, error = %e, "indexer property update failed");
            }
        }
        Ok(())
    }

    /// Get one named property, or `None`.
    pub async fn get_property(
        &self,
        txn: &TxnContext,
        id: &str,
        name: &str,
    ) -> Result<Option<PropValue>, RepoError> {
        match self.nodes.get(txn, id) {
            Some(cached) => Ok(cached.get(name).cloned()),
            None => self.dao.get_property(id, name).await,
        }
    }

    /// Get one named property across many nodes.
    pub async fn get_property_bulk(
        &self,
        txn: &TxnContext,
        ids: &[String],
        name: &str,
    ) -> Result<HashMap<String, PropValue>, RepoError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut result = HashMap::new();
        let mut uncached = Vec::new();
        for id in ids {
            match self.nodes.get(txn, id) {
                Some(cached) => {
                    if let Some(value) = cached.get(name) {
                        result.insert(id.clone(), value.clone());
                    }
                }
                None => uncached.push(id.clone()),
            }
        }
        if result.is_empty() {
            return self.dao.get_property_bulk(ids, name).await;
        }
        if !uncached.is_empty() {
            result.extend(self.dao.get_property_bulk(&uncached, name).await?);
        }
        Ok(result)
    }

    /// Get a node with all its properties, or `None`.
    pub async fn get_properties(
        &self,
        txn: &TxnContext,
        id: &str,
    ) -> Result<Option<Node>, RepoError> {
        if let Some(cached) = self.nodes.get(txn, id) {
            return Ok(Some(cached));
        }
        let node = self.dao.get_node(id).await?;
        if let Some(node) = &node {
            self.nodes.put_existing(txn, id, node.clone());
        }
        Ok(node)
    }

    /// Bulk node fetch, serving cached entries and loading the rest in one
    /// chunked query.
    pub async fn get_properties_bulk(
        &self,
        txn: &TxnContext,
        ids: &[String],
    ) -> Result<Vec<Node>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if ids.len() == 1 {
            return Ok(self.get_properties(txn, &ids[0]).await?.into_iter().collect());
        }
        let all: HashSet<&String> = ids.iter().collect();
        let mut cached = Vec::new();
        let mut uncached = Vec::new();
        for id in all {
            match self.nodes.get(txn, id) {
                Some(node) => cached.push(node),
                None => uncached.push(id.clone()),
            }
        }
        if uncached.is_empty() {
            return Ok(cached);
        }
        let loaded = self.dao.get_nodes(&uncached).await?;
        for node in &loaded {
            if let Some(id) = &node.id {
                self.nodes.put_existing(txn, id, node.clone());
            }
        }
        cached.extend(loaded);
        Ok(cached)
    }

    //
    // PRIMARY PARENT
    //

    pub async fn get_primary_parent(
        &self,
        txn: &TxnContext,
        id: &str,
    ) -> Result<Option<String>, RepoError> {
        match self.nodes.get(txn, id) {
            Some(cached) => Ok(cached.parent_id),
            None => self.dao.get_primary_parent(id).await,
        }
    }

    /// Bulk parent lookup; ids without a parent are absent from the map.
    pub async fn get_primary_parents(
        &self,
        txn: &TxnContext,
        ids: &[String],
    ) -> Result<HashMap<String, String>, RepoError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        if ids.len() == 1 {
            let id = &ids[0];
            return Ok(self
                .get_primary_parent(txn, id)
                .await?
                .map(|parent| HashMap::from([(id.clone(), parent)]))
                .unwrap_or_default());
        }
        let mut result = HashMap::new();
        let mut any_cached = false;
        let mut uncached = Vec::new();
        for id in ids {
            match self.nodes.get(txn, id) {
                Some(cached) => {
                    any_cached = true;
                    if let Some(parent) = cached.parent_id {
                        result.insert(id.clone(), parent);
                    }
                }
                None => uncached.push(id.clone()),
            }
        }
        if !any_cached {
            return self.dao.get_primary_parents(&uncached).await;
        }
        result.extend(self.dao.get_primary_parents(&uncached).await?);
        Ok(result)
    }

    //
    // ASSOCIATIONS
    //

    /// Associations where `parent` is the source, optionally filtered by
    /// type and/or name.
    pub async fn get_child_assocs(
        &self,
        txn: &TxnContext,
        parent: &str,
        assoc_type: Option<&str>,
        assoc_name: Option<&str>,
    ) -> Result<Vec<Assoc>, RepoError> {
        let assocs = self.child_assocs_cached(txn, parent).await?;
        Ok(filter_assocs(assocs, assoc_type, assoc_name))
    }

    /// Associations where `child` is the target, optionally filtered.
    pub async fn get_parent_assocs(
        &self,
        txn: &TxnContext,
        child: &str,
        assoc_type: Option<&str>,
        assoc_name: Option<&str>,
    ) -> Result<Vec<Assoc>, RepoError> {
        let assocs = match self.parents.get(txn, child) {
            Some(cached) => cached,
            None => {
                let loaded = self.dao.get_parent_assocs(child).await?;
                self.parents.put_existing(txn, child, loaded.clone());
                loaded
            }
        };
        Ok(filter_assocs(assocs, assoc_type, assoc_name))
    }

    /// Bulk variant of [`get_child_assocs`](Self::get_child_assocs).
    pub async fn get_child_assocs_bulk(
        &self,
        txn: &TxnContext,
        ids: &[String],
        assoc_type: Option<&str>,
        assoc_name: Option<&str>,
    ) -> Result<Vec<Assoc>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if ids.len() == 1 {
            return self
                .get_child_assocs(txn, &ids[0], assoc_type, assoc_name)
                .await;
        }
        let mut result = Vec::new();
        let mut uncached = Vec::new();
        for id in ids {
            match self.children.get(txn, id) {
                Some(cached) => result.extend(cached),
                None => uncached.push(id.clone()),
            }
        }
        if !uncached.is_empty() {
            let assocs = self.dao.get_child_assocs_bulk(&uncached).await?;
            if !assocs.is_empty() {
                let mut by_parent: HashMap<String, Vec<Assoc>> = HashMap::new();
                for assoc in &assocs {
                    by_parent
                        .entry(assoc.source.clone())
                        .or_default()
                        .push(assoc.clone());
                }
                for (parent, list) in by_parent {
                    self.children.put_existing(txn, &parent, list);
                }
            }
            result.extend(assocs);
        }
        Ok(filter_assocs(result, assoc_type, assoc_name))
    }

    /// Number of associations sourced at `id`. Cheap check for children.
    pub async fn count_all_child_assocs(
        &self,
        txn: &TxnContext,
        id: &str,
    ) -> Result<i64, RepoError> {
        if let Some(cached) = self.children.get(txn, id) {
            return Ok(cached.len() as i64);
        }
        self.dao.count_child_assocs(id, None, None).await
    }

    /// All associations of one type. Can return a lot of rows.
    pub async fn get_assocs_by_type(
        &self,
        txn: &TxnContext,
        assoc_type: &str,
    ) -> Result<Vec<Assoc>, RepoError> {
        if let Some(cached) = self.assoc_by_type.get(txn, assoc_type) {
            return Ok(cached);
        }
        let assocs = self.dao.get_assocs_by_type(assoc_type).await?;
        self.assoc_by_type
            .put_existing(txn, assoc_type, assocs.clone());
        Ok(assocs)
    }

    /// All associations touching `id` from either end.
    pub async fn get_all_assocs(
        &self,
        txn: &TxnContext,
        id: &str,
    ) -> Result<Vec<Assoc>, RepoError> {
        let cached_parents = self.parents.get(txn, id);
        let cached_children = self.children.get(txn, id);
        if cached_parents.is_none() && cached_children.is_none() {
            let all = self.dao.get_all_assocs(id).await?;
            let children: Vec<Assoc> = all.iter().filter(|a| a.source == id).cloned().collect();
            let parents: Vec<Assoc> = all.iter().filter(|a| a.target == id).cloned().collect();
            self.children.put_existing(txn, id, children);
            self.parents.put_existing(txn, id, parents);
            return Ok(all);
        }
        let parents = match cached_parents {
            Some(parents) => parents,
            None => {
                let loaded = self.dao.get_parent_assocs(id).await?;
                self.parents.put_existing(txn, id, loaded.clone());
                loaded
            }
        };
        let children = match cached_children {
            Some(children) => children,
            None => {
                let loaded = self.dao.get_child_assocs(id).await?;
                self.children.put_existing(txn, id, loaded.clone());
                loaded
            }
        };
        Ok(children.into_iter().chain(parents).collect())
    }

    /// Create an association between two nodes. With `check_if_exists` the
    /// insert is skipped when an edge of that type already links the pair,
    /// making the call idempotent.
    pub async fn add_child(
        &self,
        txn: &TxnContext,
        parent_id: &str,
        child_id: &str,
        assoc_type: &str,
        assoc_name: Option<&str>,
        check_if_exists: bool,
    ) -> Result<(), RepoError> {
        if !check_if_exists
            || self
                .dao
                .count_child_assocs(parent_id, Some(child_id), Some(assoc_type))
                .await?
                == 0
        {
            self.dao
                .create_assoc(parent_id, child_id, assoc_type, assoc_name)
                .await?;
            self.children.mark_created(txn, parent_id)?;
            self.parents.mark_created(txn, child_id)?;
            self.assoc_by_type.mark_created(txn, assoc_type)?;
        }
        Ok(())
    }

    //
    // DELETE / MOVE
    //

    /// Delete a node: every node whose primary-parent chain leads here goes
    /// with it, depth-first, together with all their associations and cache
    /// entries.
    pub async fn delete_node(&self, txn: &TxnContext, id: &str) -> Result<(), RepoError> {
        let parent = self.dao.get_primary_parent(id).await?;
        self.delete_subtree(txn, id, parent.as_deref()).await?;
        // deleted edges may be of any type, drop the whole region
        self.assoc_by_type.clear(txn);
        Ok(())
    }

    /// Delete one association. When it was the child's last association
    /// with its primary parent, the child itself is cascaded away.
    pub async fn delete_child(
        &self,
        txn: &TxnContext,
        parent_id: &str,
        child_id: &str,
        assoc_type: Option<&str>,
        assoc_name: Option<&str>,
    ) -> Result<(), RepoError> {
        self.dao
            .delete_assoc(Some(parent_id), Some(child_id), assoc_type, assoc_name)
            .await?;
        let primary = self.dao.get_primary_parent(child_id).await?;
        if primary.as_deref() == Some(parent_id)
            && self
                .dao
                .count_child_assocs(parent_id, Some(child_id), None)
                .await?
                == 0
        {
            self.delete_subtree(txn, child_id, primary.as_deref()).await?;
        }
        self.parents.remove(txn, child_id)?;
        if let Some(assoc_type) = assoc_type {
            self.assoc_by_type.remove(txn, assoc_type)?;
        }
        self.children.remove(txn, parent_id)?;
        Ok(())
    }

    /// Change a node's primary parent. With an association type the edge is
    /// re-pointed too: created under the new parent, deleted under the old.
    pub async fn move_node(
        &self,
        txn: &TxnContext,
        id: &str,
        to: Option<&str>,
        assoc_type: Option<&str>,
        assoc_name: Option<&str>,
    ) -> Result<(), RepoError> {
        let from = self.get_primary_parent(txn, id).await?;
        self.dao.set_primary_parent(id, to).await?;
        if let Some(assoc_type) = assoc_type {
            if let Some(to) = to {
                self.dao.create_assoc(to, id, assoc_type, assoc_name).await?;
            }
            self.dao
                .delete_assoc(from.as_deref(), Some(id), Some(assoc_type), assoc_name)
                .await?;
        }
        self.nodes.remove(txn, id)?;
        if let Some(from) = &from {
            self.children.remove(txn, from)?;
        }
        if let Some(to) = to {
            self.children.remove(txn, to)?;
        }
        self.parents.remove(txn, id)?;
        if let Some(assoc_type) = assoc_type {
            self.assoc_by_type.remove(txn, assoc_type)?;
        }
        Ok(())
    }

    /// Whether a node with that id exists. Faster than fetching it.
    pub async fn exists(&self, txn: &TxnContext, id: &str) -> Result<bool, RepoError> {
        if !guid::is_valid(id) {
            return Ok(false);
        }
        if self.nodes.is_cached(txn, id) {
            return Ok(true);
        }
        self.dao.exists(id).await
    }

    //
    // SEARCH
    //

    /// Search live nodes by type set and property name/value. A `*` in a
    /// string value searches with LIKE.
    pub async fn search(
        &self,
        types: Option<&[String]>,
        prop_name: Option<&str>,
        prop_value: Option<&PropValue>,
    ) -> Result<Vec<String>, RepoError> {
        self.dao.query_ids(types, prop_name, prop_value).await
    }

    /// Search version (historical snapshot) nodes, which normal search
    /// skips.
    pub async fn get_versions(
        &self,
        node_type: Option<&str>,
        prop_name: Option<&str>,
        prop_value: Option<&PropValue>,
    ) -> Result<Vec<String>, RepoError> {
        let types: Option<Vec<String>> = node_type.map(|t| vec![t.to_string()]);
        self.dao
            .query_version_ids(types.as_deref(), prop_name, prop_value)
            .await
    }

    /// Search with a structured predicate.
    pub async fn search_query(&self, query: &QueryBuilder) -> Result<Vec<String>, RepoError> {
        self.search_with(query, None, -1).await
    }

    /// Search with a structured predicate, optionally restricted to nodes
    /// under the given primary parents and capped at `limit` results
    /// (non-positive means unlimited).
    pub async fn search_with(
        &self,
        query: &QueryBuilder,
        primary_parents: Option<&[String]>,
        limit: i64,
    ) -> Result<Vec<String>, RepoError> {
        self.dao
            .query_by_parents(&query.build(), primary_parents, limit)
            .await
    }

    /// Count live nodes matching a structured predicate.
    pub async fn count(&self, query: &QueryBuilder) -> Result<i64, RepoError> {
        self.dao.query_count(&query.build()).await
    }

    /// Wipe the repository. Test/tooling hook.
    pub async fn clear(&self) -> Result<(), RepoError> {
        self.dao.clear().await
    }

    //
    // INTERNAL
    //

    async fn any_exists(&self, txn: &TxnContext, ids: &[String]) -> Result<bool, RepoError> {
        for id in ids {
            if guid::is_valid(id) && self.nodes.is_cached(txn, id) {
                return Ok(true);
            }
        }
        self.dao.exists_any(ids).await
    }

    async fn child_assocs_cached(
        &self,
        txn: &TxnContext,
        id: &str,
    ) -> Result<Vec<Assoc>, RepoError> {
        if let Some(cached) = self.children.get(txn, id) {
            return Ok(cached);
        }
        let assocs = self.dao.get_child_assocs(id).await?;
        self.children.put_existing(txn, id, assocs.clone());
        Ok(assocs)
    }

    /// Iterative cascade: walk the primary-parent tree breadth-first with a
    /// visited guard (a cycle in the parent chain is data corruption and
    /// fails the operation), then delete leaf levels before their parents.
    async fn delete_subtree(
        &self,
        txn: &TxnContext,
        id: &str,
        parent_id: Option<&str>,
    ) -> Result<(), RepoError> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(id.to_string());
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut frontier = vec![id.to_string()];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for node_id in &frontier {
                for child in self.dao.get_by_primary_parent(node_id).await? {
                    if !visited.insert(child.clone()) {
                        return Err(RepoError::invalid_argument(format!(
                            "primary parent cycle detected at {}",
                            child
                        )));
                    }
                    next.push(child);
                }
            }
            levels.push(frontier);
            frontier = next;
        }

        for level in levels.iter().rev() {
            for node_id in level {
                self.nodes.remove(txn, node_id)?;
                self.children.remove(txn, node_id)?;
                self.parents.remove(txn, node_id)?;
                self.dao.delete_all_assocs(node_id).await?;
                if let Some(indexer) = &self.indexer {
                    if let Err(e) = indexer.remove(node_id).await {
                        tracing::warn!(id = %node_id, error = %e, "indexer remove failed");
                    }
                }
            }
        }
        // descendants level by level, deepest first, then the root itself
        for level in levels[1..].iter().rev() {
            self.dao.delete_nodes(level).await?;
        }
        if let Some(parent_id) = parent_id {
            self.children.remove(txn, parent_id)?;
        }
        self.dao.delete_node(id).await?;
        Ok(())
    }
}

fn check_node_id(node: &Node) -> Result<(), RepoError> {
    if let Some(id) = &node.id {
        if !guid::is_valid(id) {
            return Err(RepoError::invalid_argument(format!(
                "node id must be a GUID: {}",
                id
            )));
        }
    }
    Ok(())
}

fn filter_assocs(
    assocs: Vec<Assoc>,
    assoc_type: Option<&str>,
    assoc_name: Option<&str>,
) -> Vec<Assoc> {
    if assoc_type.is_none() && assoc_name.is_none() {
        return assocs;
    }
    assocs
        .into_iter()
        .filter(|a| {
            assoc_type.map_or(true, |t| a.assoc_type == t)
                && assoc_name.map_or(true, |n| a.name.as_deref() == Some(n))
        })
        .collect()
}
