//! Repository Storage Engine
//!
//! `RepositoryDao` is the sole reader/writer of the four backing relations.
//! It executes node, property and association CRUD, batches bulk operations
//! in `BATCH_SIZE` chunks, and enforces optimistic locking through the
//! node's modified timestamp.
//!
//! # Optimistic updates
//!
//! Every property-mutating operation on a single node finishes with a
//! conditional `update nodes set modified = now where id = ? and
//! modified = ?`. Zero affected rows means a concurrent writer got there
//! first and the operation fails with
//! [`RepoError::ConcurrencyConflict`](crate::error::RepoError) - never
//! retried here, see [`crate::txn::run_in_txn`]. Bulk multi-node property
//! writes deliberately skip the check (migration-style writes, racy by
//! design).
//!
//! # Differential property updates
//!
//! Updates diff the new property map against the stored one per name:
//! unchanged values produce no writes, changed scalars update in place, and
//! list-to-list changes insert only newly-appearing elements and delete only
//! removed ones.

use crate::db::codec;
use crate::db::error::DatabaseError;
use crate::db::sql::{self, batch_execute, opt_int, opt_text, partition, SqlQuery};
use crate::db::DatabaseService;
use crate::error::RepoError;
use crate::models::{guid, Assoc, Node, PropValue};
use chrono::{DateTime, Utc};
use libsql::{Connection, Row, Rows, Value};
use std::collections::HashMap;
use std::sync::Arc;

const NODE_SELECT: &str = "select n.id, n.modified, n.parent_id, n.class, n.version, \
                           p.name, p.type, p.value_s, p.value_n \
                           from nodes n left join node_props p on p.node_id = n.id";

const INSERT_NODE: &str =
    "insert into nodes (id, modified, parent_id, class, version) values (?, ?, ?, ?, ?)";
const INSERT_PROP: &str =
    "insert into node_props (node_id, name, type, value_s, value_n) values (?, ?, ?, ?, ?)";
const UPDATE_PROP: &str =
    "update node_props set value_s = ?, value_n = ? where node_id = ? and name = ?";
const DELETE_PROP: &str = "delete from node_props where node_id = ? and name = ?";
const DELETE_PROP_VALUE: &str =
    "delete from node_props where node_id = ? and name = ? and (value_s = ? or value_n = ?)";
const INSERT_ASSOC: &str =
    "insert into node_assocs (type, name, source, target) values (?, ?, ?, ?)";

/// Property writes accumulated while diffing, applied as four statement
/// shapes.
#[derive(Default)]
struct PropBatches {
    /// (node_id, name, signed type, value_s, value_n)
    inserts: Vec<Vec<Value>>,
    /// (value_s, value_n, node_id, name)
    updates: Vec<Vec<Value>>,
    /// (node_id, name)
    deletes: Vec<Vec<Value>>,
    /// (node_id, name, value_s, value_n)
    delete_values: Vec<Vec<Value>>,
}

impl PropBatches {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.delete_values.is_empty()
    }
}

/// Storage engine over the four backing relations.
pub struct RepositoryDao {
    db: Arc<DatabaseService>,
}

impl RepositoryDao {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    async fn conn(&self) -> Result<Connection, RepoError> {
        Ok(self.db.connect_with_timeout().await?)
    }

    //
    // NODE CRUD
    //

    /// Insert a node row plus its property rows. Returns the node id,
    /// generating one if the caller did not supply it.
    pub async fn create_node(
        &self,
        node: &Node,
        parent_id: Option<&str>,
    ) -> Result<String, RepoError> {
        let conn = self.conn().await?;
        let id = node.id.clone().unwrap_or_else(guid::generate);
        sql::timed(
            INSERT_NODE,
            conn.execute(
                INSERT_NODE,
                (
                    id.as_str(),
                    Utc::now().timestamp_millis(),
                    parent_id,
                    node.node_type.as_deref(),
                    if node.version { Some("T") } else { None },
                ),
            ),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to insert node: {}", e)))?;

        let mut batches = PropBatches::default();
        for (name, value) in &node.properties {
            push_insert(&mut batches, &id, name, value, false)?;
        }
        batch_execute(&conn, INSERT_PROP, batches.inserts).await?;

        Ok(id)
    }

    /// Bulk insert under one parent, preserving input order of ids.
    pub async fn create_nodes(
        &self,
        nodes: &[Node],
        parent_id: Option<&str>,
    ) -> Result<Vec<String>, RepoError> {
        let conn = self.conn().await?;
        let mut node_batch = Vec::with_capacity(nodes.len());
        let mut batches = PropBatches::default();
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            ids.push(fill_batch(node, parent_id, &mut node_batch, &mut batches)?);
        }
        batch_execute(&conn, INSERT_NODE, node_batch).await?;
        batch_execute(&conn, INSERT_PROP, batches.inserts).await?;
        Ok(ids)
    }

    /// Bulk insert across several parents, preserving the per-parent
    /// grouping in the returned map.
    pub async fn create_nodes_by_parent(
        &self,
        nodes_in_parent: &HashMap<String, Vec<Node>>,
    ) -> Result<HashMap<String, Vec<String>>, RepoError> {
        let conn = self.conn().await?;
        let mut node_batch = Vec::new();
        let mut batches = PropBatches::default();
        let mut result = HashMap::new();
        for (parent_id, nodes) in nodes_in_parent {
            let mut ids = Vec::with_capacity(nodes.len());
            for node in nodes {
                ids.push(fill_batch(
                    node,
                    Some(parent_id.as_str()),
                    &mut node_batch,
                    &mut batches,
                )?);
            }
            result.insert(parent_id.clone(), ids);
        }
        batch_execute(&conn, INSERT_NODE, node_batch).await?;
        batch_execute(&conn, INSERT_PROP, batches.inserts).await?;
        Ok(result)
    }

    pub async fn exists(&self, id: &str) -> Result<bool, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new("select count(id) from nodes")
            .filter_eq("id", id)
            .query(&conn)
            .await?;
        Ok(fetch_count(&mut rows).await? > 0)
    }

    /// Whether any of the given ids exists.
    pub async fn exists_any(&self, ids: &[String]) -> Result<bool, RepoError> {
        if ids.is_empty() {
            return Ok(false);
        }
        let conn = self.conn().await?;
        for chunk in partition(ids) {
            let mut rows = SqlQuery::new("select count(id) from nodes")
                .filter_in("id", chunk)
                .query(&conn)
                .await?;
            if fetch_count(&mut rows).await? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fetch one node with all its properties. Version nodes are returned
    /// too - update paths need to see them to reject the mutation.
    pub async fn get_node(&self, id: &str) -> Result<Option<Node>, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new(NODE_SELECT)
            .filter_eq("n.id", id)
            .query(&conn)
            .await?;
        let mut result: HashMap<String, Node> = HashMap::new();
        while let Some(row) = next_row(&mut rows).await? {
            extract_node(&row, &mut result)?;
        }
        Ok(result.into_values().next())
    }

    /// Bulk fetch nodes with properties, chunked over the id set.
    pub async fn get_nodes(&self, ids: &[String]) -> Result<Vec<Node>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        let mut result: HashMap<String, Node> = HashMap::new();
        for chunk in partition(ids) {
            let mut rows = SqlQuery::new(NODE_SELECT)
                .filter_in("n.id", chunk)
                .query(&conn)
                .await?;
            while let Some(row) = next_row(&mut rows).await? {
                extract_node(&row, &mut result)?;
            }
        }
        Ok(result.into_values().collect())
    }

    /// Update a node's type and properties, diffing against the stored
    /// state. With `delete_old` every stored property absent from `node` is
    /// removed as well. Finishes with the optimistic modified check.
    pub async fn update_node(
        &self,
        id: &str,
        node: &Node,
        delete_old: bool,
    ) -> Result<(), RepoError> {
        let old = self
            .get_node(id)
            .await?
            .ok_or_else(|| RepoError::not_found(id))?;
        if old.version {
            return Err(RepoError::immutable(id));
        }
        let conn = self.conn().await?;
        if let Some(node_type) = &node.node_type {
            if old.node_type.as_ref() != Some(node_type) {
                sql::timed(
                    "update nodes set class = ?",
                    conn.execute(
                        "update nodes set class = ? where id = ?",
                        (node_type.as_str(), id),
                    ),
                )
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!("Failed to update node class: {}", e))
                })?;
            }
        }
        if old.has_properties() {
            let mut batches = PropBatches::default();
            let mut old_props = old.properties.clone();
            for (name, value) in &node.properties {
                let old_value = old_props.remove(name);
                diff_property(&mut batches, id, name, value, old_value.as_ref())?;
            }
            if delete_old {
                for name in old_props.keys() {
                    batches
                        .deletes
                        .push(vec![text(id), text(name)]);
                }
            }
            let changed = !batches.is_empty();
            apply_batches(&conn, batches).await?;
            if changed {
                self.set_modified(&conn, id, old.modified).await?;
            }
        } else {
            let mut batches = PropBatches::default();
            for (name, value) in &node.properties {
                push_insert(&mut batches, id, name, value, false)?;
            }
            batch_execute(&conn, INSERT_PROP, batches.inserts).await?;
            self.set_modified(&conn, id, old.modified).await?;
        }
        Ok(())
    }

    /// Bulk property update across several nodes. Skips the optimistic
    /// check entirely: intended for migration-style writes, the last writer
    /// wins and external coordination is the caller's problem.
    pub async fn update_properties(
        &self,
        nodes: &[Node],
        old_nodes: &[Node],
        delete_old: bool,
    ) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        let mut batches = PropBatches::default();
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            let id = node
                .id
                .as_deref()
                .ok_or_else(|| RepoError::invalid_argument("node id is missing"))?;
            ids.push(id.to_string());
            let old = old_nodes
                .iter()
                .find(|n| n.id.as_deref() == Some(id))
                .ok_or_else(|| RepoError::not_found(id))?;
            if old.version {
                return Err(RepoError::immutable(id));
            }
            if old.has_properties() {
                let mut old_props = old.properties.clone();
                for (name, value) in &node.properties {
                    let old_value = old_props.remove(name);
                    diff_property(&mut batches, id, name, value, old_value.as_ref())?;
                }
                if delete_old {
                    for name in old_props.keys() {
                        batches.deletes.push(vec![text(id), text(name)]);
                    }
                }
            } else {
                for (name, value) in &node.properties {
                    push_insert(&mut batches, id, name, value, false)?;
                }
            }
        }
        let changed = !batches.is_empty();
        apply_batches(&conn, batches).await?;
        if changed {
            self.set_modified_bulk(&conn, &ids).await?;
        }
        Ok(())
    }

    /// Delete one node row. Version nodes are left untouched.
    pub async fn delete_node(&self, id: &str) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        SqlQuery::new("delete from nodes")
            .filter_eq("id", id)
            .no_versions()
            .execute(&conn)
            .await?;
        Ok(())
    }

    /// Bulk delete node rows, skipping version nodes.
    pub async fn delete_nodes(&self, ids: &[String]) -> Result<(), RepoError> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn().await?;
        for chunk in partition(ids) {
            SqlQuery::new("delete from nodes")
                .filter_in("id", chunk)
                .no_versions()
                .execute(&conn)
                .await?;
        }
        Ok(())
    }

    //
    // PRIMARY PARENT
    //

    pub async fn get_primary_parent(&self, id: &str) -> Result<Option<String>, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new("select parent_id from nodes")
            .filter_eq("id", id)
            .query(&conn)
            .await?;
        match next_row(&mut rows).await? {
            Some(row) => Ok(get_opt_text(&row, 0)?),
            None => Ok(None),
        }
    }

    /// Ids of the nodes whose primary parent is `id`.
    pub async fn get_by_primary_parent(&self, id: &str) -> Result<Vec<String>, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new("select id from nodes")
            .filter_eq("parent_id", id)
            .query(&conn)
            .await?;
        collect_ids(&mut rows).await
    }

    /// Bulk parent lookup; ids without a parent are absent from the map.
    pub async fn get_primary_parents(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, String>, RepoError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn().await?;
        let mut result = HashMap::new();
        for chunk in partition(ids) {
            let mut rows = SqlQuery::new("select id, parent_id from nodes")
                .filter_in("id", chunk)
                .query(&conn)
                .await?;
            while let Some(row) = next_row(&mut rows).await? {
                let id = get_text(&row, 0)?;
                if let Some(parent) = get_opt_text(&row, 1)? {
                    result.insert(id, parent);
                }
            }
        }
        Ok(result)
    }

    pub async fn set_primary_parent(
        &self,
        id: &str,
        parent_id: Option<&str>,
    ) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        sql::timed(
            "update nodes set parent_id = ?",
            conn.execute("update nodes set parent_id = ? where id = ?", (parent_id, id)),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to set parent: {}", e)))?;
        Ok(())
    }

    //
    // PROPERTIES
    //

    /// Fetch a single named property, reassembling multi-valued rows into a
    /// list. The reserved name `__modified` reads the node's timestamp.
    pub async fn get_property(
        &self,
        id: &str,
        name: &str,
    ) -> Result<Option<PropValue>, RepoError> {
        let conn = self.conn().await?;
        if name == "__modified" {
            let mut rows = SqlQuery::new("select modified from nodes")
                .filter_eq("id", id)
                .query(&conn)
                .await?;
            return match next_row(&mut rows).await? {
                Some(row) => {
                    let millis = get_int(&row, 0)?;
                    Ok(DateTime::from_timestamp_millis(millis).map(PropValue::Date))
                }
                None => Ok(None),
            };
        }
        let mut rows = SqlQuery::new("select type, value_s, value_n from node_props")
            .filter_eq("node_id", id)
            .filter_eq("name", name)
            .query(&conn)
            .await?;
        let mut result: Option<PropValue> = None;
        while let Some(row) = next_row(&mut rows).await? {
            let tag = get_int(&row, 0)?;
            let value = codec::decode(tag, get_opt_text(&row, 1)?.as_deref(), get_opt_int(&row, 2)?);
            accumulate(&mut result, tag, value);
        }
        Ok(result)
    }

    /// Bulk fetch of one named property across many nodes.
    pub async fn get_property_bulk(
        &self,
        ids: &[String],
        name: &str,
    ) -> Result<HashMap<String, PropValue>, RepoError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn().await?;
        let mut result: HashMap<String, Option<PropValue>> = HashMap::new();
        for chunk in partition(ids) {
            let mut rows =
                SqlQuery::new("select node_id, type, value_s, value_n from node_props")
                    .filter_in("node_id", chunk)
                    .filter_eq("name", name)
                    .query(&conn)
                    .await?;
            while let Some(row) = next_row(&mut rows).await? {
                let node_id = get_text(&row, 0)?;
                let tag = get_int(&row, 1)?;
                let value =
                    codec::decode(tag, get_opt_text(&row, 2)?.as_deref(), get_opt_int(&row, 3)?);
                accumulate(result.entry(node_id).or_default(), tag, value);
            }
        }
        Ok(result
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    /// Set one property on one node, diffing lists element-wise. `modified`
    /// is the caller's snapshot timestamp for the optimistic check (`None`
    /// skips the comparison but still bumps the timestamp).
    pub async fn set_property(
        &self,
        id: &str,
        name: &str,
        modified: Option<DateTime<Utc>>,
        value: &PropValue,
        old_value: Option<&PropValue>,
    ) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        if value.is_list() || old_value.map_or(false, PropValue::is_list) {
            let mut batches = PropBatches::default();
            diff_property(&mut batches, id, name, value, old_value)?;
            let changed = !batches.is_empty();
            apply_batches(&conn, batches).await?;
            if changed {
                self.set_modified(&conn, id, modified).await?;
            }
        } else {
            if old_value.is_some() {
                let (_, s, n) = codec::encode(value)?;
                batch_execute(
                    &conn,
                    UPDATE_PROP,
                    vec![vec![
                        opt_text(s.as_deref()),
                        opt_int(n),
                        text(id),
                        text(name),
                    ]],
                )
                .await?;
            } else {
                let mut batches = PropBatches::default();
                push_insert(&mut batches, id, name, value, false)?;
                batch_execute(&conn, INSERT_PROP, batches.inserts).await?;
            }
            self.set_modified(&conn, id, modified).await?;
        }
        Ok(())
    }

    /// Set one property across many nodes without optimistic locking.
    pub async fn set_property_bulk(
        &self,
        ids: &[String],
        name: &str,
        value: &PropValue,
        old_values: &HashMap<String, PropValue>,
    ) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        let mut batches = PropBatches::default();
        if value.is_list() {
            for id in ids {
                diff_property(&mut batches, id, name, value, old_values.get(id))?;
            }
        } else {
            for id in ids {
                match old_values.get(id) {
                    Some(existing) => {
                        if existing != value {
                            let (_, s, n) = codec::encode(value)?;
                            batches.updates.push(vec![
                                opt_text(s.as_deref()),
                                opt_int(n),
                                text(id),
                                text(name),
                            ]);
                        }
                    }
                    None => push_insert(&mut batches, id, name, value, false)?,
                }
            }
        }
        let changed = !batches.is_empty();
        apply_batches(&conn, batches).await?;
        if changed {
            self.set_modified_bulk(&conn, ids).await?;
        }
        Ok(())
    }

    /// Remove a property from one node, with the optimistic check.
    pub async fn remove_property(
        &self,
        id: &str,
        name: &str,
        modified: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        batch_execute(&conn, DELETE_PROP, vec![vec![text(id), text(name)]]).await?;
        self.set_modified(&conn, id, modified).await?;
        Ok(())
    }

    /// Remove a property from many nodes, unlocked.
    pub async fn remove_property_bulk(&self, ids: &[String], name: &str) -> Result<(), RepoError> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn().await?;
        for chunk in partition(ids) {
            SqlQuery::new("delete from node_props")
                .filter_in("node_id", chunk)
                .filter_eq("name", name)
                .execute(&conn)
                .await?;
        }
        self.set_modified_bulk(&conn, ids).await?;
        Ok(())
    }

    //
    // ASSOCIATIONS
    //

    pub async fn create_assoc(
        &self,
        source: &str,
        target: &str,
        assoc_type: &str,
        assoc_name: Option<&str>,
    ) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        sql::timed(
            INSERT_ASSOC,
            conn.execute(INSERT_ASSOC, (assoc_type, assoc_name, source, target)),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to insert assoc: {}", e)))?;
        Ok(())
    }

    /// Bulk create same-typed associations from one source.
    pub async fn create_assocs(
        &self,
        source: &str,
        targets: &[String],
        assoc_type: &str,
    ) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        let batch = targets
            .iter()
            .map(|target| vec![text(assoc_type), Value::Null, text(source), text(target)])
            .collect();
        batch_execute(&conn, INSERT_ASSOC, batch).await?;
        Ok(())
    }

    /// Associations where `id` is the source.
    pub async fn get_child_assocs(&self, id: &str) -> Result<Vec<Assoc>, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new("select type, name, source, target from node_assocs")
            .filter_eq("source", id)
            .query(&conn)
            .await?;
        collect_assocs(&mut rows).await
    }

    /// Associations where `id` is the target.
    pub async fn get_parent_assocs(&self, id: &str) -> Result<Vec<Assoc>, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new("select type, name, source, target from node_assocs")
            .filter_eq("target", id)
            .query(&conn)
            .await?;
        collect_assocs(&mut rows).await
    }

    /// Associations touching `id` from either end.
    pub async fn get_all_assocs(&self, id: &str) -> Result<Vec<Assoc>, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new("select type, name, source, target from node_assocs")
            .filter_any(&["source", "target"], id)
            .query(&conn)
            .await?;
        collect_assocs(&mut rows).await
    }

    pub async fn get_assocs_by_type(&self, assoc_type: &str) -> Result<Vec<Assoc>, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new("select type, name, source, target from node_assocs")
            .filter_eq("type", assoc_type)
            .query(&conn)
            .await?;
        collect_assocs(&mut rows).await
    }

    /// Bulk fetch of associations sourced at any of `ids`.
    pub async fn get_child_assocs_bulk(&self, ids: &[String]) -> Result<Vec<Assoc>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        let mut result = Vec::new();
        for chunk in partition(ids) {
            let mut rows = SqlQuery::new("select type, name, source, target from node_assocs")
                .filter_in("source", chunk)
                .query(&conn)
                .await?;
            result.append(&mut collect_assocs(&mut rows).await?);
        }
        Ok(result)
    }

    /// Count associations from `parent_id`, optionally narrowed to one
    /// child and/or one type.
    pub async fn count_child_assocs(
        &self,
        parent_id: &str,
        child_id: Option<&str>,
        assoc_type: Option<&str>,
    ) -> Result<i64, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new("select count(*) from node_assocs")
            .filter_opt("type", assoc_type)
            .filter_eq("source", parent_id)
            .filter_opt("target", child_id)
            .query(&conn)
            .await?;
        fetch_count(&mut rows).await
    }

    /// Delete associations matching every given criterion; absent criteria
    /// do not filter.
    pub async fn delete_assoc(
        &self,
        source: Option<&str>,
        target: Option<&str>,
        assoc_type: Option<&str>,
        assoc_name: Option<&str>,
    ) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        SqlQuery::new("delete from node_assocs")
            .filter_opt("type", assoc_type)
            .filter_opt("source", source)
            .filter_opt("target", target)
            .filter_opt("name", assoc_name)
            .execute(&conn)
            .await?;
        Ok(())
    }

    /// Delete every association touching `id` from either end.
    pub async fn delete_all_assocs(&self, id: &str) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        sql::timed(
            "delete from node_assocs",
            conn.execute(
                "delete from node_assocs where source = ? or target = ?",
                (id, id),
            ),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to delete assocs: {}", e)))?;
        Ok(())
    }

    //
    // SEARCH
    //

    /// Ids of live nodes matching type/property criteria.
    pub async fn query_ids(
        &self,
        types: Option<&[String]>,
        prop_name: Option<&str>,
        prop_value: Option<&PropValue>,
    ) -> Result<Vec<String>, RepoError> {
        let q = self.build_prop_query(types, prop_name, prop_value).no_versions();
        let conn = self.conn().await?;
        let mut rows = q.query(&conn).await?;
        collect_ids(&mut rows).await
    }

    /// Same criteria, but over version (historical snapshot) nodes only.
    pub async fn query_version_ids(
        &self,
        types: Option<&[String]>,
        prop_name: Option<&str>,
        prop_value: Option<&PropValue>,
    ) -> Result<Vec<String>, RepoError> {
        let q = self.build_prop_query(types, prop_name, prop_value).versions();
        let conn = self.conn().await?;
        let mut rows = q.query(&conn).await?;
        collect_ids(&mut rows).await
    }

    fn build_prop_query(
        &self,
        types: Option<&[String]>,
        prop_name: Option<&str>,
        prop_value: Option<&PropValue>,
    ) -> SqlQuery {
        let mut q =
            SqlQuery::new("select n.id from nodes n left join node_props p on p.node_id = n.id");
        if let Some(types) = types {
            q = q.filter_in("n.class", types);
        }
        q = q.filter_opt("p.name", prop_name);
        if let Some(value) = prop_value {
            // wildcard searches come in with '*', LIKE needs '%'
            let s = codec::string_slot(value).map(|s| s.replace('*', "%"));
            q = q.filter_opt("p.value_s", s.as_deref());
            q = q.filter_opt_int("p.value_n", codec::numeric_slot(value));
        }
        q
    }

    /// Run a query-builder fragment, optionally restricted to nodes whose
    /// primary parent is in `parents`, capped at `max_rows` (non-positive
    /// means unlimited). Version nodes never match.
    pub async fn query_by_parents(
        &self,
        fragment: &str,
        parents: Option<&[String]>,
        max_rows: i64,
    ) -> Result<Vec<String>, RepoError> {
        let conn = self.conn().await?;
        let prefix = format!("select distinct n.id from nodes n {}", fragment);
        match parents {
            Some(parents) if !parents.is_empty() => {
                let mut result = Vec::new();
                for chunk in partition(parents) {
                    let remaining = if max_rows > 0 {
                        max_rows - result.len() as i64
                    } else {
                        0
                    };
                    let mut rows = SqlQuery::new(prefix.clone())
                        .no_versions()
                        .filter_in("n.parent_id", chunk)
                        .limit(remaining)
                        .query(&conn)
                        .await?;
                    result.append(&mut collect_ids(&mut rows).await?);
                    if max_rows > 0 && result.len() as i64 >= max_rows {
                        break;
                    }
                }
                Ok(result)
            }
            _ => {
                let mut rows = SqlQuery::new(prefix)
                    .no_versions()
                    .limit(max_rows)
                    .query(&conn)
                    .await?;
                collect_ids(&mut rows).await
            }
        }
    }

    /// Count live nodes matching a query-builder fragment.
    pub async fn query_count(&self, fragment: &str) -> Result<i64, RepoError> {
        let conn = self.conn().await?;
        let mut rows =
            SqlQuery::new(format!("select count(distinct n.id) from nodes n {}", fragment))
                .no_versions()
                .query(&conn)
                .await?;
        fetch_count(&mut rows).await
    }

    /// Wipe all four relations. Test/tooling hook.
    pub async fn clear(&self) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        for sql in [
            "delete from node_aces",
            "delete from node_assocs",
            "delete from node_props",
            "delete from nodes",
        ] {
            conn.execute(sql, ())
                .await
                .map_err(|e| DatabaseError::sql_execution(format!("'{}' failed: {}", sql, e)))?;
        }
        Ok(())
    }

    //
    // MODIFIED TIMESTAMP
    //

    /// Bump the modified timestamp. With a previous snapshot this is the
    /// optimistic check: zero affected rows means a concurrent writer won.
    async fn set_modified(
        &self,
        conn: &Connection,
        id: &str,
        prev: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        match prev {
            None => {
                sql::timed(
                    "update nodes set modified = ?",
                    conn.execute("update nodes set modified = ? where id = ?", (now, id)),
                )
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!("Failed to set modified: {}", e))
                })?;
                Ok(())
            }
            Some(prev) => {
                let affected = sql::timed(
                    "update nodes set modified = ? (conditional)",
                    conn.execute(
                        "update nodes set modified = ? where id = ? and modified = ?",
                        (now, id, prev.timestamp_millis()),
                    ),
                )
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!("Failed to set modified: {}", e))
                })?;
                if affected != 1 {
                    return Err(RepoError::conflict(format!("node {} already modified", id)));
                }
                Ok(())
            }
        }
    }

    async fn set_modified_bulk(&self, conn: &Connection, ids: &[String]) -> Result<(), RepoError> {
        let now = Utc::now().timestamp_millis();
        for chunk in partition(ids) {
            SqlQuery::new("update nodes")
                .set_int("modified", now)
                .filter_in("id", chunk)
                .execute(conn)
                .await?;
        }
        Ok(())
    }
}

//
// ROW EXTRACTION
//

async fn next_row(rows: &mut Rows) -> Result<Option<Row>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::sql_execution(e.to_string()))
}

fn column_err(idx: i32, e: libsql::Error) -> DatabaseError {
    DatabaseError::sql_execution(format!("column {}: {}", idx, e))
}

fn get_text(row: &Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx).map_err(|e| column_err(idx, e))
}

fn get_int(row: &Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx).map_err(|e| column_err(idx, e))
}

fn get_opt_text(row: &Row, idx: i32) -> Result<Option<String>, DatabaseError> {
    row.get::<Option<String>>(idx).map_err(|e| column_err(idx, e))
}

fn get_opt_int(row: &Row, idx: i32) -> Result<Option<i64>, DatabaseError> {
    row.get::<Option<i64>>(idx).map_err(|e| column_err(idx, e))
}

async fn fetch_count(rows: &mut Rows) -> Result<i64, RepoError> {
    match next_row(rows).await? {
        Some(row) => Ok(get_int(&row, 0)?),
        None => Ok(0),
    }
}

async fn collect_ids(rows: &mut Rows) -> Result<Vec<String>, RepoError> {
    let mut result = Vec::new();
    while let Some(row) = next_row(rows).await? {
        if let Some(id) = get_opt_text(&row, 0)? {
            result.push(id);
        }
    }
    Ok(result)
}

async fn collect_assocs(rows: &mut Rows) -> Result<Vec<Assoc>, RepoError> {
    let mut result = Vec::new();
    while let Some(row) = next_row(rows).await? {
        let assoc_type = get_text(&row, 0)?;
        result.push(Assoc {
            assoc_type,
            name: get_opt_text(&row, 1)?,
            source: get_text(&row, 2)?,
            target: get_text(&row, 3)?,
        });
    }
    Ok(result)
}

/// Merge one joined node+property row into the per-id accumulator.
fn extract_node(row: &Row, result: &mut HashMap<String, Node>) -> Result<(), DatabaseError> {
    let id = get_text(row, 0)?;
    let modified = get_int(row, 1)?;
    let parent_id = get_opt_text(row, 2)?;
    debug_assert!(parent_id.as_deref() != Some(id.as_str()));
    let node = result.entry(id.clone()).or_insert_with(|| Node {
        id: Some(id),
        node_type: None,
        parent_id,
        modified: DateTime::from_timestamp_millis(modified),
        version: false,
        properties: HashMap::new(),
    });
    if node.node_type.is_none() {
        node.node_type = get_opt_text(row, 3)?;
        node.version = get_opt_text(row, 4)?.as_deref() == Some("T");
    }
    let name = get_opt_text(row, 5)?;
    if let Some(tag) = get_opt_int(row, 6)? {
        let value = codec::decode(tag, get_opt_text(row, 7)?.as_deref(), get_opt_int(row, 8)?);
        if let (Some(name), Some(value)) = (name, value) {
            put_value(node, name, tag, value);
        }
    }
    Ok(())
}

/// Attach one decoded property row to a node, growing a list when the tag
/// is negative. List and scalar rows must never mix for one name.
fn put_value(node: &mut Node, name: String, tag: i64, value: PropValue) {
    match node.properties.get_mut(&name) {
        Some(PropValue::List(items)) => {
            debug_assert!(tag < 0, "scalar row duplicates list property {}", name);
            items.push(value);
        }
        Some(_) => {
            debug_assert!(false, "duplicate non-list value for {}", name);
        }
        None => {
            if tag < 0 {
                node.properties.insert(name, PropValue::List(vec![value]));
            } else {
                node.properties.insert(name, value);
            }
        }
    }
}

/// Accumulate single-property query rows into a scalar or a list.
fn accumulate(result: &mut Option<PropValue>, tag: i64, value: Option<PropValue>) {
    if tag < 0 {
        match result {
            Some(PropValue::List(items)) => {
                if let Some(v) = value {
                    items.push(v);
                }
            }
            None => *result = Some(PropValue::List(value.into_iter().collect())),
            Some(_) => debug_assert!(false, "list row duplicates scalar value"),
        }
    } else if let Some(v) = value {
        debug_assert!(result.is_none(), "duplicate scalar property row");
        *result = Some(v);
    }
}

//
// BATCH CONSTRUCTION
//

fn text(v: &str) -> Value {
    Value::Text(v.to_string())
}

fn fill_batch(
    node: &Node,
    parent_id: Option<&str>,
    node_batch: &mut Vec<Vec<Value>>,
    batches: &mut PropBatches,
) -> Result<String, RepoError> {
    let id = node.id.clone().unwrap_or_else(guid::generate);
    node_batch.push(vec![
        text(&id),
        Value::Integer(Utc::now().timestamp_millis()),
        opt_text(parent_id),
        opt_text(node.node_type.as_deref()),
        opt_text(if node.version { Some("T") } else { None }),
    ]);
    for (name, value) in &node.properties {
        push_insert(batches, &id, name, value, false)?;
    }
    Ok(id)
}

/// Queue inserts for a value, expanding lists element-wise with negated
/// type tags. Nested lists are rejected.
fn push_insert(
    batches: &mut PropBatches,
    id: &str,
    name: &str,
    value: &PropValue,
    multi: bool,
) -> Result<(), RepoError> {
    if let PropValue::List(items) = value {
        for item in items {
            if item.is_list() {
                return Err(RepoError::invalid_argument(
                    "nested collections are not supported as property values",
                ));
            }
            push_insert(batches, id, name, item, true)?;
        }
        Ok(())
    } else {
        let (tag, s, n) = codec::encode(value)?;
        batches.inserts.push(vec![
            text(id),
            text(name),
            Value::Integer(if multi { -tag } else { tag }),
            opt_text(s.as_deref()),
            opt_int(n),
        ]);
        Ok(())
    }
}

fn push_delete_value(
    batches: &mut PropBatches,
    id: &str,
    name: &str,
    value: &PropValue,
) -> Result<(), RepoError> {
    let s = codec::string_slot(value);
    let n = codec::numeric_slot(value);
    batches.delete_values.push(vec![
        text(id),
        text(name),
        opt_text(s.as_deref()),
        opt_int(n),
    ]);
    Ok(())
}

/// Per-name differential update: no-op when unchanged, insert on a new
/// name, in-place update for a changed scalar, and set-difference inserts/
/// deletes when both sides are lists.
fn diff_property(
    batches: &mut PropBatches,
    id: &str,
    name: &str,
    value: &PropValue,
    old: Option<&PropValue>,
) -> Result<(), RepoError> {
    if old == Some(value) {
        return Ok(());
    }
    match old {
        None => push_insert(batches, id, name, value, false),
        Some(old) => match (value, old) {
            (PropValue::List(new_items), PropValue::List(old_items)) => {
                let mut remaining: Vec<&PropValue> = old_items.iter().collect();
                for item in new_items {
                    if let Some(pos) = remaining.iter().position(|o| *o == item) {
                        remaining.remove(pos);
                    } else {
                        push_insert(batches, id, name, item, true)?;
                    }
                }
                for leftover in remaining {
                    push_delete_value(batches, id, name, leftover)?;
                }
                Ok(())
            }
            (PropValue::List(new_items), old_scalar) => {
                push_delete_value(batches, id, name, old_scalar)?;
                for item in new_items {
                    push_insert(batches, id, name, item, true)?;
                }
                Ok(())
            }
            (scalar, PropValue::List(old_items)) => {
                for old_item in old_items {
                    push_delete_value(batches, id, name, old_item)?;
                }
                push_insert(batches, id, name, scalar, false)
            }
            (scalar, _) => {
                let (_, s, n) = codec::encode(scalar)?;
                batches.updates.push(vec![
                    opt_text(s.as_deref()),
                    opt_int(n),
                    text(id),
                    text(name),
                ]);
                Ok(())
            }
        },
    }
}

async fn apply_batches(conn: &Connection, batches: PropBatches) -> Result<(), DatabaseError> {
    batch_execute(conn, DELETE_PROP_VALUE, batches.delete_values).await?;
    batch_execute(conn, DELETE_PROP, batches.deletes).await?;
    batch_execute(conn, UPDATE_PROP, batches.updates).await?;
    batch_execute(conn, INSERT_PROP, batches.inserts).await?;
    Ok(())
}
