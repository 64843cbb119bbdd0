//! ACE Storage
//!
//! Row-level access to the `node_aces` relation. Resolution and inheritance
//! logic lives in [`crate::services::AclService`]; this layer only reads and
//! writes entries.

use crate::db::error::DatabaseError;
use crate::db::sql::{batch_execute, partition, SqlQuery};
use crate::db::DatabaseService;
use crate::error::RepoError;
use crate::models::Ace;
use libsql::{Connection, Rows, Value};
use std::sync::Arc;

const INSERT_ACE: &str = "insert into node_aces (node_id, authority_id, mask) values (?, ?, ?)";

pub struct AclDao {
    db: Arc<DatabaseService>,
}

impl AclDao {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    async fn conn(&self) -> Result<Connection, RepoError> {
        Ok(self.db.connect_with_timeout().await?)
    }

    /// Entries attached to one node. `None` when the node has no ACL at
    /// all, which is different from an empty one to the resolution logic.
    pub async fn get_aces(&self, id: &str) -> Result<Option<Vec<Ace>>, RepoError> {
        let conn = self.conn().await?;
        let mut rows = SqlQuery::new("select node_id, authority_id, mask from node_aces")
            .filter_eq("node_id", id)
            .query(&conn)
            .await?;
        let aces = collect_aces(&mut rows).await?;
        Ok(if aces.is_empty() { None } else { Some(aces) })
    }

    /// Entries for many nodes in one chunked fetch.
    pub async fn get_aces_bulk(&self, ids: &[String]) -> Result<Vec<Ace>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        let mut result = Vec::new();
        for chunk in partition(ids) {
            let mut rows = SqlQuery::new("select node_id, authority_id, mask from node_aces")
                .filter_in("node_id", chunk)
                .query(&conn)
                .await?;
            result.append(&mut collect_aces(&mut rows).await?);
        }
        Ok(result)
    }

    pub async fn create_aces(&self, id: &str, aces: &[Ace]) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        let batch = aces
            .iter()
            .map(|ace| {
                vec![
                    Value::Text(id.to_string()),
                    Value::Text(ace.authority_id.clone()),
                    Value::Integer(ace.mask as i64),
                ]
            })
            .collect();
        batch_execute(&conn, INSERT_ACE, batch).await?;
        Ok(())
    }

    /// Delete entries by node and/or authority; an absent criterion does
    /// not filter (so `(None, Some(a))` removes the authority everywhere).
    pub async fn remove_aces(
        &self,
        id: Option<&str>,
        authority: Option<&str>,
    ) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        SqlQuery::new("delete from node_aces")
            .filter_opt("node_id", id)
            .filter_opt("authority_id", authority)
            .execute(&conn)
            .await?;
        Ok(())
    }

    /// Rewrite every entry on the node to the given mask.
    pub async fn convert_aces_to(&self, id: &str, mask: i32) -> Result<(), RepoError> {
        let conn = self.conn().await?;
        conn.execute(
            "update node_aces set mask = ? where node_id = ?",
            (mask as i64, id),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to convert aces: {}", e)))?;
        Ok(())
    }
}

async fn collect_aces(rows: &mut Rows) -> Result<Vec<Ace>, RepoError> {
    let mut result = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::sql_execution(e.to_string()))?
    {
        let node_id = row
            .get::<String>(0)
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))?;
        let authority_id = row
            .get::<String>(1)
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))?;
        let mask = row
            .get::<i64>(2)
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))?;
        result.push(Ace::new(node_id, authority_id.trim(), mask as i32));
    }
    Ok(result)
}
