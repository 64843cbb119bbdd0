//! Database Connection Management
//!
//! This module provides the core database connection and schema bootstrap
//! using libsql.
//!
//! # Architecture
//!
//! - **Path-agnostic**: accepts any valid `PathBuf`, creating parent
//!   directories as needed
//! - **Idempotent bootstrap**: `CREATE TABLE IF NOT EXISTS`, safe to run on
//!   every startup, no migrations
//! - **WAL mode**: Write-Ahead Logging for better concurrency
//! - **Busy timeout**: concurrent operations wait and retry instead of
//!   failing immediately with `SQLITE_BUSY`
//!
//! # Connection Pattern
//!
//! Always use `connect_with_timeout()` in async functions. The busy timeout
//! makes SQLite serialize gracefully when the Tokio runtime moves futures
//! between threads at `.await` points.
//!
//! # Schema
//!
//! Four relations back the whole repository:
//!
//! - `nodes(id, modified, parent_id, class, version)` - `modified` is epoch
//!   milliseconds (drives optimistic locking), `version` is `'T'` or NULL
//! - `node_props(node_id, name, type, value_s, value_n)` - dual-slot encoded
//!   property rows; multi-valued properties take one row per element with a
//!   negative type tag
//! - `node_assocs(type, name, source, target)` - directed typed edges
//! - `node_aces(node_id, authority_id, mask)` - access control entries

use crate::db::error::DatabaseError;
use libsql::{Builder, Database};
use std::path::PathBuf;
use std::sync::Arc;

/// Database service managing the libsql connection and schema
#[derive(Debug, Clone)]
pub struct DatabaseService {
    /// libsql database handle (wrapped in Arc for sharing)
    pub db: Arc<Database>,

    /// Path to the database file
    pub db_path: PathBuf,
}

impl DatabaseService {
    /// Open (or create) the database at `db_path` and bootstrap the schema.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the parent directory cannot be created,
    /// the connection fails, or schema initialization fails.
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        DatabaseError::permission_denied(db_path.clone())
                    } else {
                        DatabaseError::DirectoryCreationFailed(e)
                    }
                })?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| DatabaseError::connection_failed(db_path.clone(), e))?;

        let service = Self {
            db: Arc::new(db),
            db_path,
        };

        service.initialize_schema().await?;

        Ok(service)
    }

    /// Get a raw connection without a busy timeout configured.
    ///
    /// Prefer [`connect_with_timeout`](Self::connect_with_timeout) in async
    /// contexts.
    pub fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        self.db.connect().map_err(DatabaseError::Libsql)
    }

    /// Get a connection with a 5-second busy timeout configured.
    ///
    /// The timeout makes concurrent writers wait on the SQLite lock instead
    /// of failing immediately, which is required once the Tokio runtime
    /// starts interleaving operations.
    pub async fn connect_with_timeout(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self.connect()?;
        self.execute_pragma(&conn, "PRAGMA busy_timeout = 5000")
            .await?;
        Ok(conn)
    }

    /// Execute a PRAGMA statement.
    ///
    /// PRAGMA statements return rows, so query() must be used instead of
    /// execute().
    async fn execute_pragma(
        &self,
        conn: &libsql::Connection,
        pragma: &str,
    ) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    /// Create tables and indexes, enable WAL and foreign keys.
    async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        self.execute_pragma(&conn, "PRAGMA journal_mode = WAL")
            .await?;
        self.execute_pragma(&conn, "PRAGMA foreign_keys = ON")
            .await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                modified INTEGER NOT NULL,
                parent_id TEXT,
                class TEXT,
                version TEXT
            )",
            (),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to create nodes table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node_props (
                node_id TEXT NOT NULL,
                name TEXT NOT NULL,
                type INTEGER NOT NULL,
                value_s TEXT,
                value_n INTEGER
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to create node_props table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node_assocs (
                type TEXT NOT NULL,
                name TEXT,
                source TEXT NOT NULL,
                target TEXT NOT NULL
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to create node_assocs table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node_aces (
                node_id TEXT NOT NULL,
                authority_id TEXT NOT NULL,
                mask INTEGER NOT NULL
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to create node_aces table: {}", e))
        })?;

        self.create_core_indexes(&conn).await?;

        Ok(())
    }

    /// Indexes backing hierarchy walks, property lookups, association
    /// queries and ACE resolution.
    async fn create_core_indexes(&self, conn: &libsql::Connection) -> Result<(), DatabaseError> {
        const INDEXES: [(&str, &str); 8] = [
            (
                "idx_nodes_parent",
                "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)",
            ),
            (
                "idx_nodes_class",
                "CREATE INDEX IF NOT EXISTS idx_nodes_class ON nodes(class)",
            ),
            (
                "idx_props_node",
                "CREATE INDEX IF NOT EXISTS idx_props_node ON node_props(node_id)",
            ),
            (
                "idx_props_name_value",
                "CREATE INDEX IF NOT EXISTS idx_props_name_value ON node_props(name, value_s)",
            ),
            (
                "idx_assocs_source",
                "CREATE INDEX IF NOT EXISTS idx_assocs_source ON node_assocs(source)",
            ),
            (
                "idx_assocs_target",
                "CREATE INDEX IF NOT EXISTS idx_assocs_target ON node_assocs(target)",
            ),
            (
                "idx_aces_node",
                "CREATE INDEX IF NOT EXISTS idx_aces_node ON node_aces(node_id)",
            ),
            (
                "idx_aces_authority",
                "CREATE INDEX IF NOT EXISTS idx_aces_authority ON node_aces(authority_id)",
            ),
        ];

        for (name, sql) in INDEXES {
            conn.execute(sql, ()).await.map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to create index '{}': {}", name, e))
            })?;
        }

        Ok(())
    }
}
