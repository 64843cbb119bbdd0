//! Repository Error Types
//!
//! This module defines the error taxonomy shared by the storage engine and
//! the service layer:
//!
//! - `InvalidArgument` - missing/malformed parameters, programming errors
//! - `NotFound` - mutation of a nonexistent node
//! - `ImmutableEntity` - mutation of a version (historical snapshot) node
//! - `ConcurrencyConflict` - optimistic locking failure or a cache write race
//! - `Database` - backend failure, propagated unchanged
//!
//! Only `ConcurrencyConflict` is transient: callers may retry it (see
//! [`crate::txn::run_in_txn`]). Everything else fails immediately and is
//! never retried inside the core.

use crate::db::DatabaseError;
use thiserror::Error;

/// Errors raised by repository operations.
#[derive(Error, Debug)]
pub enum RepoError {
    /// Null/missing required parameter or malformed identifier
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Mutation attempted on a node that does not exist
    #[error("node not found: {id}")]
    NotFound { id: String },

    /// Mutation attempted on a version-flagged (immutable) node
    #[error("version node could not be updated: {id}")]
    ImmutableEntity { id: String },

    /// Optimistic check failed, or two transactions raced on a cache key
    #[error("concurrent modification: {context}")]
    ConcurrencyConflict { context: String },

    /// Backing store failure
    #[error("database operation failed: {0}")]
    Database(#[from] DatabaseError),
}

impl RepoError {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a node not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create an immutable entity error
    pub fn immutable(id: impl Into<String>) -> Self {
        Self::ImmutableEntity { id: id.into() }
    }

    /// Create a concurrency conflict error
    pub fn conflict(context: impl Into<String>) -> Self {
        Self::ConcurrencyConflict {
            context: context.into(),
        }
    }

    /// Whether the error is transient and worth retrying in a fresh
    /// transaction. Only concurrency conflicts qualify.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}
