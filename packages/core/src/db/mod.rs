//! Database Layer
//!
//! Everything that touches the backing store lives here:
//!
//! - [`DatabaseService`] - libsql connection management and idempotent
//!   schema bootstrap
//! - [`RepositoryDao`] - the storage engine for nodes, properties and
//!   associations (optimistic locking, differential updates, bulk batching)
//! - [`AclDao`] - ACE row storage
//! - [`codec`] - the dual-slot property value codec
//!
//! The DAOs are the sole readers/writers of the backing relations; services
//! never issue SQL themselves.

pub mod codec;
mod database;
mod error;
mod sql;

mod acl;
mod repository;

pub use acl::AclDao;
pub use database::DatabaseService;
pub use error::DatabaseError;
pub use repository::RepositoryDao;
pub use sql::BATCH_SIZE;
