//! Transactional L1/L2 Caching
//!
//! [`TransactionalCache`] keeps reads consistent with uncommitted writes:
//!
//! - **L2** is a process-wide shared map, surviving across transactions.
//! - **L1** is a transaction-local overlay bound to the
//!   [`TxnContext`](crate::txn::TxnContext) as a named resource, created
//!   lazily on first use and unbound at completion.
//! - A transaction-local **changed-id set** records write intents, mirrored
//!   into a process-wide changed set that detects two in-flight transactions
//!   writing the same id - the second writer fails fast with a concurrency
//!   conflict instead of silently clobbering cache state.
//!
//! On commit every changed id is evicted from L2, so the next reader goes
//! back to the storage engine; on completion (either way) the global marks
//! are cleared and the transaction-local resources unbound.
//!
//! Each cache instance is one named region holding one value type, owned by
//! the service that populates it.

mod transactional;

pub use transactional::TransactionalCache;
