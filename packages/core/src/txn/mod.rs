//! Transaction Scope
//!
//! The repository does not manage transactions itself - it relies on an
//! external transactional context, modeled here as an explicit
//! [`TxnContext`] handle threaded through service calls. The handle exposes
//! exactly four capabilities and nothing else:
//!
//! - is a transaction active
//! - is it read-only
//! - register a completion callback ([`TxnSynchronization`])
//! - bind/unbind a named resource for the lifetime of the transaction
//!
//! The transactional cache builds its transaction-local overlay on top of
//! these; see [`crate::cache::TransactionalCache`]. [`run_in_txn`] wraps a
//! scope with bounded, jittered retries on concurrency conflicts.

mod retry;

pub use retry::run_in_txn;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// How a transaction scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    RolledBack,
}

/// Completion hooks, registered once per interested component per
/// transaction. `after_commit` runs only on commit, before
/// `after_completion`; `after_completion` runs on both outcomes.
pub trait TxnSynchronization: Send + Sync {
    fn after_commit(&self, txn: &TxnContext);
    fn after_completion(&self, txn: &TxnContext, outcome: TxnOutcome);
}

/// Explicit transaction-scope handle.
///
/// Create one per unit of work, pass it to every service call inside the
/// scope, and finish it exactly once with [`commit`](Self::commit) or
/// [`rollback`](Self::rollback). Resources bound to the handle never leak
/// into another scope because the handle itself is the scope.
pub struct TxnContext {
    read_only: bool,
    completed: AtomicBool,
    resources: Mutex<HashMap<String, Box<dyn Any + Send>>>,
    synchronizations: Mutex<Vec<Arc<dyn TxnSynchronization>>>,
}

impl TxnContext {
    fn new(read_only: bool) -> Self {
        Self {
            read_only,
            completed: AtomicBool::new(false),
            resources: Mutex::new(HashMap::new()),
            synchronizations: Mutex::new(Vec::new()),
        }
    }

    /// Start a read-write scope.
    pub fn read_write() -> Self {
        Self::new(false)
    }

    /// Start a read-only scope. Read-only scopes may still populate shared
    /// caches but never mark entries changed.
    pub fn read_only() -> Self {
        Self::new(true)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the scope is still open (neither committed nor rolled back).
    pub fn is_active(&self) -> bool {
        !self.completed.load(Ordering::Acquire)
    }

    /// Bind a named resource for the lifetime of the scope, replacing any
    /// previous binding under the same key.
    pub fn bind_resource<T: Send + 'static>(&self, key: &str, value: T) {
        let mut resources = lock(&self.resources);
        resources.insert(key.to_string(), Box::new(value));
    }

    /// Drop a named resource.
    pub fn unbind_resource(&self, key: &str) {
        let mut resources = lock(&self.resources);
        resources.remove(key);
    }

    pub fn has_resource(&self, key: &str) -> bool {
        lock(&self.resources).contains_key(key)
    }

    /// Run `f` against a bound resource. Returns `None` when the key is
    /// unbound (or bound to a different type).
    pub fn with_resource<T: Send + 'static, R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut resources = lock(&self.resources);
        resources
            .get_mut(key)
            .and_then(|boxed| boxed.downcast_mut::<T>())
            .map(f)
    }

    /// Register completion hooks. Callers are responsible for registering
    /// at most once per component per scope.
    pub fn register_synchronization(&self, sync: Arc<dyn TxnSynchronization>) {
        lock(&self.synchronizations).push(sync);
    }

    /// Commit the scope: run `after_commit` then `after_completion` on
    /// every registered hook. Idempotent once completed.
    pub fn commit(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let syncs = std::mem::take(&mut *lock(&self.synchronizations));
        for sync in &syncs {
            sync.after_commit(self);
        }
        for sync in &syncs {
            sync.after_completion(self, TxnOutcome::Committed);
        }
    }

    /// Roll the scope back: run `after_completion` on every registered
    /// hook. Idempotent once completed.
    pub fn rollback(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let syncs = std::mem::take(&mut *lock(&self.synchronizations));
        for sync in &syncs {
            sync.after_completion(self, TxnOutcome::RolledBack);
        }
    }
}

impl std::fmt::Debug for TxnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnContext")
            .field("read_only", &self.read_only)
            .field("active", &self.is_active())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        commits: AtomicUsize,
        completions: AtomicUsize,
    }

    impl TxnSynchronization for Recorder {
        fn after_commit(&self, _txn: &TxnContext) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }

        fn after_completion(&self, _txn: &TxnContext, _outcome: TxnOutcome) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn resources_bind_and_unbind() {
        let txn = TxnContext::read_write();
        assert!(!txn.has_resource("k"));
        txn.bind_resource("k", 41i32);
        assert_eq!(txn.with_resource("k", |v: &mut i32| *v + 1), Some(42));
        txn.unbind_resource("k");
        assert!(!txn.has_resource("k"));
    }

    #[test]
    fn commit_runs_hooks_once() {
        let txn = TxnContext::read_write();
        let recorder = Arc::new(Recorder {
            commits: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
        });
        txn.register_synchronization(recorder.clone());
        txn.commit();
        txn.commit();
        assert_eq!(recorder.commits.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
        assert!(!txn.is_active());
    }

    #[test]
    fn rollback_skips_after_commit() {
        let txn = TxnContext::read_only();
        let recorder = Arc::new(Recorder {
            commits: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
        });
        txn.register_synchronization(recorder.clone());
        txn.rollback();
        assert_eq!(recorder.commits.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
    }
}
