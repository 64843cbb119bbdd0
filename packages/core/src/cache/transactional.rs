use crate::error::RepoError;
use crate::txn::{TxnContext, TxnOutcome, TxnSynchronization};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

/// Transaction-aware two-level cache for one named region.
///
/// `get` prefers the transaction overlay; `put_existing` populates both
/// levels unless the id is already marked changed in a read-write
/// transaction; `remove` is the write-intent marker every mutating service
/// path calls before touching the storage engine.
pub struct TransactionalCache<T> {
    region: String,
    l1_key: String,
    changes_key: String,
    l2: RwLock<HashMap<String, T>>,
    /// Ids marked changed by any in-flight transaction
    l2_changed: Mutex<HashSet<String>>,
    /// Handle to self for completion-hook registration
    self_ref: Weak<TransactionalCache<T>>,
}

impl<T: Clone + Send + Sync + 'static> TransactionalCache<T> {
    /// Create the region. One instance per region per process; services
    /// share it behind an `Arc`.
    pub fn new(region: impl Into<String>) -> Arc<Self> {
        let region = region.into();
        Arc::new_cyclic(|self_ref| Self {
            l1_key: format!("{}.l1", region),
            changes_key: format!("{}.changes", region),
            region,
            l2: RwLock::new(HashMap::new()),
            l2_changed: Mutex::new(HashSet::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Read through the overlay: an L1 hit wins; otherwise L2 answers only
    /// if this transaction has not marked the id changed.
    pub fn get(&self, txn: &TxnContext, id: &str) -> Option<T> {
        let local = txn
            .with_resource(&self.l1_key, |l1: &mut HashMap<String, T>| {
                l1.get(id).cloned()
            })
            .flatten();
        if local.is_some() {
            return local;
        }
        if self.is_marked_changed(txn, id) {
            return None;
        }
        read_lock(&self.l2).get(id).cloned()
    }

    /// Cache a value read from the storage engine. Always lands in the
    /// overlay; lands in L2 too unless a read-write transaction already
    /// marked the id changed (a concurrent writer is about to invalidate
    /// it, caching would serve stale data).
    pub fn put_existing(&self, txn: &TxnContext, id: &str, value: T) {
        self.put_to_l1(txn, id, value.clone());
        if txn.is_read_only() || !self.is_marked_changed(txn, id) {
            write_lock(&self.l2).insert(id.to_string(), value);
        }
    }

    /// Write-intent marker: drop the id from the overlay and record it
    /// changed. Fails fast when another in-flight transaction already
    /// marked the same id (second writer loses).
    pub fn remove(&self, txn: &TxnContext, id: &str) -> Result<(), RepoError> {
        debug_assert!(!txn.is_read_only());
        txn.with_resource(&self.l1_key, |l1: &mut HashMap<String, T>| {
            l1.remove(id);
        });
        self.mark_changed(txn, id)
    }

    /// Invalidate after creating an entity. Same bookkeeping as
    /// [`remove`](Self::remove).
    pub fn mark_created(&self, txn: &TxnContext, id: &str) -> Result<(), RepoError> {
        self.remove(txn, id)
    }

    /// Whether a read would be served without going to the storage engine:
    /// either the overlay holds the id, or L2 holds it and no in-flight
    /// transaction has marked it stale.
    pub fn is_cached(&self, txn: &TxnContext, id: &str) -> bool {
        let in_l1 = txn
            .with_resource(&self.l1_key, |l1: &mut HashMap<String, T>| {
                l1.contains_key(id)
            })
            .unwrap_or(false);
        in_l1
            || (!lock(&self.l2_changed).contains(id) && read_lock(&self.l2).contains_key(id))
    }

    /// Drop the transaction's overlay entries and the whole shared layer.
    /// The changed-id bookkeeping stays bound so completion still clears
    /// the global marks this transaction made.
    pub fn clear(&self, txn: &TxnContext) {
        txn.with_resource(&self.l1_key, |l1: &mut HashMap<String, T>| l1.clear());
        write_lock(&self.l2).clear();
    }

    fn put_to_l1(&self, txn: &TxnContext, id: &str, value: T) {
        if !txn.has_resource(&self.l1_key) {
            self.bind(txn);
        }
        txn.with_resource(&self.l1_key, |l1: &mut HashMap<String, T>| {
            l1.insert(id.to_string(), value);
        });
    }

    fn is_marked_changed(&self, txn: &TxnContext, id: &str) -> bool {
        txn.with_resource(&self.changes_key, |changes: &mut HashSet<String>| {
            changes.contains(id)
        })
        .unwrap_or(false)
    }

    fn mark_changed(&self, txn: &TxnContext, id: &str) -> Result<(), RepoError> {
        if !txn.has_resource(&self.changes_key) {
            self.bind(txn);
        }
        let newly_marked = txn
            .with_resource(&self.changes_key, |changes: &mut HashSet<String>| {
                changes.insert(id.to_string())
            })
            .unwrap_or(false);
        if newly_marked && !lock(&self.l2_changed).insert(id.to_string()) {
            return Err(RepoError::conflict(format!(
                "{} already marked changed in cache region {}",
                id, self.region
            )));
        }
        Ok(())
    }

    /// Lazily create the transaction-local resources and hook completion.
    fn bind(&self, txn: &TxnContext) {
        txn.bind_resource(&self.l1_key, HashMap::<String, T>::new());
        txn.bind_resource(&self.changes_key, HashSet::<String>::new());
        if txn.is_active() {
            if let Some(me) = self.self_ref.upgrade() {
                txn.register_synchronization(me as Arc<dyn TxnSynchronization>);
            }
        }
    }

    fn unbind(&self, txn: &TxnContext) {
        txn.unbind_resource(&self.l1_key);
        txn.unbind_resource(&self.changes_key);
    }

    fn local_changes(&self, txn: &TxnContext) -> Option<Vec<String>> {
        txn.with_resource(&self.changes_key, |changes: &mut HashSet<String>| {
            changes.iter().cloned().collect()
        })
    }
}

impl<T: Clone + Send + Sync + 'static> TxnSynchronization for TransactionalCache<T> {
    /// Evict every id this transaction changed, so the next reader falls
    /// through to the storage engine.
    fn after_commit(&self, txn: &TxnContext) {
        if let Some(changes) = self.local_changes(txn) {
            let mut l2 = write_lock(&self.l2);
            for id in changes {
                l2.remove(&id);
            }
        }
    }

    /// Clear the global marks for this transaction's ids and unbind the
    /// overlay, whatever the outcome.
    fn after_completion(&self, txn: &TxnContext, _outcome: TxnOutcome) {
        if let Some(changes) = self.local_changes(txn) {
            let mut global = lock(&self.l2_changed);
            for id in changes {
                global.remove(&id);
            }
        }
        self.unbind(txn);
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<T>(rw: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match rw.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(rw: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match rw.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_your_writes_before_commit() {
        let cache = TransactionalCache::<String>::new("nodes");
        let txn = TxnContext::read_write();
        cache.put_existing(&txn, "a", "one".to_string());
        assert_eq!(cache.get(&txn, "a"), Some("one".to_string()));
        assert!(cache.is_cached(&txn, "a"));
    }

    #[test]
    fn commit_evicts_changed_ids_from_l2() {
        let cache = TransactionalCache::<String>::new("nodes");

        let warm = TxnContext::read_write();
        cache.put_existing(&warm, "a", "one".to_string());
        warm.commit();

        let writer = TxnContext::read_write();
        cache.remove(&writer, "a").unwrap();
        assert_eq!(cache.get(&writer, "a"), None);
        writer.commit();

        let reader = TxnContext::read_write();
        assert_eq!(cache.get(&reader, "a"), None);
        assert!(!cache.is_cached(&reader, "a"));
    }

    #[test]
    fn removed_id_invisible_even_with_l2_entry() {
        let cache = TransactionalCache::<String>::new("nodes");

        let warm = TxnContext::read_write();
        cache.put_existing(&warm, "a", "one".to_string());
        warm.commit();

        let txn = TxnContext::read_write();
        cache.remove(&txn, "a").unwrap();
        // stale L2 entry must not resurface inside this transaction
        assert_eq!(cache.get(&txn, "a"), None);
        // and a subsequent put only lands in the overlay
        cache.put_existing(&txn, "a", "two".to_string());
        assert_eq!(cache.get(&txn, "a"), Some("two".to_string()));
    }

    #[test]
    fn second_writer_conflicts_immediately() {
        let cache = TransactionalCache::<String>::new("nodes");
        let first = TxnContext::read_write();
        let second = TxnContext::read_write();
        cache.remove(&first, "a").unwrap();
        let err = cache.remove(&second, "a").unwrap_err();
        assert!(err.is_transient());
        // after the first completes the id is free again
        first.commit();
        let third = TxnContext::read_write();
        cache.remove(&third, "a").unwrap();
        third.rollback();
    }

    #[test]
    fn rollback_clears_marks_without_evicting() {
        let cache = TransactionalCache::<String>::new("nodes");

        let warm = TxnContext::read_write();
        cache.put_existing(&warm, "a", "one".to_string());
        warm.commit();

        let txn = TxnContext::read_write();
        cache.remove(&txn, "a").unwrap();
        txn.rollback();

        // rollback never published anything, L2 still serves the old value
        let reader = TxnContext::read_only();
        assert_eq!(cache.get(&reader, "a"), Some("one".to_string()));
    }

    #[test]
    fn overlay_does_not_leak_across_transactions() {
        let cache = TransactionalCache::<String>::new("nodes");
        let txn = TxnContext::read_write();
        cache.remove(&txn, "a").unwrap();
        cache.put_existing(&txn, "a", "mine".to_string());
        txn.commit();

        let other = TxnContext::read_write();
        // the overlay died with its transaction; the id was evicted at commit
        assert_eq!(cache.get(&other, "a"), None);
    }
}
