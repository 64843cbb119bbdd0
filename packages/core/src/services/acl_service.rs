//! ACL Service - Access Control with Inheritance
//!
//! Manages the ACLs attached to nodes. An ACL maps authority ids (people,
//! groups, or external principals) to access masks; standard bits are
//! [`MASK_READ`](AclService::MASK_READ), [`MASK_WRITE`](AclService::MASK_WRITE)
//! and [`MASK_DELETE`](AclService::MASK_DELETE), callers may define more.
//! [`AUTHORITY_EVERYONE`](AclService::AUTHORITY_EVERYONE) is the well-known
//! authority granting access to anyone.
//!
//! # Resolution
//!
//! Access checks take the authority plus its membership groups. Within an
//! ACE set, the exact authority is consulted first, then each membership
//! group in caller order, then the everyone authority; the first entry
//! found decides (its mask either grants or denies the requested bit).
//! When no entry matches - or the node has no ACL at all - resolution
//! walks the primary-parent chain upward. A chain that ends without a
//! decision grants access: nodes with no ACLs anywhere behave as open.
//!
//! [`filter_readable`](AclService::filter_readable) resolves whole id sets
//! with one batched ACE fetch plus one batched parent fetch per chain
//! depth level, instead of a point check per id.

use crate::cache::TransactionalCache;
use crate::db::AclDao;
use crate::error::RepoError;
use crate::models::Ace;
use crate::services::node_service::NodeService;
use crate::txn::TxnContext;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const ACLS_CACHE: &str = "acls";

/// ACL management and inheritance-aware access checks.
///
/// ACE lists are cached per node in the `acls` region; an empty cached
/// list means "known to have no ACL", so repeated checks on open nodes
/// stay off the storage engine.
pub struct AclService {
    dao: Arc<AclDao>,
    node_service: Arc<NodeService>,
    acls: Arc<TransactionalCache<Vec<Ace>>>,
}

impl AclService {
    /// Permission bit: entity can be read.
    pub const MASK_READ: i32 = 1;
    /// Permission bit: entity can be modified.
    pub const MASK_WRITE: i32 = 2;
    /// Permission bit: entity can be deleted.
    pub const MASK_DELETE: i32 = 4;

    /// Well-known authority representing everyone. Deliberately not a
    /// valid node GUID.
    pub const AUTHORITY_EVERYONE: &'static str = "S0000000-0001-0001-0000-000000000000";

    pub fn new(dao: Arc<AclDao>, node_service: Arc<NodeService>) -> Self {
        Self {
            dao,
            node_service,
            acls: TransactionalCache::new(ACLS_CACHE),
        }
    }

    /// Add entries to a node's ACL, keeping existing ones. Two entries for
    /// one authority is a logical error (match order is then undefined).
    pub async fn add_acl(
        &self,
        txn: &TxnContext,
        id: &str,
        acl: &HashMap<String, i32>,
    ) -> Result<(), RepoError> {
        if !acl.is_empty() {
            self.create_aces(txn, id, acl).await?;
        }
        Ok(())
    }

    /// Replace (or create) a node's ACL. `None` or an empty map leaves the
    /// node without one.
    pub async fn set_acl(
        &self,
        txn: &TxnContext,
        id: &str,
        acl: Option<&HashMap<String, i32>>,
    ) -> Result<(), RepoError> {
        self.remove_aces(txn, id, None).await?;
        if let Some(acl) = acl {
            if !acl.is_empty() {
                self.create_aces(txn, id, acl).await?;
            }
        }
        Ok(())
    }

    /// Replace (or create) the entry for one authority on one node.
    /// `None` (or zero) means no access entry for that authority.
    pub async fn set_authority_acl(
        &self,
        txn: &TxnContext,
        id: &str,
        authority: &str,
        mask: Option<i32>,
    ) -> Result<(), RepoError> {
        self.remove_aces(txn, id, Some(authority)).await?;
        if let Some(mask) = mask {
            if mask != 0 {
                let acl = HashMap::from([(authority.to_string(), mask)]);
                self.create_aces(txn, id, &acl).await?;
            }
        }
        Ok(())
    }

    /// Remove an authority's entries from every node. Call when the
    /// authority itself is removed. The affected node ids are unknown at
    /// this point, so the whole ACL cache region is dropped.
    pub async fn remove_acls(&self, txn: &TxnContext, authority: &str) -> Result<(), RepoError> {
        self.dao.remove_aces(None, Some(authority)).await?;
        self.acls.clear(txn);
        Ok(())
    }

    /// The effective ACL: the node's own, or the nearest ancestor's.
    /// `None` when nothing up the chain has one.
    pub async fn get_acl(
        &self,
        txn: &TxnContext,
        id: &str,
    ) -> Result<Option<HashMap<String, i32>>, RepoError> {
        let mut visited = HashSet::new();
        let mut current = id.to_string();
        loop {
            if let Some(aces) = self.get_aces(txn, &current).await? {
                return Ok(Some(
                    aces.into_iter().map(|ace| (ace.authority_id, ace.mask)).collect(),
                ));
            }
            visited.insert(current.clone());
            match self.node_service.get_primary_parent(txn, &current).await? {
                None => return Ok(None),
                Some(parent) => {
                    if visited.contains(&parent) {
                        return Err(cycle_error(&parent));
                    }
                    current = parent;
                }
            }
        }
    }

    /// Convert the node's ACL to read-only, or install an everyone-read
    /// ACL if it had none. Returns whether a prior ACL existed.
    pub async fn convert_to_readonly(&self, txn: &TxnContext, id: &str) -> Result<bool, RepoError> {
        self.convert_to(txn, id, Self::MASK_READ).await
    }

    /// Convert the node's ACL to read-write, or install an everyone-read-
    /// write ACL if it had none. Returns whether a prior ACL existed.
    pub async fn convert_to_read_write(
        &self,
        txn: &TxnContext,
        id: &str,
    ) -> Result<bool, RepoError> {
        self.convert_to(txn, id, Self::MASK_READ | Self::MASK_WRITE)
            .await
    }

    pub async fn is_readable_by(
        &self,
        txn: &TxnContext,
        id: &str,
        authority: &str,
        membership: &[String],
    ) -> Result<bool, RepoError> {
        self.has_access(txn, id, authority, membership, Self::MASK_READ)
            .await
    }

    pub async fn is_writable_by(
        &self,
        txn: &TxnContext,
        id: &str,
        authority: &str,
        membership: &[String],
    ) -> Result<bool, RepoError> {
        self.has_access(txn, id, authority, membership, Self::MASK_WRITE)
            .await
    }

    pub async fn is_deletable_by(
        &self,
        txn: &TxnContext,
        id: &str,
        authority: &str,
        membership: &[String],
    ) -> Result<bool, RepoError> {
        self.has_access(txn, id, authority, membership, Self::MASK_DELETE)
            .await
    }

    /// The subset of `ids` readable by the authority - same result as a
    /// point check per id, but resolved with one batched ACE fetch for the
    /// whole set and one batched parent fetch per inheritance level.
    pub async fn filter_readable(
        &self,
        txn: &TxnContext,
        ids: &[String],
        authority: &str,
        membership: &[String],
    ) -> Result<Vec<String>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        // one (origin, frontier) pair per distinct input id; the frontier
        // climbs the parent chain while the origin stays fixed
        let mut current: Vec<(String, String)> = {
            let mut seen = HashSet::new();
            ids.iter()
                .filter(|id| seen.insert((*id).clone()))
                .map(|id| (id.clone(), id.clone()))
                .collect()
        };
        let mut chains: HashMap<String, HashSet<String>> = current
            .iter()
            .map(|(origin, _)| (origin.clone(), HashSet::from([origin.clone()])))
            .collect();
        while !current.is_empty() {
            let frontier_ids = distinct(current.iter().map(|(_, frontier)| frontier));
            let aces_by_node = self.load_aces(txn, &frontier_ids).await?;
            let mut unresolved = Vec::new();
            for (origin, frontier) in current {
                let node_aces = aces_by_node
                    .get(&frontier)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                match match_access(authority, membership, Self::MASK_READ, node_aces) {
                    Some(true) => result.push(origin),
                    Some(false) => {}
                    None => unresolved.push((origin, frontier)),
                }
            }
            if unresolved.is_empty() {
                break;
            }
            let parent_query = distinct(unresolved.iter().map(|(_, frontier)| frontier));
            let parents = self
                .node_service
                .get_primary_parents(txn, &parent_query)
                .await?;
            let mut next = Vec::new();
            for (origin, frontier) in unresolved {
                match parents.get(&frontier) {
                    // chain exhausted with no decision: implicit allow
                    None => result.push(origin),
                    Some(parent) => {
                        let chain = chains.entry(origin.clone()).or_default();
                        if !chain.insert(parent.clone()) {
                            return Err(cycle_error(parent));
                        }
                        next.push((origin, parent.clone()));
                    }
                }
            }
            current = next;
        }
        Ok(result)
    }

    //
    // INTERNAL
    //

    /// Walk the parent chain until an ACE entry decides, or the chain ends
    /// (ends ⇒ allow).
    async fn has_access(
        &self,
        txn: &TxnContext,
        id: &str,
        authority: &str,
        membership: &[String],
        mask: i32,
    ) -> Result<bool, RepoError> {
        let mut visited = HashSet::new();
        let mut current = id.to_string();
        loop {
            if let Some(aces) = self.get_aces(txn, &current).await? {
                if let Some(decision) = match_access(authority, membership, mask, &aces) {
                    return Ok(decision);
                }
            }
            visited.insert(current.clone());
            match self.node_service.get_primary_parent(txn, &current).await? {
                None => return Ok(true),
                Some(parent) => {
                    if visited.contains(&parent) {
                        return Err(cycle_error(&parent));
                    }
                    current = parent;
                }
            }
        }
    }

    async fn convert_to(&self, txn: &TxnContext, id: &str, mask: i32) -> Result<bool, RepoError> {
        let had_acl = self.get_aces(txn, id).await?.is_some();
        if had_acl {
            self.dao.convert_aces_to(id, mask).await?;
            self.acls.remove(txn, id)?;
        } else {
            let acl = HashMap::from([(Self::AUTHORITY_EVERYONE.to_string(), mask)]);
            self.create_aces(txn, id, &acl).await?;
        }
        Ok(had_acl)
    }

    /// The node's own ACE list, `None` when it has no ACL. An empty cached
    /// list is the known-absent sentinel.
    async fn get_aces(&self, txn: &TxnContext, id: &str) -> Result<Option<Vec<Ace>>, RepoError> {
        if let Some(cached) = self.acls.get(txn, id) {
            return Ok(if cached.is_empty() { None } else { Some(cached) });
        }
        let aces = self.dao.get_aces(id).await?;
        self.acls
            .put_existing(txn, id, aces.clone().unwrap_or_default());
        Ok(aces)
    }

    /// Bulk ACE load with an entry (possibly empty) for every requested id,
    /// caching what came from the storage engine.
    async fn load_aces(
        &self,
        txn: &TxnContext,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<Ace>>, RepoError> {
        let mut result = HashMap::new();
        let mut uncached = Vec::new();
        for id in ids {
            match self.acls.get(txn, id) {
                Some(aces) => {
                    result.insert(id.clone(), aces);
                }
                None => uncached.push(id.clone()),
            }
        }
        if !uncached.is_empty() {
            let loaded = self.dao.get_aces_bulk(&uncached).await?;
            let mut by_node: HashMap<String, Vec<Ace>> = uncached
                .iter()
                .map(|id| (id.clone(), Vec::new()))
                .collect();
            for ace in loaded {
                by_node.entry(ace.node_id.clone()).or_default().push(ace);
            }
            for (id, aces) in by_node {
                self.acls.put_existing(txn, &id, aces.clone());
                result.insert(id, aces);
            }
        }
        Ok(result)
    }

    async fn create_aces(
        &self,
        txn: &TxnContext,
        id: &str,
        acl: &HashMap<String, i32>,
    ) -> Result<(), RepoError> {
        let aces: Vec<Ace> = acl
            .iter()
            .map(|(authority, mask)| Ace::new(id, authority.clone(), *mask))
            .collect();
        self.dao.create_aces(id, &aces).await?;
        self.acls.mark_created(txn, id)?;
        Ok(())
    }

    async fn remove_aces(
        &self,
        txn: &TxnContext,
        id: &str,
        authority: Option<&str>,
    ) -> Result<(), RepoError> {
        self.dao.remove_aces(Some(id), authority).await?;
        self.acls.remove(txn, id)?;
        Ok(())
    }
}

/// First matching entry decides: exact authority, then membership groups
/// in caller order, then everyone. `None` when no entry matches any of
/// them (inconclusive - resolution continues up the parent chain).
fn match_access(
    authority: &str,
    membership: &[String],
    mask: i32,
    aces: &[Ace],
) -> Option<bool> {
    if let Some(decision) = match_strict(aces, authority, mask) {
        return Some(decision);
    }
    for group in membership {
        if let Some(decision) = match_strict(aces, group, mask) {
            return Some(decision);
        }
    }
    match_strict(aces, AclService::AUTHORITY_EVERYONE, mask)
}

fn match_strict(aces: &[Ace], sid: &str, permission: i32) -> Option<bool> {
    aces.iter()
        .find(|ace| ace.authority_id == sid)
        .map(|ace| (ace.mask & permission) != 0)
}

fn distinct<'a>(ids: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert((*id).clone())).cloned().collect()
}

fn cycle_error(id: &str) -> RepoError {
    RepoError::invalid_argument(format!("primary parent cycle detected at {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ace(node: &str, authority: &str, mask: i32) -> Ace {
        Ace::new(node, authority, mask)
    }

    #[test]
    fn exact_authority_wins_over_groups_and_everyone() {
        let aces = vec![
            ace("n", AclService::AUTHORITY_EVERYONE, AclService::MASK_READ),
            ace("n", "group", AclService::MASK_READ),
            ace("n", "alice", 0),
        ];
        let membership = vec!["group".to_string()];
        assert_eq!(
            match_access("alice", &membership, AclService::MASK_READ, &aces),
            Some(false)
        );
    }

    #[test]
    fn groups_match_in_caller_order() {
        let aces = vec![
            ace("n", "writers", AclService::MASK_WRITE),
            ace("n", "readers", AclService::MASK_READ),
        ];
        let membership = vec!["readers".to_string(), "writers".to_string()];
        // readers comes first in the membership list and grants read
        assert_eq!(
            match_access("bob", &membership, AclService::MASK_READ, &aces),
            Some(true)
        );
        // for the write bit, readers still matches first and denies
        assert_eq!(
            match_access("bob", &membership, AclService::MASK_WRITE, &aces),
            Some(false)
        );
    }

    #[test]
    fn unmatched_authority_is_inconclusive() {
        let aces = vec![ace("n", "carol", AclService::MASK_READ)];
        assert_eq!(match_access("dave", &[], AclService::MASK_READ, &aces), None);
    }

    #[test]
    fn everyone_entry_decides_for_anyone() {
        let aces = vec![ace("n", AclService::AUTHORITY_EVERYONE, AclService::MASK_READ)];
        assert_eq!(
            match_access("anyone", &[], AclService::MASK_READ, &aces),
            Some(true)
        );
        assert_eq!(
            match_access("anyone", &[], AclService::MASK_WRITE, &aces),
            Some(false)
        );
    }
}
