//! Integration tests for AclService
//!
//! Covers ACL CRUD, inheritance along the primary-parent chain, the
//! implicit-allow default, readonly/read-write conversion, and equivalence
//! of the bulk filter with per-id point checks on a depth-3 tree.

use std::collections::HashMap;
use std::sync::Arc;
use strata_core::db::{AclDao, DatabaseService, RepositoryDao};
use strata_core::models::Node;
use strata_core::services::{AclService, NodeService};
use strata_core::txn::TxnContext;
use tempfile::TempDir;

const READ: i32 = AclService::MASK_READ;
const WRITE: i32 = AclService::MASK_WRITE;

async fn create_test_services() -> (Arc<NodeService>, Arc<AclService>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Arc::new(DatabaseService::new(db_path).await.unwrap());
    let node_service = Arc::new(NodeService::new(Arc::new(RepositoryDao::new(db.clone()))));
    let acl_service = Arc::new(AclService::new(
        Arc::new(AclDao::new(db)),
        node_service.clone(),
    ));
    (node_service, acl_service, temp_dir)
}

async fn create_node(service: &NodeService, txn: &TxnContext, parent: Option<&str>) -> String {
    service
        .create_node(txn, parent, &Node::new("doc"), None, None)
        .await
        .unwrap()
}

fn acl(entries: &[(&str, i32)]) -> HashMap<String, i32> {
    entries
        .iter()
        .map(|(authority, mask)| (authority.to_string(), *mask))
        .collect()
}

#[tokio::test]
async fn test_acl_crud() {
    let (nodes, acls, _tmp) = create_test_services().await;
    let txn = TxnContext::read_write();
    let id = create_node(&nodes, &txn, None).await;

    acls.add_acl(&txn, &id, &acl(&[("alice", READ | WRITE)]))
        .await
        .unwrap();
    acls.add_acl(&txn, &id, &acl(&[("bob", READ)])).await.unwrap();
    let effective = acls.get_acl(&txn, &id).await.unwrap().unwrap();
    assert_eq!(effective.get("alice"), Some(&(READ | WRITE)));
    assert_eq!(effective.get("bob"), Some(&READ));

    // set replaces everything
    acls.set_acl(&txn, &id, Some(&acl(&[("carol", READ)])))
        .await
        .unwrap();
    let replaced = acls.get_acl(&txn, &id).await.unwrap().unwrap();
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced.get("carol"), Some(&READ));

    // per-authority replacement
    acls.set_authority_acl(&txn, &id, "carol", Some(WRITE))
        .await
        .unwrap();
    assert!(!acls.is_readable_by(&txn, &id, "carol", &[]).await.unwrap());
    assert!(acls.is_writable_by(&txn, &id, "carol", &[]).await.unwrap());

    // removing the ACL entirely reopens the node
    acls.set_acl(&txn, &id, None).await.unwrap();
    assert!(acls.get_acl(&txn, &id).await.unwrap().is_none());
    assert!(acls.is_readable_by(&txn, &id, "anyone", &[]).await.unwrap());
    txn.commit();
}

#[tokio::test]
async fn test_remove_acls_for_authority() {
    let (nodes, acls, _tmp) = create_test_services().await;
    let txn = TxnContext::read_write();
    let a = create_node(&nodes, &txn, None).await;
    let b = create_node(&nodes, &txn, None).await;
    acls.set_acl(&txn, &a, Some(&acl(&[("alice", READ), ("bob", READ)])))
        .await
        .unwrap();
    acls.set_acl(&txn, &b, Some(&acl(&[("alice", READ)])))
        .await
        .unwrap();

    acls.remove_acls(&txn, "alice").await.unwrap();

    let on_a = acls.get_acl(&txn, &a).await.unwrap().unwrap();
    assert!(!on_a.contains_key("alice"));
    assert!(on_a.contains_key("bob"));
    // b had only alice, its ACL is gone entirely
    assert!(acls.get_acl(&txn, &b).await.unwrap().is_none());
    txn.commit();
}

#[tokio::test]
async fn test_inheritance_point_checks() {
    let (nodes, acls, _tmp) = create_test_services().await;
    let txn = TxnContext::read_write();

    let parent = create_node(&nodes, &txn, None).await;
    let child = create_node(&nodes, &txn, Some(&parent)).await;

    // no ACLs anywhere: implicit allow
    assert!(acls.is_readable_by(&txn, &child, "x", &[]).await.unwrap());

    // parent grants READ to x, child inherits
    acls.set_acl(&txn, &parent, Some(&acl(&[("x", READ)])))
        .await
        .unwrap();
    assert!(acls.is_readable_by(&txn, &child, "x", &[]).await.unwrap());

    // entry present with the READ bit clear denies
    acls.set_acl(&txn, &parent, Some(&acl(&[("x", WRITE)])))
        .await
        .unwrap();
    assert!(!acls.is_readable_by(&txn, &child, "x", &[]).await.unwrap());

    // membership groups resolve through the chain too
    acls.set_acl(&txn, &parent, Some(&acl(&[("readers", READ)])))
        .await
        .unwrap();
    let membership = vec!["readers".to_string()];
    assert!(acls
        .is_readable_by(&txn, &child, "x", &membership)
        .await
        .unwrap());

    // an ACL naming nobody we know is inconclusive and falls through to
    // the (absent) grandparent: implicit allow
    acls.set_acl(&txn, &parent, Some(&acl(&[("someone-else", READ)])))
        .await
        .unwrap();
    assert!(acls.is_readable_by(&txn, &child, "x", &[]).await.unwrap());
    txn.commit();
}

#[tokio::test]
async fn test_own_acl_shadows_parent() {
    let (nodes, acls, _tmp) = create_test_services().await;
    let txn = TxnContext::read_write();
    let parent = create_node(&nodes, &txn, None).await;
    let child = create_node(&nodes, &txn, Some(&parent)).await;

    acls.set_acl(&txn, &parent, Some(&acl(&[("x", READ)])))
        .await
        .unwrap();
    acls.set_acl(&txn, &child, Some(&acl(&[("x", WRITE)])))
        .await
        .unwrap();

    // the child's own entry decides before the parent is consulted
    assert!(!acls.is_readable_by(&txn, &child, "x", &[]).await.unwrap());
    assert!(acls.is_writable_by(&txn, &child, "x", &[]).await.unwrap());
    txn.commit();
}

#[tokio::test]
async fn test_convert_to_readonly_and_read_write() {
    let (nodes, acls, _tmp) = create_test_services().await;
    let txn = TxnContext::read_write();
    let id = create_node(&nodes, &txn, None).await;

    // no prior ACL: installs everyone-read and reports false
    assert!(!acls.convert_to_readonly(&txn, &id).await.unwrap());
    assert!(acls.is_readable_by(&txn, &id, "anyone", &[]).await.unwrap());
    assert!(!acls.is_writable_by(&txn, &id, "anyone", &[]).await.unwrap());

    // prior ACL: masks converted in place, reports true
    assert!(acls.convert_to_read_write(&txn, &id).await.unwrap());
    assert!(acls.is_writable_by(&txn, &id, "anyone", &[]).await.unwrap());
    assert!(!acls.is_deletable_by(&txn, &id, "anyone", &[]).await.unwrap());
    txn.commit();
}

#[tokio::test]
async fn test_bulk_filter_matches_point_checks_on_depth_3_tree() {
    let (nodes, acls, _tmp) = create_test_services().await;
    let txn = TxnContext::read_write();

    // three chains of depth 3 under distinct roots, with ACLs at varied
    // depths: granted at root, denied at mid, open everywhere, plus an
    // inconclusive ACL that falls through to a granting root
    let mut all_ids = Vec::new();
    let mut chains = Vec::new();
    for _ in 0..4 {
        let root = create_node(&nodes, &txn, None).await;
        let mid = create_node(&nodes, &txn, Some(&root)).await;
        let leaf = create_node(&nodes, &txn, Some(&mid)).await;
        all_ids.extend([root.clone(), mid.clone(), leaf.clone()]);
        chains.push((root, mid, leaf));
    }

    let membership = vec!["readers".to_string()];

    // chain 0: root grants via group membership
    acls.set_acl(&txn, &chains[0].0, Some(&acl(&[("readers", READ)])))
        .await
        .unwrap();
    // chain 1: mid denies x directly, root would grant
    acls.set_acl(&txn, &chains[1].0, Some(&acl(&[("x", READ)])))
        .await
        .unwrap();
    acls.set_acl(&txn, &chains[1].1, Some(&acl(&[("x", WRITE)])))
        .await
        .unwrap();
    // chain 2: no ACLs at all
    // chain 3: mid has an ACL for an unrelated authority, root denies
    acls.set_acl(&txn, &chains[3].0, Some(&acl(&[("x", 0)])))
        .await
        .unwrap();
    acls.set_acl(&txn, &chains[3].1, Some(&acl(&[("stranger", READ)])))
        .await
        .unwrap();

    let filtered = acls
        .filter_readable(&txn, &all_ids, "x", &membership)
        .await
        .unwrap();

    let mut expected = Vec::new();
    for id in &all_ids {
        if acls.is_readable_by(&txn, id, "x", &membership).await.unwrap() {
            expected.push(id.clone());
        }
    }

    let filtered_set: std::collections::HashSet<_> = filtered.iter().cloned().collect();
    let expected_set: std::collections::HashSet<_> = expected.iter().cloned().collect();
    assert_eq!(filtered_set, expected_set);
    assert_eq!(filtered.len(), filtered_set.len(), "no duplicates");

    // spot checks: chain 0 fully readable, chain 1 mid+leaf denied,
    // chain 2 open, chain 3 all denied
    assert!(filtered_set.contains(&chains[0].2));
    assert!(filtered_set.contains(&chains[1].0));
    assert!(!filtered_set.contains(&chains[1].1));
    assert!(!filtered_set.contains(&chains[1].2));
    assert!(filtered_set.contains(&chains[2].2));
    assert!(!filtered_set.contains(&chains[3].2));
    txn.commit();
}

#[tokio::test]
async fn test_filter_readable_empty_and_open_inputs() {
    let (nodes, acls, _tmp) = create_test_services().await;
    let txn = TxnContext::read_write();
    assert!(acls
        .filter_readable(&txn, &[], "x", &[])
        .await
        .unwrap()
        .is_empty());

    let open = create_node(&nodes, &txn, None).await;
    let filtered = acls
        .filter_readable(&txn, &[open.clone()], "x", &[])
        .await
        .unwrap();
    assert_eq!(filtered, vec![open]);
    txn.commit();
}
