//! Integration tests for search and the predicate query builder.

use std::collections::HashMap;
use std::sync::Arc;
use strata_core::db::{DatabaseService, RepositoryDao};
use strata_core::models::{Node, PropValue};
use strata_core::services::{NodeService, QueryBuilder};
use strata_core::txn::TxnContext;
use tempfile::TempDir;

async fn create_test_service() -> (Arc<NodeService>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Arc::new(DatabaseService::new(db_path).await.unwrap());
    let service = Arc::new(NodeService::new(Arc::new(RepositoryDao::new(db))));
    (service, temp_dir)
}

async fn create(
    service: &NodeService,
    txn: &TxnContext,
    parent: Option<&str>,
    node_type: &str,
    entries: &[(&str, PropValue)],
) -> String {
    let properties: HashMap<String, PropValue> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    service
        .create_node(txn, parent, &Node::with_properties(node_type, properties), None, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_search_by_type_and_property() {
    let (service, _tmp) = create_test_service().await;
    let txn = TxnContext::read_write();

    let bird = create(
        &service,
        &txn,
        None,
        "photo",
        &[("name", PropValue::from("bird"))],
    )
    .await;
    create(
        &service,
        &txn,
        None,
        "photo",
        &[("name", PropValue::from("fish"))],
    )
    .await;
    create(
        &service,
        &txn,
        None,
        "note",
        &[("name", PropValue::from("bird"))],
    )
    .await;
    txn.commit();

    let hits = service
        .search(
            Some(&["photo".to_string()]),
            Some("name"),
            Some(&PropValue::from("bird")),
        )
        .await
        .unwrap();
    assert_eq!(hits, vec![bird.clone()]);

    // wildcard search uses LIKE
    let wild = service
        .search(
            Some(&["photo".to_string()]),
            Some("name"),
            Some(&PropValue::from("bi*")),
        )
        .await
        .unwrap();
    assert_eq!(wild, vec![bird.clone()]);

    // numeric property match goes through the numeric slot
    let txn = TxnContext::read_write();
    let sized = create(&service, &txn, None, "photo", &[("pages", PropValue::Int(7))]).await;
    txn.commit();
    let numeric = service
        .search(None, Some("pages"), Some(&PropValue::Int(7)))
        .await
        .unwrap();
    assert_eq!(numeric, vec![sized]);
}

#[tokio::test]
async fn test_query_builder_search() {
    let (service, _tmp) = create_test_service().await;
    let txn = TxnContext::read_write();

    let jpeg = create(
        &service,
        &txn,
        None,
        "photo",
        &[
            ("name", PropValue::from("bird one")),
            ("content-type", PropValue::from("image/jpeg")),
        ],
    )
    .await;
    let png = create(
        &service,
        &txn,
        None,
        "photo",
        &[
            ("name", PropValue::from("bird two")),
            ("content-type", PropValue::from("image/png")),
        ],
    )
    .await;
    create(
        &service,
        &txn,
        None,
        "photo",
        &[
            ("name", PropValue::from("bird three")),
            ("content-type", PropValue::from("image/gif")),
        ],
    )
    .await;
    txn.commit();

    let q = QueryBuilder::new()
        .types(&["photo"])
        .is("name", Some(&PropValue::from("bird*")))
        .one_of()
        .is("content-type", Some(&PropValue::from("image/jpeg")))
        .is("content-type", Some(&PropValue::from("image/png")));
    let mut hits = service.search_query(&q).await.unwrap();
    hits.sort();
    let mut expected = vec![jpeg.clone(), png.clone()];
    expected.sort();
    assert_eq!(hits, expected);
    assert_eq!(service.count(&q).await.unwrap(), 2);
}

#[tokio::test]
async fn test_query_builder_range_and_null() {
    let (service, _tmp) = create_test_service().await;
    let txn = TxnContext::read_write();

    let small = create(&service, &txn, None, "doc", &[("pages", PropValue::Int(5))]).await;
    create(&service, &txn, None, "doc", &[("pages", PropValue::Int(50))]).await;
    let untagged = create(&service, &txn, None, "doc", &[]).await;
    txn.commit();

    let in_range = service
        .search_query(
            &QueryBuilder::new()
                .types(&["doc"])
                .range("pages", Some(&PropValue::Int(1)), Some(&PropValue::Int(10))),
        )
        .await
        .unwrap();
    assert_eq!(in_range, vec![small.clone()]);

    let missing = service
        .search_query(&QueryBuilder::new().types(&["doc"]).is_null(&["pages"]))
        .await
        .unwrap();
    assert_eq!(missing, vec![untagged.clone()]);

    let present = service
        .search_query(&QueryBuilder::new().types(&["doc"]).is_not_null(&["pages"]))
        .await
        .unwrap();
    assert_eq!(present.len(), 2);
}

#[tokio::test]
async fn test_search_restricted_to_parents_with_limit() {
    let (service, _tmp) = create_test_service().await;
    let txn = TxnContext::read_write();

    let folder_a = create(&service, &txn, None, "folder", &[]).await;
    let folder_b = create(&service, &txn, None, "folder", &[]).await;
    for _ in 0..3 {
        create(
            &service,
            &txn,
            Some(&folder_a),
            "doc",
            &[("kind", PropValue::from("memo"))],
        )
        .await;
    }
    create(
        &service,
        &txn,
        Some(&folder_b),
        "doc",
        &[("kind", PropValue::from("memo"))],
    )
    .await;
    txn.commit();

    let q = QueryBuilder::new()
        .types(&["doc"])
        .is("kind", Some(&PropValue::from("memo")));

    let under_a = service
        .search_with(&q, Some(&[folder_a.clone()]), -1)
        .await
        .unwrap();
    assert_eq!(under_a.len(), 3);

    let limited = service
        .search_with(&q, Some(&[folder_a.clone()]), 2)
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);

    let everywhere = service.search_with(&q, None, -1).await.unwrap();
    assert_eq!(everywhere.len(), 4);
}

#[tokio::test]
async fn test_search_by_association_membership() {
    let (service, _tmp) = create_test_service().await;
    let txn = TxnContext::read_write();

    let album = create(&service, &txn, None, "album", &[]).await;
    let tagged = create(&service, &txn, None, "photo", &[]).await;
    let untagged = create(&service, &txn, None, "photo", &[]).await;
    service
        .add_child(&txn, &album, &tagged, "member", None, false)
        .await
        .unwrap();
    txn.commit();

    let members = service
        .search_query(
            &QueryBuilder::new()
                .types(&["photo"])
                .parent_assoc(&[album.as_str()]),
        )
        .await
        .unwrap();
    assert_eq!(members, vec![tagged.clone()]);

    let non_members = service
        .search_query(
            &QueryBuilder::new()
                .types(&["photo"])
                .parent_assoc_not(&[album.as_str()]),
        )
        .await
        .unwrap();
    assert_eq!(non_members, vec![untagged.clone()]);
}
