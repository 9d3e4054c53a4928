//! Table operations against the in-memory store.

mod common;

use serde_json::json;

use common::{flaky_table, memory_table};
use couchtable::{Adapter, Connection, Fields, ItemResult, TableError, TableOperation, TableOptions, ViewSelector};

fn all_fields() -> TableOptions {
    TableOptions {
        fields: Fields::All,
        ..Default::default()
    }
}

fn ids_of(response: &couchtable::TableResponse) -> Vec<String> {
    response
        .ok_records()
        .map(|r| r["_id"].as_str().unwrap().to_string())
        .collect()
}

// =========================================================================
// Create
// =========================================================================

#[tokio::test]
async fn create_batch_returns_id_and_rev_per_record() {
    let (_conn, table) = memory_table("people").await;
    let records = (0..5).map(|i| json!({"n": i})).collect();

    let out = table
        .execute(TableOperation::Create { records }, &TableOptions::default())
        .await
        .unwrap();

    assert_eq!(out.len(), 5);
    for record in out.ok_records() {
        assert!(!record["_id"].as_str().unwrap().is_empty());
        assert!(record["_rev"].as_str().unwrap().starts_with("1-"));
        assert_eq!(record.len(), 2, "default fields are id and rev only");
    }
}

#[tokio::test]
async fn create_merges_submitted_fields_when_requested() {
    let (_conn, table) = memory_table("people").await;
    let opts = TableOptions {
        fields: Fields::Only(vec!["name".into()]),
        ..Default::default()
    };

    let out = table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "alice", "name": "Alice", "age": 30})],
            },
            &opts,
        )
        .await
        .unwrap();

    let record = out.first().unwrap();
    assert_eq!(record["_id"], "alice");
    assert_eq!(record["name"], "Alice");
    assert!(record["_rev"].is_string());
    assert!(!record.contains_key("age"));
}

#[tokio::test]
async fn round_trip_with_all_fields() {
    let (_conn, table) = memory_table("people").await;
    let created = table
        .execute(
            TableOperation::Create {
                records: vec![json!({"a": 1, "b": "x"})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();
    let id = created.first().unwrap()["_id"].as_str().unwrap().to_string();

    let fetched = table
        .execute(TableOperation::GetByIds { ids: vec![id.clone()] }, &all_fields())
        .await
        .unwrap();
    let record = fetched.first().unwrap();
    assert_eq!(record["a"], 1);
    assert_eq!(record["b"], "x");
    assert_eq!(record["_id"], id.as_str());
    assert!(record["_rev"].is_string());
}

#[tokio::test]
async fn invalid_record_fails_batch_before_any_write() {
    let (conn, table) = memory_table("people").await;

    let err = table
        .execute(
            TableOperation::Create {
                records: vec![json!({"a": 1}), json!({}), json!({"b": 2})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation(_)));

    let info = conn.database_info("people").await.unwrap();
    assert_eq!(info["doc_count"], 0);
}

#[tokio::test]
async fn staged_create_reports_per_item_failures() {
    let (_conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "dup"})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    let err = table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "fresh"}), json!({"_id": "dup"})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        TableError::BatchPartialFailure { results, .. } => {
            assert!(results[0].is_ok());
            match &results[1] {
                ItemResult::Err { error } => {
                    assert_eq!(error.code, "conflict");
                    assert_eq!(error.id.as_deref(), Some("dup"));
                }
                other => panic!("expected error marker, got {other:?}"),
            }
        }
        other => panic!("expected BatchPartialFailure, got {other:?}"),
    }

    // Without rollback the successful part stays committed.
    table
        .execute(
            TableOperation::GetByIds {
                ids: vec!["fresh".into()],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();
}

// =========================================================================
// Get
// =========================================================================

#[tokio::test]
async fn get_by_ids_is_idempotent() {
    let (_conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![
                    json!({"_id": "a", "v": 1}),
                    json!({"_id": "b", "v": [1, 2]}),
                    json!({"_id": "c", "v": {"k": null}}),
                ],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    let op = || TableOperation::GetByIds {
        ids: vec!["c".into(), "a".into(), "b".into()],
    };
    let first = table.execute(op(), &all_fields()).await.unwrap();
    let second = table.execute(op(), &all_fields()).await.unwrap();

    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
    assert_eq!(ids_of(&first), vec!["c", "a", "b"]);
}

#[tokio::test]
async fn get_single_missing_is_not_found() {
    let (_conn, table) = memory_table("people").await;
    let err = table
        .execute(
            TableOperation::GetByIds {
                ids: vec!["ghost".into()],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn get_many_with_missing_id_is_batch_failure() {
    let (_conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "a"})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    let err = table
        .execute(
            TableOperation::GetByIds {
                ids: vec!["a".into(), "ghost".into()],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap_err();
    match err {
        TableError::BatchPartialFailure { message, results } => {
            assert!(message.contains("Not all requested ids were found"));
            assert!(results[0].is_ok());
            assert!(!results[1].is_ok());
        }
        other => panic!("expected BatchPartialFailure, got {other:?}"),
    }
}

#[tokio::test]
async fn get_many_with_continue_marks_missing_in_place() {
    let (_conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "a"}), json!({"_id": "b"})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    let opts = TableOptions {
        continue_on_error: true,
        ..Default::default()
    };
    let out = table
        .execute(
            TableOperation::GetByIds {
                ids: vec!["a".into(), "ghost".into(), "b".into()],
            },
            &opts,
        )
        .await
        .unwrap();

    assert_eq!(out.len(), 3);
    assert!(out.records[0].is_ok());
    assert!(out.records[2].is_ok());
    let marker = serde_json::to_value(&out.records[1]).unwrap();
    assert_eq!(marker["error"]["code"], "not_found");
    assert_eq!(marker["error"]["id"], "ghost");
}

// =========================================================================
// List
// =========================================================================

async fn seeded(n: usize) -> (couchtable::MemoryConnection, couchtable::Table) {
    let (conn, table) = memory_table("items").await;
    let records = (1..=n)
        .map(|i| json!({"_id": format!("d{i}"), "name": format!("item {i}"), "rank": n - i}))
        .collect();
    table
        .execute(TableOperation::Create { records }, &TableOptions::default())
        .await
        .unwrap();
    (conn, table)
}

#[tokio::test]
async fn list_paginates_and_reports_count_on_offset() {
    let (_conn, table) = seeded(5).await;
    let opts = TableOptions {
        offset: Some(1),
        limit: Some(2),
        ..Default::default()
    };
    let out = table
        .execute(TableOperation::List { filter: None }, &opts)
        .await
        .unwrap();
    assert_eq!(ids_of(&out), vec!["d2", "d3"]);
    assert_eq!(out.count, Some(5));

    let plain = table
        .execute(TableOperation::List { filter: None }, &TableOptions::default())
        .await
        .unwrap();
    assert_eq!(plain.len(), 5);
    assert_eq!(plain.count, None);

    let counted = table
        .execute(
            TableOperation::List { filter: None },
            &TableOptions {
                include_count: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(counted.count, Some(5));
}

#[tokio::test]
async fn list_fetches_docs_for_extra_fields() {
    let (_conn, table) = seeded(2).await;
    let opts = TableOptions {
        fields: Fields::parse("name"),
        ..Default::default()
    };
    let out = table
        .execute(TableOperation::List { filter: None }, &opts)
        .await
        .unwrap();
    let first = out.first().unwrap();
    assert_eq!(first["name"], "item 1");
    assert!(first["_rev"].as_str().unwrap().starts_with("1-"));
    assert!(!first.contains_key("rank"));
}

#[tokio::test]
async fn list_is_capped_by_max_records() {
    let (conn, _) = seeded(5).await;
    let table = couchtable::Table::new(conn.use_database("items")).with_max_records(Some(3));

    let out = table
        .execute(TableOperation::List { filter: None }, &TableOptions::default())
        .await
        .unwrap();
    assert_eq!(out.len(), 3);

    let opts = TableOptions {
        limit: Some(10),
        ..Default::default()
    };
    let out = table
        .execute(TableOperation::List { filter: None }, &opts)
        .await
        .unwrap();
    assert_eq!(out.len(), 3);
}

#[tokio::test]
async fn list_through_named_view() {
    let (conn, table) = seeded(3).await;
    conn.register_view("items", "app", "by_rank", |doc| {
        vec![(doc["rank"].clone(), serde_json::Value::Null)]
    })
    .await
    .unwrap();

    let opts = TableOptions {
        view: Some(ViewSelector {
            design: "app".into(),
            view: "by_rank".into(),
        }),
        fields: Fields::All,
        ..Default::default()
    };
    let out = table
        .execute(TableOperation::List { filter: None }, &opts)
        .await
        .unwrap();
    assert_eq!(ids_of(&out), vec!["d3", "d2", "d1"]);
    assert_eq!(out.first().unwrap()["name"], "item 3");
}

// =========================================================================
// Update
// =========================================================================

#[tokio::test]
async fn merge_overlays_patch_and_keeps_identity() {
    let (conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "m", "a": 1, "b": 2})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    let out = table
        .execute(
            TableOperation::MergeByIds {
                ids: vec!["m".into()],
                patch: json!({"b": 3, "c": 4}),
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out.first().unwrap()["_id"], "m");

    let doc = conn.use_database("people").get_doc("m").await.unwrap();
    assert_eq!(doc["a"], 1);
    assert_eq!(doc["b"], 3);
    assert_eq!(doc["c"], 4);
    assert!(doc["_rev"].as_str().unwrap().starts_with("2-"));
}

#[tokio::test]
async fn merge_discards_identifiers_in_patch() {
    let (conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "m", "a": 1})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    // The stale revision in the patch is ignored.
    table
        .execute(
            TableOperation::Merge {
                records: vec![json!({"_id": "m", "_rev": "1-stale", "a": 5})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();
    let doc = conn.use_database("people").get_doc("m").await.unwrap();
    assert_eq!(doc["a"], 5);

    let err = table
        .execute(
            TableOperation::Merge {
                records: vec![json!({"_id": "m", "_rev": "2-x"})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation(_)));
}

#[tokio::test]
async fn staged_merge_updates_every_record() {
    let (conn, table) = seeded(3).await;
    let out = table
        .execute(
            TableOperation::MergeByIds {
                ids: vec!["d1".into(), "d3".into()],
                patch: json!({"flag": true}),
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out.len(), 2);

    let db = conn.use_database("items");
    assert_eq!(db.get_doc("d1").await.unwrap()["flag"], true);
    assert_eq!(db.get_doc("d1").await.unwrap()["name"], "item 1");
    assert!(db.get_doc("d2").await.unwrap().get("flag").is_none());
    assert_eq!(db.get_doc("d3").await.unwrap()["flag"], true);
}

#[tokio::test]
async fn staged_merge_with_missing_id_writes_nothing() {
    let (conn, table) = seeded(2).await;
    let err = table
        .execute(
            TableOperation::MergeByIds {
                ids: vec!["d1".into(), "ghost".into()],
                patch: json!({"flag": true}),
            },
            &TableOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::BatchPartialFailure { .. }));
    let doc = conn.use_database("items").get_doc("d1").await.unwrap();
    assert!(doc.get("flag").is_none());
}

#[tokio::test]
async fn replace_resolves_missing_revision() {
    let (conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "r", "a": 1})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    table
        .execute(
            TableOperation::Replace {
                records: vec![json!({"_id": "r", "z": 9})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    let doc = conn.use_database("people").get_doc("r").await.unwrap();
    assert_eq!(doc["z"], 9);
    assert!(doc.get("a").is_none(), "replace drops fields not resubmitted");
}

#[tokio::test]
async fn replace_with_stale_revision_is_conflict() {
    let (_conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "r"})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    let err = table
        .execute(
            TableOperation::Replace {
                records: vec![json!({"_id": "r", "_rev": "1-0000", "a": 1})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.code(), "conflict");
}

#[tokio::test]
async fn staged_replace_by_ids() {
    let (conn, table) = seeded(3).await;
    let out = table
        .execute(
            TableOperation::ReplaceByIds {
                ids: vec!["d1".into(), "d2".into()],
                record: json!({"_id": "ignored", "name": "same"}),
            },
            &all_fields(),
        )
        .await
        .unwrap();
    assert_eq!(ids_of(&out), vec!["d1", "d2"]);

    let db = conn.use_database("items");
    for id in ["d1", "d2"] {
        let doc = db.get_doc(id).await.unwrap();
        assert_eq!(doc["name"], "same");
        assert!(doc.get("rank").is_none());
    }
    assert_eq!(db.get_doc("d3").await.unwrap()["name"], "item 3");
}

#[tokio::test]
async fn replace_by_ids_with_identifier_only_body_is_rejected() {
    let (conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "a", "name": "keep"})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    let err = table
        .execute(
            TableOperation::ReplaceByIds {
                ids: vec!["a".into()],
                record: json!({"_id": "zzz", "_rev": "1-abc"}),
            },
            &TableOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation(_)));

    let doc = conn.use_database("people").get_doc("a").await.unwrap();
    assert_eq!(doc["name"], "keep");
    assert!(doc["_rev"].as_str().unwrap().starts_with("1-"));
}

#[tokio::test]
async fn staged_merge_folds_patches_for_one_id() {
    let (conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "a", "n": 0}), json!({"_id": "b", "n": 0})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    let out = table
        .execute(
            TableOperation::Merge {
                records: vec![
                    json!({"_id": "a", "x": 1}),
                    json!({"_id": "b", "x": 5}),
                    json!({"_id": "a", "y": 2, "x": 3}),
                ],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(ids_of(&out), vec!["a", "b", "a"]);

    let db = conn.use_database("people");
    let a = db.get_doc("a").await.unwrap();
    assert_eq!(a["n"], 0);
    assert_eq!(a["x"], 3);
    assert_eq!(a["y"], 2);
    assert!(a["_rev"].as_str().unwrap().starts_with("2-"));
    assert_eq!(db.get_doc("b").await.unwrap()["x"], 5);
}

#[tokio::test]
async fn staged_replace_and_delete_with_repeated_ids() {
    let (conn, table) = memory_table("people").await;
    table
        .execute(
            TableOperation::Create {
                records: vec![json!({"_id": "a", "v": 0}), json!({"_id": "b", "v": 0})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();

    table
        .execute(
            TableOperation::Replace {
                records: vec![json!({"_id": "a", "v": 1}), json!({"_id": "a", "v": 2})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(conn.use_database("people").get_doc("a").await.unwrap()["v"], 2);

    let out = table
        .execute(
            TableOperation::DeleteByIds {
                ids: vec!["a".into(), "b".into(), "a".into()],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out.len(), 3);
    assert_eq!(conn.database_info("people").await.unwrap()["doc_count"], 0);
}

#[tokio::test]
async fn replace_requires_identifier() {
    let (_conn, table) = memory_table("people").await;
    let err = table
        .execute(
            TableOperation::Replace {
                records: vec![json!({"a": 1})],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation(_)));
}

#[tokio::test]
async fn merge_with_continue_reports_failures_in_place() {
    let (conn, table) = seeded(2).await;
    let opts = TableOptions {
        continue_on_error: true,
        ..Default::default()
    };
    let out = table
        .execute(
            TableOperation::MergeByIds {
                ids: vec!["d1".into(), "ghost".into(), "d2".into()],
                patch: json!({"seen": 1}),
            },
            &opts,
        )
        .await
        .unwrap();

    assert_eq!(out.len(), 3);
    assert!(!out.records[1].is_ok());
    let db = conn.use_database("items");
    assert_eq!(db.get_doc("d1").await.unwrap()["seen"], 1);
    assert_eq!(db.get_doc("d2").await.unwrap()["seen"], 1);
}

// =========================================================================
// Delete
// =========================================================================

#[tokio::test]
async fn delete_single_and_many() {
    let (conn, table) = seeded(4).await;

    let out = table
        .execute(
            TableOperation::DeleteByIds {
                ids: vec!["d1".into()],
            },
            &TableOptions::default(),
        )
        .await
        .unwrap();
    assert!(out.first().unwrap()["_rev"].as_str().unwrap().starts_with("2-"));

    let out = table
        .execute(
            TableOperation::DeleteByIds {
                ids: vec!["d2".into(), "d3".into()],
            },
            &all_fields(),
        )
        .await
        .unwrap();
    assert_eq!(out.first().unwrap()["name"], "item 2");

    let db = conn.use_database("items");
    for id in ["d1", "d2", "d3"] {
        assert!(db.get_doc(id).await.unwrap_err().is_not_found());
    }
    db.get_doc("d4").await.unwrap();
}

#[tokio::test]
async fn delete_all_needs_force_or_ids() {
    let (conn, table) = seeded(3).await;

    let err = table
        .execute(TableOperation::DeleteByFilter { filter: None }, &TableOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation(_)));
    assert_eq!(conn.database_info("items").await.unwrap()["doc_count"], 3);

    let by_ids = TableOptions {
        ids: Some(vec!["d1".into()]),
        ..Default::default()
    };
    table
        .execute(TableOperation::DeleteByFilter { filter: None }, &by_ids)
        .await
        .unwrap();
    assert_eq!(conn.database_info("items").await.unwrap()["doc_count"], 2);

    let forced = TableOptions {
        force: true,
        ..Default::default()
    };
    let out = table
        .execute(TableOperation::DeleteByFilter { filter: None }, &forced)
        .await
        .unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(conn.database_info("items").await.unwrap()["doc_count"], 0);
}

// =========================================================================
// Filters
// =========================================================================

#[tokio::test]
async fn filters_are_rejected_without_contacting_store() {
    let (_conn, flaky, table) = flaky_table("people", |_| {}).await;
    let filtered = TableOptions {
        filter: Some("age > 3".into()),
        ..Default::default()
    };

    let requests = vec![
        (TableOperation::List { filter: Some("age > 3".into()) }, TableOptions::default()),
        (TableOperation::List { filter: None }, filtered.clone()),
        (
            TableOperation::GetByFilter {
                filter: "age > 3".into(),
            },
            TableOptions::default(),
        ),
        (
            TableOperation::ReplaceByFilter {
                filter: "age > 3".into(),
                record: json!({"a": 1}),
            },
            TableOptions::default(),
        ),
        (
            TableOperation::MergeByFilter {
                filter: "age > 3".into(),
                patch: json!({"a": 1}),
            },
            TableOptions::default(),
        ),
        (
            TableOperation::MergeByIds {
                ids: vec!["a".into()],
                patch: json!({"a": 1}),
            },
            filtered.clone(),
        ),
        (
            TableOperation::DeleteByFilter {
                filter: Some("age > 3".into()),
            },
            TableOptions::default(),
        ),
    ];

    for (op, opts) in requests {
        let name = op.name();
        let err = table.execute(op, &opts).await.unwrap_err();
        assert!(matches!(err, TableError::Unsupported(_)), "{name}: {err:?}");
        assert_eq!(err.code(), "unsupported");
    }
    assert_eq!(flaky.calls(), 0);
}
