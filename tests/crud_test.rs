//! End-to-end CRUD tests against the embedded SQLite backend.
//!
//! Covers the write path (lock check, mutation, audit), read pagination and
//! the audit-failure rollback.

mod common;

use std::sync::Arc;

use common::{TestFixture, USERS};
use datagate::datasource::{ConnectorRegistry, PoolSettings, SqliteConnector};
use datagate::error::Access;
use datagate::observability::tracing::init_test_tracing;
use datagate::query::{Condition, ConditionList, InsertSpec, OrderItem, QuerySpec, UpdateSpec, Value};
use datagate::service::{Actor, LockRelease};
use datagate::storage::MutationKind;
use datagate::{DataError, TableId};

fn alice_row() -> InsertSpec {
    InsertSpec::new([("id", Value::from(1)), ("name", Value::from("Alice"))])
}

#[tokio::test]
async fn test_insert_then_read_page() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");

    let (row_key, entry) = service.insert_row(USERS, &alice_row(), &bob).await.unwrap();
    assert_eq!(row_key, "1");
    assert_eq!(entry.kind, MutationKind::Insert);
    assert_eq!(entry.new_value, Some(serde_json::json!({"id": 1, "name": "Alice"})));

    let spec = QuerySpec::builder().limit(10).build().unwrap();
    let data = service
        .get_table_data(&fixture.users_config(), &spec)
        .await
        .unwrap();
    assert_eq!(data.columns, ["id", "name"]);
    assert_eq!(data.rows, vec![vec![Value::Integer(1), Value::from("Alice")]]);
}

#[tokio::test]
async fn test_inserted_row_reads_back_identically() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");

    let spec = InsertSpec::new([("name", Value::from("Zoë \"quoted\" 'name'"))]);
    let (row_key, _) = service.insert_row(USERS, &spec, &bob).await.unwrap();

    let key: i64 = row_key.parse().unwrap();
    let query = QuerySpec::builder()
        .filter(ConditionList::and(vec![Condition::eq("id", key).unwrap().into()]).unwrap())
        .build()
        .unwrap();
    let data = service.read_table(USERS, &query, &bob).await.unwrap();
    let records = data.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], Value::Integer(key));
    assert_eq!(records[0]["name"], spec.values()["name"]);
}

#[tokio::test]
async fn test_read_never_exceeds_limit() {
    let fixture = TestFixture::new();
    {
        let conn = fixture.app_conn();
        for i in 1..=20 {
            conn.execute("INSERT INTO users (id, name) VALUES (?1, ?2)", (i, format!("user{i}")))
                .unwrap();
        }
    }
    let service = fixture.service();
    let reader = Actor::new("reader");

    for limit in [0, 1, 7, 20, 50] {
        let spec = QuerySpec::builder().limit(limit).build().unwrap();
        let data = service.read_table(USERS, &spec, &reader).await.unwrap();
        assert!((data.rows.len() as i64) <= limit, "limit {limit} returned {}", data.rows.len());
    }

    let page = QuerySpec::builder()
        .order_by(OrderItem::desc("id"))
        .limit(5)
        .offset(5)
        .build()
        .unwrap();
    let data = service.read_table(USERS, &page, &reader).await.unwrap();
    let ids: Vec<_> = data.rows.iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, (11..=15).rev().map(Value::Integer).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_read_with_json_query() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    for name in ["Alice", "Albert", "Bob"] {
        service
            .insert_row(USERS, &InsertSpec::new([("name", name)]), &bob)
            .await
            .unwrap();
    }

    let spec = QuerySpec::from_json(
        r#"{"filter": {"field": "name", "op": "like", "value": "Al%"},
            "order": [{"field": "name", "direction": "desc"}],
            "limit": 10}"#,
    )
    .unwrap();
    let data = service.read_table(USERS, &spec, &bob).await.unwrap();
    let names: Vec<_> = data.records().into_iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, [Value::from("Alice"), Value::from("Albert")]);
}

#[tokio::test]
async fn test_commit_edit_by_holder_records_changed_column() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    service.insert_row(USERS, &alice_row(), &bob).await.unwrap();

    service.request_edit_lock(USERS, "1", &bob).await.unwrap();
    let edit = UpdateSpec::new(1, [("name", "Alicia")]).unwrap();
    let entries = service.commit_edit(USERS, "1", &edit, &bob).await.unwrap();

    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.kind, MutationKind::Update);
    assert_eq!(entry.column.as_deref(), Some("name"));
    assert_eq!(entry.old_value, Some(serde_json::json!("Alice")));
    assert_eq!(entry.new_value, Some(serde_json::json!("Alicia")));
    assert_eq!(entry.actor, "bob");

    // The lock survives the write.
    assert_eq!(service.locks().holder(USERS, "1").unwrap().holder, "bob");

    let history = service.row_history(USERS, "1").await.unwrap();
    let kinds: Vec<_> = history.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, [MutationKind::Insert, MutationKind::Update]);
}

#[tokio::test]
async fn test_commit_edit_by_non_holder_is_denied() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    let alice = Actor::new("alice");
    service.insert_row(USERS, &alice_row(), &bob).await.unwrap();
    service.request_edit_lock(USERS, "1", &bob).await.unwrap();

    let edit = UpdateSpec::new(1, [("name", "Mallory")]).unwrap();
    let err = service.commit_edit(USERS, "1", &edit, &alice).await.unwrap_err();
    assert!(matches!(err, DataError::WriteDenied(_)));
    assert!(err.is_conflict());

    // Nobody holds row 2 at all.
    let edit = UpdateSpec::new(2, [("name", "Nobody")]).unwrap();
    assert!(matches!(
        service.commit_edit(USERS, "2", &edit, &alice).await,
        Err(DataError::WriteDenied(_))
    ));

    let data = service
        .get_table_data(&fixture.users_config(), &QuerySpec::default())
        .await
        .unwrap();
    assert_eq!(data.rows[0][1], Value::from("Alice"));
}

#[tokio::test]
async fn test_alias_row_keys_share_one_lock() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    let alice = Actor::new("alice");
    service.insert_row(USERS, &alice_row(), &bob).await.unwrap();
    service.request_edit_lock(USERS, "1", &bob).await.unwrap();

    for alias in ["01", " 1", "1"] {
        match service.request_edit_lock(USERS, alias, &alice).await {
            Err(DataError::RowLocked { holder, .. }) => assert_eq!(holder, "bob"),
            other => panic!("expected RowLocked for {alias:?}, got {other:?}"),
        }
    }
    let edit = UpdateSpec::new("01", [("name", "Mallory")]).unwrap();
    assert!(matches!(
        service.commit_edit(USERS, "01", &edit, &alice).await,
        Err(DataError::WriteDenied(_))
    ));

    let lock = service.request_edit_lock(USERS, "01", &bob).await.unwrap();
    assert_eq!(lock.row_key, "1");
    let edit = UpdateSpec::new("01", [("name", "Alicia")]).unwrap();
    let entries = service.commit_edit(USERS, "01", &edit, &bob).await.unwrap();
    assert_eq!(entries[0].row_key, "1");

    let history = service.row_history(USERS, "1").await.unwrap();
    let kinds: Vec<_> = history.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, [MutationKind::Insert, MutationKind::Update]);
}

#[tokio::test]
async fn test_update_key_must_name_the_locked_row() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    service.insert_row(USERS, &alice_row(), &bob).await.unwrap();
    let second = InsertSpec::new([("id", Value::from(2)), ("name", Value::from("Bob"))]);
    service.insert_row(USERS, &second, &bob).await.unwrap();
    service.request_edit_lock(USERS, "1", &bob).await.unwrap();

    let edit = UpdateSpec::new(2, [("name", "Robert")]).unwrap();
    assert!(matches!(
        service.commit_edit(USERS, "1", &edit, &bob).await,
        Err(DataError::QuerySyntax(msg)) if msg.contains("`2`")
    ));

    let data = service
        .get_table_data(&fixture.users_config(), &QuerySpec::default())
        .await
        .unwrap();
    let names: Vec<_> = data.records().into_iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, [Value::from("Alice"), Value::from("Bob")]);
    assert_eq!(service.row_history(USERS, "1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unchanged_edit_writes_no_entries() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    service.insert_row(USERS, &alice_row(), &bob).await.unwrap();
    service.request_edit_lock(USERS, "1", &bob).await.unwrap();

    let edit = UpdateSpec::new(1, [("name", "Alice")]).unwrap();
    let entries = service.commit_edit(USERS, "1", &edit, &bob).await.unwrap();
    assert!(entries.is_empty());
    assert_eq!(service.row_history(USERS, "1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_edit_of_missing_row_is_not_found() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    service.request_edit_lock(USERS, "99", &bob).await.unwrap();

    let edit = UpdateSpec::new(99, [("name", "Ghost")]).unwrap();
    assert!(matches!(
        service.commit_edit(USERS, "99", &edit, &bob).await,
        Err(DataError::RowNotFound(key)) if key == "99"
    ));
    assert!(service.row_history(USERS, "99").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_edit_of_unknown_column_is_rejected() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    service.insert_row(USERS, &alice_row(), &bob).await.unwrap();
    service.request_edit_lock(USERS, "1", &bob).await.unwrap();

    let edit = UpdateSpec::new(1, [("salary", 100)]).unwrap();
    assert!(matches!(
        service.commit_edit(USERS, "1", &edit, &bob).await,
        Err(DataError::QuerySyntax(_))
    ));
}

#[tokio::test]
async fn test_delete_requires_lock_and_records_whole_row() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    let alice = Actor::new("alice");
    service.insert_row(USERS, &alice_row(), &bob).await.unwrap();

    assert!(matches!(
        service.delete_row(USERS, "1", &alice).await,
        Err(DataError::WriteDenied(_))
    ));
    assert_eq!(fixture.user_count(), 1);

    service.request_edit_lock(USERS, "1", &alice).await.unwrap();
    let entry = service.delete_row(USERS, "1", &alice).await.unwrap();
    assert_eq!(entry.kind, MutationKind::Delete);
    assert!(entry.column.is_none());
    assert!(entry.new_value.is_none());
    assert_eq!(entry.old_value, Some(serde_json::json!({"id": 1, "name": "Alice"})));
    assert_eq!(fixture.user_count(), 0);
}

#[tokio::test]
async fn test_audit_failure_rolls_back_mutation() {
    init_test_tracing();
    let fixture = TestFixture::new();
    fixture
        .app_conn()
        .execute("INSERT INTO users (id, name) VALUES (1, 'Alice')", [])
        .unwrap();
    let service = fixture.service();
    let bob = Actor::new("bob");
    service.request_edit_lock(USERS, "1", &bob).await.unwrap();

    // Break the audit store underneath the service.
    rusqlite::Connection::open(&fixture.audit_db)
        .unwrap()
        .execute_batch("DROP TABLE audit_log")
        .unwrap();

    let edit = UpdateSpec::new(1, [("name", "Alicia")]).unwrap();
    let err = service.commit_edit(USERS, "1", &edit, &bob).await.unwrap_err();
    assert!(matches!(
        err,
        DataError::AuditWriteFailed {
            reconciliation_required: false,
            ..
        }
    ));

    let name: String = fixture
        .app_conn()
        .query_row("SELECT name FROM users WHERE id = 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(name, "Alice");

    let insert = InsertSpec::new([("id", Value::from(2)), ("name", Value::from("Bob"))]);
    assert!(matches!(
        service.insert_row(USERS, &insert, &bob).await,
        Err(DataError::AuditWriteFailed { .. })
    ));
    assert_eq!(fixture.user_count(), 1);
}

#[tokio::test]
async fn test_access_policy_is_consulted() {
    let fixture = TestFixture::new();
    let policy = |actor: &Actor, _: TableId, access: Access| {
        access == Access::Read || actor.name == "editor"
    };
    let service = fixture.service().with_policy(Arc::new(policy));
    let viewer = Actor::new("viewer");
    let editor = Actor::new("editor");

    assert!(matches!(
        service.insert_row(USERS, &alice_row(), &viewer).await,
        Err(DataError::AccessDenied { access: Access::Write, .. })
    ));
    assert!(matches!(
        service.request_edit_lock(USERS, "1", &viewer).await,
        Err(DataError::AccessDenied { .. })
    ));

    service.insert_row(USERS, &alice_row(), &editor).await.unwrap();
    let data = service
        .read_table(USERS, &QuerySpec::default(), &viewer)
        .await
        .unwrap();
    assert_eq!(data.rows.len(), 1);
}

#[tokio::test]
async fn test_unknown_table_id() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");

    assert!(matches!(
        service.insert_row(42, &alice_row(), &bob).await,
        Err(DataError::UnknownTable(42))
    ));
    assert!(matches!(
        service.request_edit_lock(42, "1", &bob).await,
        Err(DataError::UnknownTable(42))
    ));
}

#[tokio::test]
async fn test_forced_release_is_audited() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    let alice = Actor::new("alice");
    let admin = Actor::elevated("admin");

    service.request_edit_lock(USERS, "1", &bob).await.unwrap();

    assert_eq!(
        service.release_edit_lock(USERS, "1", &alice).await.unwrap(),
        LockRelease::HeldByOther {
            holder: "bob".into()
        }
    );

    let (previous_holder, entry) = match service.release_edit_lock(USERS, "1", &admin).await {
        Ok(LockRelease::ForceReleased {
            previous_holder,
            entry,
        }) => (previous_holder, entry),
        other => panic!("expected a forced release, got {other:?}"),
    };
    assert_eq!(previous_holder, "bob");
    assert_eq!(entry.kind, MutationKind::LockOverride);
    assert_eq!(entry.actor, "admin");

    assert_eq!(
        service.release_edit_lock(USERS, "1", &bob).await.unwrap(),
        LockRelease::AlreadyReleased
    );
    service.request_edit_lock(USERS, "1", &alice).await.unwrap();

    let by_admin = service.actor_history("admin", 10).await.unwrap();
    assert_eq!(by_admin, vec![entry]);
}

#[tokio::test]
async fn test_forced_release_keeps_lock_when_audit_fails() {
    init_test_tracing();
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    let admin = Actor::elevated("admin");
    service.request_edit_lock(USERS, "1", &bob).await.unwrap();

    rusqlite::Connection::open(&fixture.audit_db)
        .unwrap()
        .execute_batch("DROP TABLE audit_log")
        .unwrap();

    assert!(matches!(
        service.release_edit_lock(USERS, "1", &admin).await,
        Err(DataError::AuditWriteFailed {
            reconciliation_required: false,
            ..
        })
    ));
    assert_eq!(service.locks().holder(USERS, "1").unwrap().holder, "bob");
}

#[tokio::test]
async fn test_history_queries() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    let before = datagate::now_millis();

    for name in ["a", "b", "c"] {
        service
            .insert_row(USERS, &InsertSpec::new([("name", name)]), &bob)
            .await
            .unwrap();
    }

    let recent = service.table_history(USERS, 2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].row_key, "3");
    assert_eq!(recent[1].row_key, "2");

    let window = service
        .history_between(before, datagate::now_millis() + 1)
        .await
        .unwrap();
    assert_eq!(window.len(), 3);
    assert!(service.history_between(0, before).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registry_swap_applies_to_later_operations() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");
    service.insert_row(USERS, &alice_row(), &bob).await.unwrap();

    let previous = service.swap_registry(ConnectorRegistry::builder().build());
    assert_eq!(previous.kinds().len(), 3);
    assert!(matches!(
        service.read_table(USERS, &QuerySpec::default(), &bob).await,
        Err(DataError::UnknownDatasource(kind)) if kind == "sqlite"
    ));

    let sqlite_only = ConnectorRegistry::builder()
        .register(Arc::new(SqliteConnector::new(PoolSettings::default())))
        .unwrap()
        .build();
    service.swap_registry(sqlite_only);
    let data = service.read_table(USERS, &QuerySpec::default(), &bob).await.unwrap();
    assert_eq!(data.rows.len(), 1);
    previous.shutdown().await;
}
