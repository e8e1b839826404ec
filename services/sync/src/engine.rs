//! Applies one page of remote project nodes to local storage.
//!
//! Each page is a single transaction: referenced rows first, then every node
//! upserted keyed on its remote id, then the sync watermark. A failure rolls
//! the whole page back so the persisted cursor never runs ahead of the data.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::error::SyncError;
use crate::fields::{FieldValue, PROJECT_FIELDS};
use tidemark_db::sync::models::SyncState;
use tidemark_db::sync::store::SyncStateStore;

/// Remote fields that reference shared dimension values, in storage column
/// order (`xgl_id`, `gl_object1_id`..`gl_object5_id`).
const OBJECT_VALUE_FIELDS: &[&str] = &[
    "xgl",
    "glObject1",
    "glObject2",
    "glObject3",
    "glObject4",
    "glObject5",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOutcome {
    pub should_continue: bool,
    pub next_cursor: Option<String>,
}

/// Remote id to local surrogate id, scoped to one page's transaction.
#[derive(Default)]
struct ReferenceCache {
    projects: HashMap<i64, i64>,
    object_values: HashMap<i64, i64>,
}

#[derive(Clone)]
pub struct PageProcessor {
    pool: SqlitePool,
    store: SyncStateStore,
}

impl PageProcessor {
    pub fn new(pool: SqlitePool, store: SyncStateStore) -> Self {
        Self { pool, store }
    }

    /// Apply one page-shaped response document and advance `state` to match
    /// what was committed.
    pub async fn apply_page(
        &self,
        response: &Value,
        state: &mut SyncState,
    ) -> Result<PageOutcome, SyncError> {
        let connection = response
            .pointer("/data/projects")
            .ok_or_else(|| malformed("response missing data.projects"))?;
        let edges = connection
            .get("edges")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("connection missing edges array"))?;
        let should_continue = connection
            .pointer("/pageInfo/hasNextPage")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let ids: Vec<i64> = edges
            .iter()
            .filter_map(|e| e.pointer("/node/dbId").and_then(Value::as_i64))
            .collect();
        tracing::debug!(count = ids.len(), ?ids, "upserting project page");

        let mut tx = self.pool.begin().await?;
        let mut cache = ReferenceCache::default();
        for edge in edges {
            let node = node_of(edge)?;
            resolve_references(&mut tx, node, &mut cache).await?;
        }

        let mut next_cursor = None;
        for edge in edges {
            if let Some(cursor) = edge.get("cursor").and_then(Value::as_str) {
                next_cursor = Some(cursor.to_string());
            }
            upsert_project(&mut tx, node_of(edge)?, &cache).await?;
        }

        state.cursor = next_cursor.clone();
        state.as_of = Utc::now();
        self.store.save_with(&mut *tx, state).await?;
        tx.commit().await?;

        Ok(PageOutcome {
            should_continue,
            next_cursor,
        })
    }
}

fn node_of(edge: &Value) -> Result<&Value, SyncError> {
    edge.get("node")
        .filter(|n| n.is_object())
        .ok_or_else(|| malformed("edge missing node object"))
}

fn malformed(context: &str) -> SyncError {
    SyncError::Malformed(context.to_string())
}

/// Make sure every row a node references exists, filling the cache with the
/// surrogate ids the node upsert will bind.
async fn resolve_references(
    tx: &mut Transaction<'_, Sqlite>,
    node: &Value,
    cache: &mut ReferenceCache,
) -> Result<(), SyncError> {
    if let Some(remote_id) = reference_remote_id(node, "mainProject")? {
        if !cache.projects.contains_key(&remote_id) {
            let id = ensure_project_stub(tx, remote_id).await?;
            cache.projects.insert(remote_id, id);
        }
    }

    for field in OBJECT_VALUE_FIELDS {
        let Some(reference) = node.get(*field).filter(|v| v.is_object()) else {
            continue;
        };
        let remote_id = reference
            .get("dbId")
            .and_then(Value::as_i64)
            .ok_or_else(|| malformed("reference missing dbId"))?;
        // The remote encodes "no reference" as id zero.
        if remote_id == 0 || cache.object_values.contains_key(&remote_id) {
            continue;
        }
        let code = reference.get("code").and_then(Value::as_str);
        let id = upsert_object_value(tx, remote_id, code).await?;
        cache.object_values.insert(remote_id, id);
    }
    Ok(())
}

/// Remote id behind a reference field, with id zero normalized to `None`.
fn reference_remote_id(node: &Value, field: &str) -> Result<Option<i64>, SyncError> {
    match node.get(field).filter(|v| v.is_object()) {
        Some(reference) => {
            let remote_id = reference
                .get("dbId")
                .and_then(Value::as_i64)
                .ok_or_else(|| malformed("reference missing dbId"))?;
            Ok((remote_id != 0).then_some(remote_id))
        }
        None => Ok(None),
    }
}

/// Insert a bare project row for a parent that has not been synced yet. Its
/// own page will later fill the remaining columns through the normal upsert.
async fn ensure_project_stub(
    tx: &mut Transaction<'_, Sqlite>,
    remote_id: i64,
) -> Result<i64, SyncError> {
    let inserted =
        sqlx::query("insert into project (remote_db_id) values (?1) on conflict do nothing returning id")
            .bind(remote_id)
            .fetch_optional(&mut **tx)
            .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let row = sqlx::query("select id from project where remote_db_id = ?1")
        .bind(remote_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row.get("id"))
}

async fn upsert_object_value(
    tx: &mut Transaction<'_, Sqlite>,
    remote_id: i64,
    code: Option<&str>,
) -> Result<i64, SyncError> {
    let row = sqlx::query(
        "insert into object_value (remote_db_id, code) values (?1, ?2)
         on conflict (remote_db_id) do update set code = excluded.code
         returning id",
    )
    .bind(remote_id)
    .bind(code)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get("id"))
}

async fn upsert_project(
    tx: &mut Transaction<'_, Sqlite>,
    node: &Value,
    cache: &ReferenceCache,
) -> Result<(), SyncError> {
    let remote_id = node
        .get("dbId")
        .and_then(Value::as_i64)
        .ok_or_else(|| malformed("node missing dbId"))?;

    let mut query = sqlx::query(project_upsert_sql()).bind(remote_id);

    let main_project = reference_remote_id(node, "mainProject")?
        .and_then(|rid| cache.projects.get(&rid).copied());
    query = query.bind(main_project);
    for field in OBJECT_VALUE_FIELDS {
        let object_value = reference_remote_id(node, field)?
            .and_then(|rid| cache.object_values.get(&rid).copied());
        query = query.bind(object_value);
    }

    for mapping in PROJECT_FIELDS {
        let decoded = mapping
            .kind
            .decode(node.get(mapping.remote_name).unwrap_or(&Value::Null))
            .map_err(|e| malformed(&format!("field {}: {e}", mapping.remote_name)))?;
        query = match decoded {
            Some(FieldValue::Text(text)) => query.bind(text),
            Some(FieldValue::Integer(n)) => query.bind(n),
            Some(FieldValue::Real(x)) => query.bind(x),
            None => query.bind(None::<String>),
        };
    }

    query.execute(&mut **tx).await?;
    Ok(())
}

/// Upsert statement over the full column set, derived from the mapping table
/// so the two cannot drift apart.
fn project_upsert_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let mut columns = vec![
            "remote_db_id",
            "main_project_id",
            "xgl_id",
            "gl_object1_id",
            "gl_object2_id",
            "gl_object3_id",
            "gl_object4_id",
            "gl_object5_id",
        ];
        columns.extend(PROJECT_FIELDS.iter().map(|f| f.column));

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .skip(1)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        format!(
            "insert into project ({}) values ({})\non conflict (remote_db_id) do update set {}",
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", "),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidemark_db::sync::models::SyncPhase;
    use tidemark_db::{create_memory_pool, schema::ensure_schema};

    async fn test_processor() -> (PageProcessor, SqlitePool) {
        let pool = create_memory_pool().await.expect("pool");
        ensure_schema(&pool).await.expect("schema");
        let store = SyncStateStore::new(pool.clone());
        (PageProcessor::new(pool.clone(), store), pool)
    }

    fn node(db_id: i64, code: &str) -> Value {
        json!({
            "dbId": db_id,
            "code": code,
            "description": format!("Project {code}"),
            "billable": true,
            "pctCompleted": 40.0,
            "totalRevenue": "1500.25",
            "fromDate": "2024-01-01",
            "modifiedAt": "2024-01-15T10:30:00",
            "mainProject": {"dbId": 0},
            "xgl": {"dbId": 0, "code": null}
        })
    }

    fn page(edges: Vec<Value>, has_next: bool) -> Value {
        json!({
            "data": {
                "projects": {
                    "pageInfo": {"hasNextPage": has_next},
                    "edges": edges
                }
            }
        })
    }

    fn edge(cursor: &str, node: Value) -> Value {
        json!({"cursor": cursor, "node": node})
    }

    async fn project_count(pool: &SqlitePool) -> i64 {
        sqlx::query("select count(*) as n from project")
            .fetch_one(pool)
            .await
            .unwrap()
            .get("n")
    }

    #[tokio::test]
    async fn page_is_upserted_and_cursor_advances() {
        let (processor, pool) = test_processor().await;
        let mut state = SyncState::begin("Project");
        let before = state.as_of;

        let outcome = processor
            .apply_page(
                &page(vec![edge("c1", node(1, "A")), edge("c2", node(2, "B"))], true),
                &mut state,
            )
            .await
            .expect("apply");

        assert!(outcome.should_continue);
        assert_eq!(outcome.next_cursor.as_deref(), Some("c2"));
        assert_eq!(state.cursor.as_deref(), Some("c2"));
        assert!(state.as_of >= before);
        assert_eq!(project_count(&pool).await, 2);

        let row = sqlx::query("select code, billable, total_revenue, modified_at from project where remote_db_id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("code"), "A");
        assert_eq!(row.get::<i64, _>("billable"), 1);
        assert_eq!(row.get::<String, _>("total_revenue"), "1500.25");
        assert_eq!(
            row.get::<String, _>("modified_at"),
            "2024-01-15T09:30:00+00:00"
        );
    }

    #[tokio::test]
    async fn two_page_sequence_ends_on_the_final_cursor() {
        let (processor, pool) = test_processor().await;
        let store = SyncStateStore::new(pool.clone());
        let mut state = SyncState::begin("Project");

        let first = processor
            .apply_page(&page(vec![edge("c1", node(1, "A"))], true), &mut state)
            .await
            .expect("page one");
        assert!(first.should_continue);

        let second = processor
            .apply_page(&page(vec![edge("c2", node(2, "B"))], false), &mut state)
            .await
            .expect("page two");
        assert!(!second.should_continue);

        let persisted = store.fetch("Project").await.unwrap().unwrap();
        assert_eq!(persisted.cursor.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards_across_pages() {
        let (processor, _pool) = test_processor().await;
        let mut state = SyncState::begin("Project");

        processor
            .apply_page(&page(vec![edge("c1", node(1, "A"))], true), &mut state)
            .await
            .expect("page one");
        let after_first = state.as_of;

        processor
            .apply_page(&page(vec![edge("c2", node(2, "B"))], false), &mut state)
            .await
            .expect("page two");
        assert!(state.as_of >= after_first);
    }

    #[tokio::test]
    async fn reapplying_a_page_does_not_duplicate_rows() {
        let (processor, pool) = test_processor().await;
        let mut state = SyncState::begin("Project");
        let p = page(vec![edge("c1", node(1, "A"))], false);

        processor.apply_page(&p, &mut state).await.expect("first");
        let first_id: i64 = sqlx::query("select id from project where remote_db_id = 1")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("id");

        processor.apply_page(&p, &mut state).await.expect("second");
        assert_eq!(project_count(&pool).await, 1);
        let second_id: i64 = sqlx::query("select id from project where remote_db_id = 1")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("id");
        assert_eq!(first_id, second_id);
    }

    #[tokio::test]
    async fn zero_reference_ids_store_null() {
        let (processor, pool) = test_processor().await;
        let mut state = SyncState::begin("Project");

        processor
            .apply_page(&page(vec![edge("c1", node(1, "A"))], false), &mut state)
            .await
            .expect("apply");

        let row = sqlx::query("select main_project_id, xgl_id from project where remote_db_id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<Option<i64>, _>("main_project_id"), None);
        assert_eq!(row.get::<Option<i64>, _>("xgl_id"), None);
    }

    #[tokio::test]
    async fn unseen_parent_gets_a_stub_row() {
        let (processor, pool) = test_processor().await;
        let mut state = SyncState::begin("Project");

        let mut child = node(5, "CHILD");
        child["mainProject"] = json!({"dbId": 99});
        processor
            .apply_page(&page(vec![edge("c1", child)], false), &mut state)
            .await
            .expect("apply");

        assert_eq!(project_count(&pool).await, 2);
        let stub = sqlx::query("select id, code from project where remote_db_id = 99")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stub.get::<Option<String>, _>("code"), None);

        let child_row = sqlx::query("select main_project_id from project where remote_db_id = 5")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(
            child_row.get::<Option<i64>, _>("main_project_id"),
            Some(stub.get::<i64, _>("id"))
        );
    }

    #[tokio::test]
    async fn shared_object_values_resolve_to_one_row() {
        let (processor, pool) = test_processor().await;
        let mut state = SyncState::begin("Project");

        let mut a = node(1, "A");
        a["xgl"] = json!({"dbId": 7, "code": "DEPT-7"});
        let mut b = node(2, "B");
        b["xgl"] = json!({"dbId": 7, "code": "DEPT-7"});
        b["glObject1"] = json!({"dbId": 8, "code": "REGION-8"});

        processor
            .apply_page(&page(vec![edge("c1", a), edge("c2", b)], false), &mut state)
            .await
            .expect("apply");

        let n: i64 = sqlx::query("select count(*) as n from object_value")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(n, 2);

        let xgl_ids: Vec<Option<i64>> = sqlx::query("select xgl_id from project order by remote_db_id")
            .fetch_all(&pool)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.get("xgl_id"))
            .collect();
        assert_eq!(xgl_ids[0], xgl_ids[1]);
        assert!(xgl_ids[0].is_some());
    }

    #[tokio::test]
    async fn malformed_node_rolls_back_the_whole_page() {
        let (processor, pool) = test_processor().await;
        let store = SyncStateStore::new(pool.clone());
        let mut state = SyncState::begin("Project");
        state.cursor = Some("old".into());
        store.save(&state).await.expect("seed state");

        let mut bad = node(2, "B");
        bad["billable"] = json!("yes");
        let result = processor
            .apply_page(
                &page(vec![edge("c1", node(1, "A")), edge("c2", bad)], true),
                &mut state,
            )
            .await;

        assert!(matches!(result, Err(SyncError::Malformed(_))));
        assert_eq!(project_count(&pool).await, 0);
        let persisted = store.fetch("Project").await.unwrap().unwrap();
        assert_eq!(persisted.cursor.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn state_row_commits_with_the_page() {
        let (processor, pool) = test_processor().await;
        let store = SyncStateStore::new(pool.clone());
        let mut state = SyncState::begin("Project");
        store.save(&state).await.expect("seed state");

        processor
            .apply_page(&page(vec![edge("c9", node(1, "A"))], false), &mut state)
            .await
            .expect("apply");

        let persisted = store.fetch("Project").await.unwrap().unwrap();
        assert_eq!(persisted.cursor.as_deref(), Some("c9"));
        assert_eq!(persisted.phase, SyncPhase::CursorSyncing);
        assert_eq!(persisted.as_of, state.as_of);
    }

    #[tokio::test]
    async fn empty_page_stops_pagination() {
        let (processor, _pool) = test_processor().await;
        let mut state = SyncState::begin("Project");

        let outcome = processor
            .apply_page(&page(vec![], false), &mut state)
            .await
            .expect("apply");
        assert!(!outcome.should_continue);
        assert_eq!(outcome.next_cursor, None);
    }
}
