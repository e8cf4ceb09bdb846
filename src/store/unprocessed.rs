//! The unprocessed envelope queue, present in both stores.
//!
//! The main store holds a legacy copy that is drained into the accelerator
//! once at startup; after that only the accelerator's queue is live.

use libsql::Value;
use libsql::params::Params;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{DatabaseError, Result};
use crate::store::engine::Engine;
use crate::store::records::{
    Column, OnConflict, RecordTable, parse_document, query_count, query_documents, save_records,
};

pub static UNPROCESSED: RecordTable = RecordTable {
    name: "unprocessed",
    key: "id",
    columns: &[
        Column::integer("timestamp"),
        Column::integer("receivedAtCounter"),
        Column::integer("attempts"),
    ],
};

/// Rows with more attempts than this are dropped on the next read.
pub const MAX_ATTEMPTS: i64 = 3;

/// Options of `saveUnprocesseds`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveOptions {
    /// Overwrite an existing row with the same id instead of keeping it.
    pub force_save: bool,
}

pub async fn count(engine: &mut Engine) -> Result<i64> {
    query_count(engine, "SELECT count(*) FROM unprocessed", vec![]).await
}

/// Insert a batch in one transaction. Returns the number of items given.
pub async fn save_all(engine: &mut Engine, items: &[Json], options: SaveOptions) -> Result<usize> {
    let on_conflict = if options.force_save {
        OnConflict::Replace
    } else {
        OnConflict::Ignore
    };
    save_records(engine, &UNPROCESSED, items, on_conflict).await
}

/// One page of the queue in key order.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Json>,
    /// Key column of the last row. Continue with this as `after`.
    pub last_id: Option<String>,
}

/// Up to `limit` rows whose key is strictly after `after`, in key order.
///
/// The cursor is the stored key column rather than the document's `id`
/// field, which may be a number.
pub async fn page(engine: &mut Engine, after: Option<&str>, limit: u32) -> Result<Page> {
    let after = after
        .map(|id| Value::Text(id.to_string()))
        .unwrap_or(Value::Null);
    let stmt = engine
        .prepare_cached(
            "SELECT id, json FROM unprocessed \
             WHERE ?1 IS NULL OR id > ?1 ORDER BY id ASC LIMIT ?2",
        )
        .await?;
    let query = |e: libsql::Error| DatabaseError::Query(format!("unprocessed_page: {e}"));
    let rows: std::result::Result<Vec<(String, String)>, DatabaseError> = async {
        let mut rows = stmt
            .query(Params::Positional(vec![after, Value::Integer(i64::from(limit))]))
            .await
            .map_err(query)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query)? {
            out.push((row.get(0).map_err(query)?, row.get(1).map_err(query)?));
        }
        Ok(out)
    }
    .await;
    stmt.reset();

    let rows = rows?;
    let last_id = rows.last().map(|(id, _)| id.clone());
    let items = rows
        .iter()
        .map(|(_, text)| parse_document(UNPROCESSED.name, text))
        .collect::<Result<Vec<_>>>()?;
    Ok(Page { items, last_id })
}

pub async fn remove_all(engine: &mut Engine) -> Result<u64> {
    let changed = engine
        .connection()?
        .execute("DELETE FROM unprocessed", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("remove_all_unprocessed: {e}")))?;
    Ok(changed)
}

/// Bump every row's attempt count, drop rows past [`MAX_ATTEMPTS`], and
/// return the survivors oldest first.
pub async fn take_all_incrementing_attempts(engine: &mut Engine) -> Result<Vec<Json>> {
    engine.begin().await?;
    let result: Result<Vec<Json>> = async {
        let conn = engine.connection()?;
        conn.execute(
            "UPDATE unprocessed SET
                attempts = COALESCE(attempts, 0) + 1,
                json = json_set(json, '$.attempts', COALESCE(attempts, 0) + 1)",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("increment_attempts: {e}")))?;
        let dropped = conn
            .execute(
                "DELETE FROM unprocessed WHERE attempts > ?1",
                libsql::params![MAX_ATTEMPTS],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("drop_exhausted: {e}")))?;
        if dropped > 0 {
            tracing::info!(dropped, "Dropped unprocessed envelopes past retry limit");
        }
        query_documents(
            engine,
            UNPROCESSED.name,
            "SELECT json FROM unprocessed ORDER BY receivedAtCounter ASC, timestamp ASC",
            vec![],
        )
        .await
    }
    .await;
    engine.finish(result).await
}

pub async fn remove_ids(engine: &mut Engine, ids: &[String], chunk_limit: usize) -> Result<u64> {
    let values: Vec<Value> = ids.iter().cloned().map(Value::Text).collect();
    crate::store::query::chunked_execute(
        engine.connection()?,
        "DELETE FROM unprocessed WHERE id IN ($values)",
        &values,
        chunk_limit,
    )
    .await
}
