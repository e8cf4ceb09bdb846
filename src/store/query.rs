//! Query helpers: chunked multi-value queries and full-text search.

use std::sync::LazyLock;

use libsql::params::Params;
use libsql::{Connection, Row, Value};
use regex::Regex;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::error::{DatabaseError, Result};
use crate::store::records::parse_document;

/// Placeholder in chunked query templates replaced by `?, ?, ...`.
pub const VALUES_PLACEHOLDER: &str = "$values";

fn expand(template: &str, prefix: usize, count: usize) -> String {
    let placeholders = (prefix + 1..=prefix + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    template.replace(VALUES_PLACEHOLDER, &placeholders)
}

fn chunk_params(fixed: &[Value], chunk: &[Value]) -> Params {
    let mut params = fixed.to_vec();
    params.extend_from_slice(chunk);
    Params::Positional(params)
}

/// Run `template` once per chunk of `values`, concatenating mapped rows in
/// chunk order.
///
/// `fixed` parameters are bound first (`?1..`), followed by the chunk
/// values substituted for `$values`. Lists larger than `chunk_limit` run in
/// one shared transaction; smaller lists run as a single plain query.
pub async fn chunked_query<T, F>(
    conn: &Connection,
    template: &str,
    fixed: &[Value],
    values: &[Value],
    chunk_limit: usize,
    mut map: F,
) -> Result<Vec<T>>
where
    F: FnMut(&Row) -> Result<T>,
{
    let limit = chunk_limit.max(1);
    if values.len() <= limit {
        return run_chunk(conn, template, fixed, values, &mut map).await;
    }

    let tx = conn
        .transaction()
        .await
        .map_err(|e| DatabaseError::Query(format!("chunked_query begin: {e}")))?;
    let mut out = Vec::new();
    for chunk in values.chunks(limit) {
        match run_chunk(&tx, template, fixed, chunk, &mut map).await {
            Ok(rows) => out.extend(rows),
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
    }
    tx.commit()
        .await
        .map_err(|e| DatabaseError::Query(format!("chunked_query commit: {e}")))?;
    debug!(values = values.len(), chunks = values.len().div_ceil(limit), "Chunked query");
    Ok(out)
}

async fn run_chunk<T, F>(
    conn: &Connection,
    template: &str,
    fixed: &[Value],
    chunk: &[Value],
    map: &mut F,
) -> Result<Vec<T>>
where
    F: FnMut(&Row) -> Result<T>,
{
    if chunk.is_empty() {
        return Ok(Vec::new());
    }
    let sql = expand(template, fixed.len(), chunk.len());
    let mut rows = conn
        .query(&sql, chunk_params(fixed, chunk))
        .await
        .map_err(|e| DatabaseError::Query(format!("chunked_query: {e}")))?;
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("chunked_query: {e}")))?
    {
        out.push(map(&row)?);
    }
    Ok(out)
}

/// Chunked counterpart of `chunked_query` for statements without rows.
/// Returns the total number of changed rows.
pub async fn chunked_execute(
    conn: &Connection,
    template: &str,
    values: &[Value],
    chunk_limit: usize,
) -> Result<u64> {
    let limit = chunk_limit.max(1);
    if values.is_empty() {
        return Ok(0);
    }
    if values.len() <= limit {
        return execute_chunk(conn, template, values).await;
    }

    let tx = conn
        .transaction()
        .await
        .map_err(|e| DatabaseError::Query(format!("chunked_execute begin: {e}")))?;
    let mut changed = 0;
    for chunk in values.chunks(limit) {
        match execute_chunk(&tx, template, chunk).await {
            Ok(n) => changed += n,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
    }
    tx.commit()
        .await
        .map_err(|e| DatabaseError::Query(format!("chunked_execute commit: {e}")))?;
    Ok(changed)
}

async fn execute_chunk(conn: &Connection, template: &str, chunk: &[Value]) -> Result<u64> {
    let sql = expand(template, 0, chunk.len());
    let changed = conn
        .execute(&sql, Params::Positional(chunk.to_vec()))
        .await
        .map_err(|e| DatabaseError::Query(format!("chunked_execute: {e}")))?;
    Ok(changed as u64)
}

/// One full-text match.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub document: Json,
    pub snippet: String,
}

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\p{L}\p{N}\s]+").unwrap()
});

/// Turn free text into an fts5 prefix query: every word becomes `"word"*`.
/// Returns `None` when nothing searchable remains.
pub fn fts_query(raw: &str) -> Option<String> {
    let cleaned = NON_WORD.replace_all(raw, " ");
    let terms: Vec<String> = cleaned
        .split_whitespace()
        .map(|term| format!("\"{term}\"*"))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Search message bodies.
///
/// Matches are staged in two temp tables inside one transaction: every
/// matching rowid, then the subset that survives the conversation and
/// visibility filters, newest first, capped at `limit`. Documents and
/// highlighted snippets are read by joining back. Both temp tables are
/// dropped before the transaction ends, whatever the outcome.
pub async fn search_messages(
    conn: &Connection,
    query: &str,
    conversation_id: Option<&str>,
    limit: u32,
) -> Result<Vec<SearchHit>> {
    let Some(fts) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let tx = conn
        .transaction()
        .await
        .map_err(|e| DatabaseError::Query(format!("search begin: {e}")))?;

    let outcome = run_search(&tx, &fts, conversation_id, limit).await;
    let cleanup = tx
        .execute_batch(
            "DROP TABLE IF EXISTS temp.tmp_results;
             DROP TABLE IF EXISTS temp.tmp_filtered_results;",
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("search cleanup: {e}")));

    match (outcome, cleanup) {
        (Ok(hits), Ok(_)) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("search commit: {e}")))?;
            Ok(hits)
        }
        (Err(e), _) => {
            let _ = tx.rollback().await;
            Err(e)
        }
        (Ok(_), Err(e)) => {
            let _ = tx.rollback().await;
            Err(e.into())
        }
    }
}

async fn run_search(
    conn: &Connection,
    fts: &str,
    conversation_id: Option<&str>,
    limit: u32,
) -> Result<Vec<SearchHit>> {
    let query = |e: libsql::Error| DatabaseError::Query(format!("search: {e}"));

    conn.execute_batch(
        "CREATE TEMP TABLE tmp_results (rowid INTEGER PRIMARY KEY ASC);
         CREATE TEMP TABLE tmp_filtered_results (rowid INTEGER PRIMARY KEY ASC);",
    )
    .await
    .map_err(query)?;

    conn.execute(
        "INSERT INTO temp.tmp_results (rowid)
         SELECT rowid FROM messages_fts WHERE messages_fts.body MATCH ?1",
        libsql::params![fts],
    )
    .await
    .map_err(query)?;

    let conversation = conversation_id.map(|c| Value::Text(c.to_string())).unwrap_or(Value::Null);
    conn.execute(
        "INSERT INTO temp.tmp_filtered_results (rowid)
         SELECT tmp_results.rowid FROM temp.tmp_results
         INNER JOIN messages ON messages.rowid = tmp_results.rowid
         WHERE (?1 IS NULL OR messages.conversationId = ?1)
           AND messages.isErased IS NOT 1
           AND messages.isViewOnce IS NOT 1
           AND messages.storyId IS NULL
         ORDER BY messages.received_at DESC, messages.sent_at DESC
         LIMIT ?2",
        Params::Positional(vec![conversation, Value::Integer(i64::from(limit))]),
    )
    .await
    .map_err(query)?;

    let mut rows = conn
        .query(
            "SELECT messages.json,
                    snippet(messages_fts, -1, '<<left>>', '<<right>>', '<<truncation>>', 10)
             FROM temp.tmp_filtered_results
             INNER JOIN messages_fts ON messages_fts.rowid = tmp_filtered_results.rowid
             INNER JOIN messages ON messages.rowid = tmp_filtered_results.rowid
             WHERE messages_fts.body MATCH ?1
             ORDER BY messages.received_at DESC, messages.sent_at DESC",
            libsql::params![fts],
        )
        .await
        .map_err(query)?;

    let mut hits = Vec::new();
    while let Some(row) = rows.next().await.map_err(query)? {
        let json: String = row.get(0).map_err(query)?;
        let snippet: String = row.get(1).map_err(query)?;
        hits.push(SearchHit {
            document: parse_document("messages", &json)?,
            snippet,
        });
    }
    Ok(hits)
}
