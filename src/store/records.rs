//! Generic record storage: a JSON document plus extracted scalar columns.
//!
//! A [`RecordTable`] names the key field and the document fields that are
//! duplicated into columns. Writes bind the document and every extracted
//! column in one upsert statement, so the two never disagree.

use libsql::params::Params;
use libsql::{Statement, Value};
use serde_json::Value as Json;

use crate::error::{DatabaseError, Result};
use crate::store::engine::Engine;

/// How a document field is stored in its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    /// Stored as 0/1.
    Bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    /// Column name; also the document field it is extracted from.
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Text,
        }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Integer,
        }
    }

    pub const fn real(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Real,
        }
    }

    pub const fn boolean(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Bool,
        }
    }
}

/// A table of JSON documents keyed by one document field.
#[derive(Debug)]
pub struct RecordTable {
    pub name: &'static str,
    /// Key column and document field, usually `id`.
    pub key: &'static str,
    pub columns: &'static [Column],
}

/// What to do when a record with the same key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    Replace,
    Ignore,
}

impl RecordTable {
    fn column_names(&self) -> Vec<&'static str> {
        let mut names = vec![self.key, "json"];
        names.extend(self.columns.iter().map(|c| c.name));
        names
    }

    /// Upsert (or insert-if-absent) statement for this table.
    pub fn write_sql(&self, on_conflict: OnConflict) -> String {
        let names = self.column_names();
        let placeholders = (1..=names.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            self.name,
            names.join(", ")
        );
        match on_conflict {
            OnConflict::Ignore => format!("{insert} ON CONFLICT({}) DO NOTHING", self.key),
            OnConflict::Replace => {
                let updates = names[1..]
                    .iter()
                    .map(|n| format!("{n} = excluded.{n}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{insert} ON CONFLICT({}) DO UPDATE SET {updates}", self.key)
            }
        }
    }

    /// Bound values for a document, in `write_sql` order.
    pub fn bind(&self, doc: &Json) -> Result<Vec<Value>> {
        let object = doc.as_object().ok_or_else(|| {
            DatabaseError::Serialization(format!("{}: record must be a JSON object", self.name))
        })?;

        let key = match object.get(self.key) {
            Some(Json::String(s)) if !s.is_empty() => Value::Text(s.clone()),
            Some(Json::Number(n)) => Value::Text(n.to_string()),
            _ => {
                return Err(DatabaseError::Serialization(format!(
                    "{}: record is missing its '{}' field",
                    self.name, self.key
                ))
                .into());
            }
        };

        let json = serde_json::to_string(doc)
            .map_err(|e| DatabaseError::Serialization(format!("{}: {e}", self.name)))?;

        let mut values = vec![key, Value::Text(json)];
        values.extend(
            self.columns
                .iter()
                .map(|column| extract(column, object.get(column.name))),
        );
        Ok(values)
    }
}

fn extract(column: &Column, field: Option<&Json>) -> Value {
    match (column.kind, field) {
        (_, None | Some(Json::Null)) => Value::Null,
        (ColumnKind::Bool, Some(Json::Bool(b))) => Value::Integer(i64::from(*b)),
        (ColumnKind::Bool, Some(Json::Number(n))) => {
            Value::Integer(i64::from(n.as_f64().is_some_and(|f| f != 0.0)))
        }
        (ColumnKind::Integer, Some(Json::Number(n))) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(|f| Value::Integer(f as i64)).unwrap_or(Value::Null),
        },
        (ColumnKind::Integer, Some(Json::Bool(b))) => Value::Integer(i64::from(*b)),
        (ColumnKind::Real, Some(Json::Number(n))) => {
            n.as_f64().map(Value::Real).unwrap_or(Value::Null)
        }
        (ColumnKind::Text, Some(Json::String(s))) => Value::Text(s.clone()),
        (ColumnKind::Text, Some(Json::Number(n))) => Value::Text(n.to_string()),
        _ => Value::Null,
    }
}

/// Parse a stored document.
pub fn parse_document(table: &str, text: &str) -> Result<Json> {
    serde_json::from_str(text)
        .map_err(|e| DatabaseError::Serialization(format!("{table}: stored json: {e}")).into())
}

/// Write one record.
pub async fn save_record(
    engine: &mut Engine,
    table: &RecordTable,
    doc: &Json,
    on_conflict: OnConflict,
) -> Result<()> {
    let values = table.bind(doc)?;
    let sql = table.write_sql(on_conflict);
    let stmt = engine.prepare_cached(&sql).await?;
    stmt.execute(Params::Positional(values))
        .await
        .map_err(|e| DatabaseError::Query(format!("save_record({}): {e}", table.name)))?;
    Ok(())
}

/// Write many records in one transaction.
pub async fn save_records(
    engine: &mut Engine,
    table: &RecordTable,
    docs: &[Json],
    on_conflict: OnConflict,
) -> Result<usize> {
    engine.begin().await?;
    let result: Result<usize> = async {
        for doc in docs {
            save_record(engine, table, doc, on_conflict).await?;
        }
        Ok(docs.len())
    }
    .await;
    engine.finish(result).await
}

/// Fetch one document by key.
pub async fn get_record(
    engine: &mut Engine,
    table: &RecordTable,
    key: &str,
) -> Result<Option<Json>> {
    let sql = format!("SELECT json FROM {} WHERE {} = ?1", table.name, table.key);
    let context = format!("get_record({})", table.name);
    let stmt = engine.prepare_cached(&sql).await?;
    match first_value(stmt, Params::Positional(vec![Value::Text(key.to_string())]), &context)
        .await?
    {
        Some(Value::Text(text)) => Ok(Some(parse_document(table.name, &text)?)),
        Some(other) => Err(DatabaseError::Serialization(format!(
            "{context}: json column holds {other:?}"
        ))
        .into()),
        None => Ok(None),
    }
}

/// Delete one record. Returns whether a row was removed.
pub async fn remove_record(engine: &mut Engine, table: &RecordTable, key: &str) -> Result<bool> {
    let sql = format!("DELETE FROM {} WHERE {} = ?1", table.name, table.key);
    let stmt = engine.prepare_cached(&sql).await?;
    let changed = stmt
        .execute(libsql::params![key])
        .await
        .map_err(|e| DatabaseError::Query(format!("remove_record({}): {e}", table.name)))?;
    Ok(changed > 0)
}

/// Run `sql` (whose first column is `json`) and parse every row.
pub async fn query_documents(
    engine: &mut Engine,
    table: &str,
    sql: &str,
    params: Vec<Value>,
) -> Result<Vec<Json>> {
    let stmt = engine.prepare_cached(sql).await?;
    let texts: std::result::Result<Vec<String>, DatabaseError> = async {
        let mut rows = stmt
            .query(Params::Positional(params))
            .await
            .map_err(|e| DatabaseError::Query(format!("query_documents({table}): {e}")))?;
        let mut texts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query_documents({table}): {e}")))?
        {
            texts.push(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(format!("query_documents({table}): {e}")))?,
            );
        }
        Ok(texts)
    }
    .await;
    stmt.reset();

    texts?
        .iter()
        .map(|text| parse_document(table, text))
        .collect()
}

/// Run a single-integer query such as `SELECT count(*) ...`.
pub async fn query_count(engine: &mut Engine, sql: &str, params: Vec<Value>) -> Result<i64> {
    let stmt = engine.prepare_cached(sql).await?;
    match first_value(stmt, Params::Positional(params), "query_count").await? {
        Some(Value::Integer(count)) => Ok(count),
        Some(Value::Null) | None => Ok(0),
        Some(other) => {
            Err(DatabaseError::Query(format!("query_count: expected an integer, got {other:?}"))
                .into())
        }
    }
}

/// First column of the first row, read out before the statement is reset
/// so a cached statement never keeps its read transaction open.
async fn first_value(stmt: &Statement, params: Params, context: &str) -> Result<Option<Value>> {
    let value: std::result::Result<Option<Value>, DatabaseError> = async {
        let mut rows = stmt
            .query(params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            Some(row) => row
                .get_value(0)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("{context}: {e}"))),
            None => Ok(None),
        }
    }
    .await;
    stmt.reset();
    Ok(value?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineLocation;
    use crate::store::cipher::DbKey;
    use crate::store::schema::MAIN_SCHEMA;
    use secrecy::SecretString;
    use serde_json::json;

    static WIDGETS: RecordTable = RecordTable {
        name: "conversations",
        key: "id",
        columns: &[
            Column::text("type"),
            Column::integer("active_at"),
            Column::text("name"),
        ],
    };

    async fn open_engine(dir: &std::path::Path) -> Engine {
        let mut engine = Engine::new(EngineLocation::new(dir, "db.sqlite"), &MAIN_SCHEMA);
        engine
            .open(DbKey::parse(&SecretString::from("ab".repeat(32))).unwrap())
            .await
            .unwrap();
        engine
    }

    #[test]
    fn write_sql_updates_every_non_key_column() {
        let sql = WIDGETS.write_sql(OnConflict::Replace);
        assert_eq!(
            sql,
            "INSERT INTO conversations (id, json, type, active_at, name) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(id) DO UPDATE SET json = excluded.json, type = excluded.type, \
             active_at = excluded.active_at, name = excluded.name"
        );
        assert!(WIDGETS.write_sql(OnConflict::Ignore).ends_with("ON CONFLICT(id) DO NOTHING"));
    }

    #[test]
    fn bind_extracts_columns_from_document() {
        let doc = json!({"id": "c1", "type": "private", "active_at": 42, "extra": [1, 2]});
        let values = WIDGETS.bind(&doc).unwrap();
        assert!(matches!(&values[0], Value::Text(s) if s == "c1"));
        assert!(matches!(&values[2], Value::Text(s) if s == "private"));
        assert!(matches!(values[3], Value::Integer(42)));
        assert!(matches!(values[4], Value::Null));
    }

    #[test]
    fn bind_requires_key_field() {
        let err = WIDGETS.bind(&json!({"type": "group"})).unwrap_err();
        assert!(err.to_string().contains("missing its 'id'"));
        assert!(WIDGETS.bind(&json!(["not", "an", "object"])).is_err());
    }

    #[tokio::test]
    async fn document_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let doc = json!({
            "id": "c1",
            "type": "group",
            "active_at": 1700000000000_i64,
            "name": "Book club",
            "members": ["a", "b"],
            "nested": {"muted": true, "color": null, "ratio": 0.25}
        });

        save_record(&mut engine, &WIDGETS, &doc, OnConflict::Replace).await.unwrap();

        let fetched = get_record(&mut engine, &WIDGETS, "c1").await.unwrap().unwrap();
        assert_eq!(fetched, doc);
    }

    #[tokio::test]
    async fn extracted_columns_follow_latest_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let first = json!({"id": "c1", "type": "private", "active_at": 1});
        let second = json!({"id": "c1", "type": "group", "active_at": 2});

        save_record(&mut engine, &WIDGETS, &first, OnConflict::Replace).await.unwrap();
        save_record(&mut engine, &WIDGETS, &second, OnConflict::Replace).await.unwrap();

        let count = query_count(
            &mut engine,
            "SELECT count(*) FROM conversations WHERE type = 'group' AND active_at = 2",
            vec![],
        )
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn ignore_keeps_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        save_record(&mut engine, &WIDGETS, &json!({"id": "c1", "name": "old"}), OnConflict::Replace)
            .await
            .unwrap();

        save_records(
            &mut engine,
            &WIDGETS,
            &[json!({"id": "c1", "name": "new"}), json!({"id": "c2"})],
            OnConflict::Ignore,
        )
        .await
        .unwrap();

        let c1 = get_record(&mut engine, &WIDGETS, "c1").await.unwrap().unwrap();
        assert_eq!(c1["name"], "old");
        assert!(get_record(&mut engine, &WIDGETS, "c2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_batch_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;

        let result = save_records(
            &mut engine,
            &WIDGETS,
            &[json!({"id": "c1"}), json!({"name": "no key"})],
            OnConflict::Replace,
        )
        .await;

        assert!(result.is_err());
        assert!(get_record(&mut engine, &WIDGETS, "c1").await.unwrap().is_none());
    }
}
