//! Method table of the accelerator store.
//!
//! Newer features land here first. Names that also exist on the main
//! surface (the unprocessed queue) are served from this store once routes
//! are built.

use async_trait::async_trait;
use libsql::Value;
use libsql::params::Params;
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};

use crate::error::{DatabaseError, Error, Result};
use crate::store::engine::Engine;
use crate::store::migrations::Schema;
use crate::store::records::{
    Column, OnConflict, RecordTable, get_record, query_documents, remove_record, save_record,
};
use crate::store::schema::ACCELERATOR_SCHEMA;
use crate::store::unprocessed::{self, SaveOptions};
use crate::worker::surface::{Args, SqlSurface};

static TASKS: RecordTable = RecordTable {
    name: "tasks",
    key: "id",
    columns: &[
        Column::text("type"),
        Column::integer("attempts"),
        Column::integer("retryAt"),
    ],
};

static RISK_CHECKS: RecordTable = RecordTable {
    name: "risk_checks",
    key: "url",
    columns: &[Column::text("verdict"), Column::integer("expiresAt")],
};

const METHODS: &[&str] = &[
    "getUnprocessedCount",
    "saveUnprocesseds",
    "getAllUnprocessedAndIncrementAttempts",
    "removeUnprocessed",
    "removeAllUnprocessed",
    "upsertReadPosition",
    "upsertReadPositions",
    "getReadPositions",
    "saveTask",
    "getTaskById",
    "getTasksDue",
    "removeTask",
    "savePollVote",
    "getPollVotesForMessage",
    "saveRiskCheck",
    "getRiskCheck",
    "removeExpiredRiskChecks",
];

/// How far a device has read in one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPosition {
    pub source_device: i64,
    pub conversation_id: String,
    pub max_server_timestamp: i64,
    pub read_at: i64,
    #[serde(default)]
    pub sent_at: Option<i64>,
    #[serde(default)]
    pub max_notify_sequence_id: Option<i64>,
}

/// Earliest read wins; optional fields are only filled in, never replaced.
const UPSERT_READ_POSITION: &str = "
    INSERT INTO read_positions
        (sourceDevice, conversationId, maxServerTimestamp, readAt, sentAt, maxNotifySequenceId)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (sourceDevice, conversationId, maxServerTimestamp) DO UPDATE SET
        readAt = MIN(read_positions.readAt, excluded.readAt),
        sentAt = COALESCE(read_positions.sentAt, excluded.sentAt),
        maxNotifySequenceId = COALESCE(
            read_positions.maxNotifySequenceId,
            excluded.maxNotifySequenceId
        )";

/// Identity of a poll vote, read from the stored document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollVoteKey {
    message_id: String,
    from_conversation_id: String,
    timestamp: i64,
}

/// A newer vote from the same voter replaces the older one.
const UPSERT_POLL_VOTE: &str = "
    INSERT INTO poll_votes (messageId, fromConversationId, timestamp, json)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT (messageId, fromConversationId) DO UPDATE SET
        timestamp = excluded.timestamp,
        json = excluded.json
    WHERE excluded.timestamp >= poll_votes.timestamp";

/// Methods served by the accelerator worker.
pub struct AcceleratorSurface {
    chunk_limit: usize,
}

impl AcceleratorSurface {
    pub fn new(chunk_limit: usize) -> Self {
        Self { chunk_limit }
    }
}

#[async_trait(?Send)]
impl SqlSurface for AcceleratorSurface {
    fn schema(&self) -> &'static Schema {
        &ACCELERATOR_SCHEMA
    }

    fn methods(&self) -> &'static [&'static str] {
        METHODS
    }

    async fn call(&self, engine: &mut Engine, method: &str, args: Args) -> Result<Json> {
        match method {
            "getUnprocessedCount" => Ok(json!(unprocessed::count(engine).await?)),
            "saveUnprocesseds" => {
                let items: Vec<Json> = args.required(0)?;
                let options: SaveOptions = args.optional(1)?.unwrap_or_default();
                Ok(json!(unprocessed::save_all(engine, &items, options).await?))
            }
            "getAllUnprocessedAndIncrementAttempts" => Ok(Json::Array(
                unprocessed::take_all_incrementing_attempts(engine).await?,
            )),
            "removeUnprocessed" => {
                // Accepts one id or a list of ids.
                let ids = match args.raw(0) {
                    Some(Json::String(id)) => vec![id.clone()],
                    _ => args.required::<Vec<String>>(0)?,
                };
                Ok(json!(unprocessed::remove_ids(engine, &ids, self.chunk_limit).await?))
            }
            "removeAllUnprocessed" => Ok(json!(unprocessed::remove_all(engine).await?)),

            "upsertReadPosition" => {
                let position: ReadPosition = args.required(0)?;
                upsert_read_position(engine, &position).await?;
                Ok(Json::Null)
            }
            "upsertReadPositions" => {
                let positions: Vec<ReadPosition> = args.required(0)?;
                engine.begin().await?;
                let result: Result<()> = async {
                    for position in &positions {
                        upsert_read_position(engine, position).await?;
                    }
                    Ok(())
                }
                .await;
                engine.finish(result).await?;
                Ok(json!(positions.len()))
            }
            "getReadPositions" => {
                let conversation: String = args.required(0)?;
                let positions = read_positions(engine, &conversation).await?;
                serde_json::to_value(positions).map_err(|e| {
                    DatabaseError::Serialization(format!("getReadPositions: {e}")).into()
                })
            }

            "saveTask" => {
                let task: Json = args.required(0)?;
                save_record(engine, &TASKS, &task, OnConflict::Replace).await?;
                Ok(Json::Null)
            }
            "getTaskById" => {
                let id: String = args.required(0)?;
                Ok(get_record(engine, &TASKS, &id).await?.unwrap_or(Json::Null))
            }
            "getTasksDue" => {
                let now: i64 = args.required(0)?;
                let docs = query_documents(
                    engine,
                    TASKS.name,
                    "SELECT json FROM tasks
                     WHERE retryAt IS NULL OR retryAt <= ?1
                     ORDER BY retryAt ASC, id ASC",
                    vec![Value::Integer(now)],
                )
                .await?;
                Ok(Json::Array(docs))
            }
            "removeTask" => {
                let id: String = args.required(0)?;
                Ok(json!(remove_record(engine, &TASKS, &id).await?))
            }

            "savePollVote" => {
                let vote: Json = args.required(0)?;
                let key: PollVoteKey = serde_json::from_value(vote.clone())
                    .map_err(|e| args.invalid(format!("poll vote: {e}")))?;
                let stmt = engine.prepare_cached(UPSERT_POLL_VOTE).await?;
                let changed = stmt
                    .execute(libsql::params![
                        key.message_id,
                        key.from_conversation_id,
                        key.timestamp,
                        vote.to_string()
                    ])
                    .await
                    .map_err(|e| DatabaseError::Query(format!("savePollVote: {e}")))?;
                Ok(json!(changed > 0))
            }
            "getPollVotesForMessage" => {
                let message_id: String = args.required(0)?;
                let docs = query_documents(
                    engine,
                    "poll_votes",
                    "SELECT json FROM poll_votes WHERE messageId = ?1 ORDER BY timestamp ASC",
                    vec![Value::Text(message_id)],
                )
                .await?;
                Ok(Json::Array(docs))
            }

            "saveRiskCheck" => {
                let check: Json = args.required(0)?;
                save_record(engine, &RISK_CHECKS, &check, OnConflict::Replace).await?;
                Ok(Json::Null)
            }
            "getRiskCheck" => {
                let url: String = args.required(0)?;
                Ok(get_record(engine, &RISK_CHECKS, &url).await?.unwrap_or(Json::Null))
            }
            "removeExpiredRiskChecks" => {
                let now: i64 = args.required(0)?;
                let removed = engine
                    .connection()?
                    .execute(
                        "DELETE FROM risk_checks WHERE expiresAt IS NOT NULL AND expiresAt <= ?1",
                        libsql::params![now],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("removeExpiredRiskChecks: {e}")))?;
                Ok(json!(removed))
            }

            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}

async fn upsert_read_position(engine: &mut Engine, position: &ReadPosition) -> Result<()> {
    let stmt = engine.prepare_cached(UPSERT_READ_POSITION).await?;
    stmt.execute(Params::Positional(vec![
        Value::Integer(position.source_device),
        Value::Text(position.conversation_id.clone()),
        Value::Integer(position.max_server_timestamp),
        Value::Integer(position.read_at),
        position.sent_at.map(Value::Integer).unwrap_or(Value::Null),
        position.max_notify_sequence_id.map(Value::Integer).unwrap_or(Value::Null),
    ]))
    .await
    .map_err(|e| DatabaseError::Query(format!("upsertReadPosition: {e}")))?;
    Ok(())
}

async fn read_positions(engine: &mut Engine, conversation_id: &str) -> Result<Vec<ReadPosition>> {
    let stmt = engine
        .prepare_cached(
            "SELECT sourceDevice, conversationId, maxServerTimestamp, readAt, sentAt,
                    maxNotifySequenceId
             FROM read_positions
             WHERE conversationId = ?1
             ORDER BY maxServerTimestamp ASC, sourceDevice ASC",
        )
        .await?;
    let query = |e: libsql::Error| DatabaseError::Query(format!("getReadPositions: {e}"));
    let mut rows = stmt
        .query(libsql::params![conversation_id])
        .await
        .map_err(query)?;

    let mut positions = Vec::new();
    while let Some(row) = rows.next().await.map_err(query)? {
        positions.push(ReadPosition {
            source_device: row.get(0).map_err(query)?,
            conversation_id: row.get(1).map_err(query)?,
            max_server_timestamp: row.get(2).map_err(query)?,
            read_at: row.get(3).map_err(query)?,
            sent_at: optional_integer(row.get_value(4).map_err(query)?),
            max_notify_sequence_id: optional_integer(row.get_value(5).map_err(query)?),
        });
    }
    Ok(positions)
}

fn optional_integer(value: Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(i),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineLocation;
    use crate::store::cipher::DbKey;
    use secrecy::SecretString;

    async fn open_engine(dir: &std::path::Path) -> Engine {
        let mut engine = Engine::new(EngineLocation::new(dir, "db.sqlite"), &ACCELERATOR_SCHEMA);
        engine
            .open(DbKey::parse(&SecretString::from("12".repeat(32))).unwrap())
            .await
            .unwrap();
        engine
    }

    async fn call(engine: &mut Engine, method: &str, args: Vec<Json>) -> Json {
        AcceleratorSurface::new(999)
            .call(engine, method, Args::new(method, args))
            .await
            .unwrap()
    }

    fn position(read_at: i64, sent_at: Option<i64>) -> Json {
        json!({
            "sourceDevice": 1,
            "conversationId": "c1",
            "maxServerTimestamp": 1000,
            "readAt": read_at,
            "sentAt": sent_at
        })
    }

    #[tokio::test]
    async fn earliest_read_position_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;

        call(&mut engine, "upsertReadPosition", vec![position(100, None)]).await;
        call(&mut engine, "upsertReadPosition", vec![position(200, Some(50))]).await;

        let stored = call(&mut engine, "getReadPositions", vec![json!("c1")]).await;
        assert_eq!(stored.as_array().unwrap().len(), 1);
        assert_eq!(stored[0]["readAt"], 100);
        assert_eq!(stored[0]["sentAt"], 50);
    }

    #[tokio::test]
    async fn lower_read_at_replaces_higher() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;

        call(
            &mut engine,
            "upsertReadPositions",
            vec![json!([position(300, Some(7)), position(150, Some(9))])],
        )
        .await;

        let stored = call(&mut engine, "getReadPositions", vec![json!("c1")]).await;
        assert_eq!(stored[0]["readAt"], 150);
        assert_eq!(stored[0]["sentAt"], 7);
    }

    #[tokio::test]
    async fn tasks_due_by_retry_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        for (id, retry_at) in [("t1", json!(50)), ("t2", json!(500)), ("t3", Json::Null)] {
            call(
                &mut engine,
                "saveTask",
                vec![json!({"id": id, "type": "download", "attempts": 0, "retryAt": retry_at})],
            )
            .await;
        }

        let due = call(&mut engine, "getTasksDue", vec![json!(100)]).await;

        let ids: Vec<&str> =
            due.as_array().unwrap().iter().map(|t| t["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["t3", "t1"]);
        assert_eq!(call(&mut engine, "removeTask", vec![json!("t1")]).await, true);
        assert_eq!(call(&mut engine, "getTaskById", vec![json!("t1")]).await, Json::Null);
    }

    #[tokio::test]
    async fn stale_poll_vote_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let vote = |timestamp: i64, option: i64| {
            json!({
                "messageId": "m1",
                "fromConversationId": "voter",
                "timestamp": timestamp,
                "optionIndexes": [option]
            })
        };

        assert_eq!(call(&mut engine, "savePollVote", vec![vote(20, 1)]).await, true);
        assert_eq!(call(&mut engine, "savePollVote", vec![vote(10, 2)]).await, false);

        let votes = call(&mut engine, "getPollVotesForMessage", vec![json!("m1")]).await;
        assert_eq!(votes.as_array().unwrap().len(), 1);
        assert_eq!(votes[0]["optionIndexes"], json!([1]));
    }

    #[tokio::test]
    async fn expired_risk_checks_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        call(
            &mut engine,
            "saveRiskCheck",
            vec![json!({"url": "https://old.example", "verdict": "safe", "expiresAt": 10})],
        )
        .await;
        call(
            &mut engine,
            "saveRiskCheck",
            vec![json!({"url": "https://new.example", "verdict": "unsafe", "expiresAt": 1000})],
        )
        .await;

        assert_eq!(call(&mut engine, "removeExpiredRiskChecks", vec![json!(100)]).await, 1);
        assert_eq!(
            call(&mut engine, "getRiskCheck", vec![json!("https://old.example")]).await,
            Json::Null
        );
        assert_eq!(
            call(&mut engine, "getRiskCheck", vec![json!("https://new.example")]).await["verdict"],
            "unsafe"
        );
    }

    #[tokio::test]
    async fn remove_unprocessed_accepts_one_or_many() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let items: Vec<Json> =
            (0..4).map(|i| json!({"id": format!("u{i}"), "timestamp": i})).collect();
        call(&mut engine, "saveUnprocesseds", vec![json!(items)]).await;

        call(&mut engine, "removeUnprocessed", vec![json!("u0")]).await;
        call(&mut engine, "removeUnprocessed", vec![json!(["u1", "u2"])]).await;

        assert_eq!(call(&mut engine, "getUnprocessedCount", vec![]).await, 1);
    }
}
