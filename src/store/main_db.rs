//! Method table of the main store: conversations, messages, sessions,
//! items, and the legacy unprocessed queue.

use std::collections::BTreeSet;

use async_trait::async_trait;
use libsql::Value;
use serde::Deserialize;
use serde_json::{Value as Json, json};

use crate::error::{DatabaseError, Error, Result};
use crate::store::engine::Engine;
use crate::store::migrations::Schema;
use crate::store::query::{chunked_execute, chunked_query, search_messages};
use crate::store::records::{
    Column, OnConflict, RecordTable, get_record, parse_document, query_count, query_documents,
    remove_record, save_record, save_records,
};
use crate::store::schema::MAIN_SCHEMA;
use crate::store::unprocessed::{self, SaveOptions};
use crate::worker::surface::{Args, SqlSurface};

static CONVERSATIONS: RecordTable = RecordTable {
    name: "conversations",
    key: "id",
    columns: &[
        Column::text("type"),
        Column::integer("active_at"),
        Column::text("name"),
        Column::text("e164"),
        Column::text("serviceId"),
    ],
};

static MESSAGES: RecordTable = RecordTable {
    name: "messages",
    key: "id",
    columns: &[
        Column::text("conversationId"),
        Column::text("type"),
        Column::text("body"),
        Column::integer("sent_at"),
        Column::integer("received_at"),
        Column::boolean("hasAttachments"),
        Column::integer("readStatus"),
        Column::integer("schemaVersion"),
        Column::boolean("isErased"),
        Column::boolean("isViewOnce"),
        Column::text("storyId"),
    ],
};

static SESSIONS: RecordTable = RecordTable {
    name: "sessions",
    key: "id",
    columns: &[
        Column::text("conversationId"),
        Column::text("ourServiceId"),
        Column::text("serviceId"),
    ],
};

static ITEMS: RecordTable = RecordTable {
    name: "items",
    key: "id",
    columns: &[],
};

const METHODS: &[&str] = &[
    "getSchemaVersion",
    "saveConversation",
    "saveConversations",
    "getConversationById",
    "getAllConversations",
    "removeConversation",
    "saveMessage",
    "saveMessages",
    "getMessageById",
    "getMessagesByIds",
    "getMessageCount",
    "removeMessage",
    "removeMessages",
    "searchMessages",
    "getMessagesNeedingUpgrade",
    "getKnownMessageAttachments",
    "createOrUpdateSession",
    "getSessionById",
    "getSessionsByConversation",
    "removeSessionsByConversation",
    "createOrUpdateItem",
    "getItemById",
    "getAllItems",
    "removeItemById",
    "getUnprocessedCount",
    "getUnprocessedPage",
    "saveUnprocesseds",
    "removeAllUnprocessed",
];

const DEFAULT_SEARCH_LIMIT: u32 = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SearchOptions {
    conversation_id: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpgradeOptions {
    max_version: i64,
}

/// Methods served by the main worker.
pub struct MainSurface {
    chunk_limit: usize,
}

impl MainSurface {
    pub fn new(chunk_limit: usize) -> Self {
        Self { chunk_limit }
    }
}

#[async_trait(?Send)]
impl SqlSurface for MainSurface {
    fn schema(&self) -> &'static Schema {
        &MAIN_SCHEMA
    }

    fn methods(&self) -> &'static [&'static str] {
        METHODS
    }

    async fn call(&self, engine: &mut Engine, method: &str, args: Args) -> Result<Json> {
        match method {
            "getSchemaVersion" => Ok(json!(engine.schema_version().await?)),

            "saveConversation" => {
                let doc: Json = args.required(0)?;
                save_record(engine, &CONVERSATIONS, &doc, OnConflict::Replace).await?;
                Ok(Json::Null)
            }
            "saveConversations" => {
                let docs: Vec<Json> = args.required(0)?;
                let saved = save_records(engine, &CONVERSATIONS, &docs, OnConflict::Replace).await?;
                Ok(json!(saved))
            }
            "getConversationById" => {
                let id: String = args.required(0)?;
                Ok(get_record(engine, &CONVERSATIONS, &id).await?.unwrap_or(Json::Null))
            }
            "getAllConversations" => {
                let docs = query_documents(
                    engine,
                    CONVERSATIONS.name,
                    "SELECT json FROM conversations ORDER BY active_at DESC, id ASC",
                    vec![],
                )
                .await?;
                Ok(Json::Array(docs))
            }
            "removeConversation" => {
                let id: String = args.required(0)?;
                Ok(json!(remove_record(engine, &CONVERSATIONS, &id).await?))
            }

            "saveMessage" => {
                let doc: Json = args.required(0)?;
                save_record(engine, &MESSAGES, &doc, OnConflict::Replace).await?;
                Ok(doc.get("id").cloned().unwrap_or(Json::Null))
            }
            "saveMessages" => {
                let docs: Vec<Json> = args.required(0)?;
                Ok(json!(save_records(engine, &MESSAGES, &docs, OnConflict::Replace).await?))
            }
            "getMessageById" => {
                let id: String = args.required(0)?;
                Ok(get_record(engine, &MESSAGES, &id).await?.unwrap_or(Json::Null))
            }
            "getMessagesByIds" => {
                let ids: Vec<String> = args.required(0)?;
                let values: Vec<Value> = ids.into_iter().map(Value::Text).collect();
                let docs = chunked_query(
                    engine.connection()?,
                    "SELECT json FROM messages WHERE id IN ($values)",
                    &[],
                    &values,
                    self.chunk_limit,
                    |row| {
                        let text: String = row
                            .get(0)
                            .map_err(|e| DatabaseError::Query(format!("getMessagesByIds: {e}")))?;
                        parse_document(MESSAGES.name, &text)
                    },
                )
                .await?;
                Ok(Json::Array(docs))
            }
            "getMessageCount" => {
                let conversation: Option<String> = args.optional(0)?;
                let count = match conversation {
                    Some(id) => {
                        query_count(
                            engine,
                            "SELECT count(*) FROM messages WHERE conversationId = ?1",
                            vec![Value::Text(id)],
                        )
                        .await?
                    }
                    None => query_count(engine, "SELECT count(*) FROM messages", vec![]).await?,
                };
                Ok(json!(count))
            }
            "removeMessage" => {
                let id: String = args.required(0)?;
                Ok(json!(remove_record(engine, &MESSAGES, &id).await?))
            }
            "removeMessages" => {
                let ids: Vec<String> = args.required(0)?;
                let values: Vec<Value> = ids.into_iter().map(Value::Text).collect();
                let removed = chunked_execute(
                    engine.connection()?,
                    "DELETE FROM messages WHERE id IN ($values)",
                    &values,
                    self.chunk_limit,
                )
                .await?;
                Ok(json!(removed))
            }
            "searchMessages" => {
                let query: String = args.required(0)?;
                let options: SearchOptions = args.optional(1)?.unwrap_or_default();
                let hits = search_messages(
                    engine.connection()?,
                    &query,
                    options.conversation_id.as_deref(),
                    options.limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
                )
                .await?;
                serde_json::to_value(hits).map_err(|e| {
                    DatabaseError::Serialization(format!("searchMessages: {e}")).into()
                })
            }
            "getMessagesNeedingUpgrade" => {
                let limit: u32 = args.required(0)?;
                let options: UpgradeOptions = args.required(1)?;
                let docs = query_documents(
                    engine,
                    MESSAGES.name,
                    "SELECT json FROM messages
                     WHERE schemaVersion IS NULL OR schemaVersion < ?1
                     ORDER BY received_at ASC
                     LIMIT ?2",
                    vec![
                        Value::Integer(options.max_version),
                        Value::Integer(i64::from(limit)),
                    ],
                )
                .await?;
                Ok(Json::Array(docs))
            }
            "getKnownMessageAttachments" => {
                let docs = query_documents(
                    engine,
                    MESSAGES.name,
                    "SELECT json FROM messages WHERE hasAttachments = 1",
                    vec![],
                )
                .await?;
                let mut paths = BTreeSet::new();
                for doc in &docs {
                    collect_attachment_paths(doc, &mut paths);
                }
                Ok(json!(paths))
            }

            "createOrUpdateSession" => {
                let doc: Json = args.required(0)?;
                save_record(engine, &SESSIONS, &doc, OnConflict::Replace).await?;
                Ok(Json::Null)
            }
            "getSessionById" => {
                let id: String = args.required(0)?;
                Ok(get_record(engine, &SESSIONS, &id).await?.unwrap_or(Json::Null))
            }
            "getSessionsByConversation" => {
                let conversation: String = args.required(0)?;
                let docs = query_documents(
                    engine,
                    SESSIONS.name,
                    "SELECT json FROM sessions WHERE conversationId = ?1 ORDER BY id ASC",
                    vec![Value::Text(conversation)],
                )
                .await?;
                Ok(Json::Array(docs))
            }
            "removeSessionsByConversation" => {
                let conversation: String = args.required(0)?;
                let removed = engine
                    .connection()?
                    .execute(
                        "DELETE FROM sessions WHERE conversationId = ?1",
                        libsql::params![conversation],
                    )
                    .await
                    .map_err(|e| {
                        DatabaseError::Query(format!("removeSessionsByConversation: {e}"))
                    })?;
                Ok(json!(removed))
            }

            "createOrUpdateItem" => {
                let doc: Json = args.required(0)?;
                save_record(engine, &ITEMS, &doc, OnConflict::Replace).await?;
                Ok(Json::Null)
            }
            "getItemById" => {
                let id: String = args.required(0)?;
                Ok(get_record(engine, &ITEMS, &id).await?.unwrap_or(Json::Null))
            }
            "getAllItems" => {
                let sql = "SELECT json FROM items ORDER BY id";
                let docs = query_documents(engine, ITEMS.name, sql, vec![]).await?;
                Ok(Json::Array(docs))
            }
            "removeItemById" => {
                let id: String = args.required(0)?;
                Ok(json!(remove_record(engine, &ITEMS, &id).await?))
            }

            "getUnprocessedCount" => Ok(json!(unprocessed::count(engine).await?)),
            "getUnprocessedPage" => {
                let after: Option<String> = args.optional(0)?;
                let limit: u32 = args.required(1)?;
                let page = unprocessed::page(engine, after.as_deref(), limit).await?;
                serde_json::to_value(page).map_err(|e| {
                    DatabaseError::Serialization(format!("getUnprocessedPage: {e}")).into()
                })
            }
            "saveUnprocesseds" => {
                let items: Vec<Json> = args.required(0)?;
                let options: SaveOptions = args.optional(1)?.unwrap_or_default();
                Ok(json!(unprocessed::save_all(engine, &items, options).await?))
            }
            "removeAllUnprocessed" => Ok(json!(unprocessed::remove_all(engine).await?)),

            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}

/// File paths referenced by a message's attachments, thumbnails and
/// screenshots.
fn collect_attachment_paths(doc: &Json, paths: &mut BTreeSet<String>) {
    let Some(attachments) = doc.get("attachments").and_then(Json::as_array) else {
        return;
    };
    for attachment in attachments {
        let nested = [
            attachment.get("path"),
            attachment.get("thumbnail").and_then(|t| t.get("path")),
            attachment.get("screenshot").and_then(|s| s.get("path")),
        ];
        for path in nested.into_iter().flatten().filter_map(Json::as_str) {
            if !path.is_empty() {
                paths.insert(path.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineLocation;
    use crate::store::cipher::DbKey;
    use secrecy::SecretString;

    async fn open_engine(dir: &std::path::Path) -> Engine {
        let mut engine = Engine::new(EngineLocation::new(dir, "db.sqlite"), &MAIN_SCHEMA);
        engine
            .open(DbKey::parse(&SecretString::from("ef".repeat(32))).unwrap())
            .await
            .unwrap();
        engine
    }

    async fn call(
        surface: &MainSurface,
        engine: &mut Engine,
        method: &str,
        args: Vec<Json>,
    ) -> Json {
        surface
            .call(engine, method, Args::new(method, args))
            .await
            .unwrap()
    }

    fn message(id: &str, conversation: &str, body: &str, received_at: i64) -> Json {
        json!({
            "id": id,
            "conversationId": conversation,
            "type": "incoming",
            "body": body,
            "sent_at": received_at - 1,
            "received_at": received_at,
            "schemaVersion": 10
        })
    }

    #[tokio::test]
    async fn every_declared_method_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let surface = MainSurface::new(999);

        for method in surface.methods() {
            let err = surface
                .call(&mut engine, method, Args::new(*method, vec![]))
                .await
                .err();
            assert!(
                !matches!(err, Some(Error::UnknownMethod(_))),
                "{method} is declared but not served"
            );
        }
        let err = surface
            .call(&mut engine, "dropEverything", Args::new("dropEverything", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownMethod(name) if name == "dropEverything"));
    }

    #[tokio::test]
    async fn messages_by_ids_spans_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let surface = MainSurface::new(2);
        let docs: Vec<Json> = (0..5).map(|i| message(&format!("m{i}"), "c1", "hi", i)).collect();
        call(&surface, &mut engine, "saveMessages", vec![json!(docs)]).await;

        let found = call(
            &surface,
            &mut engine,
            "getMessagesByIds",
            vec![json!(["m0", "m2", "m4", "missing", "m3"])],
        )
        .await;

        let mut ids: Vec<&str> = found
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["m0", "m2", "m3", "m4"]);

        let ids = json!(["m0", "m1", "m2"]);
        let removed = call(&surface, &mut engine, "removeMessages", vec![ids]).await;
        assert_eq!(removed, 3);
        assert_eq!(call(&surface, &mut engine, "getMessageCount", vec![]).await, 2);
    }

    #[tokio::test]
    async fn search_returns_snippets_for_visible_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let surface = MainSurface::new(999);
        let mut erased = message("m2", "c1", "lunch plans erased", 20);
        erased["isErased"] = json!(true);
        call(
            &surface,
            &mut engine,
            "saveMessages",
            vec![json!([message("m1", "c1", "lunch tomorrow?", 10), erased])],
        )
        .await;

        let hits = call(&surface, &mut engine, "searchMessages", vec![json!("lunch")]).await;

        let hits = hits.as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["document"]["id"], "m1");
        assert!(hits[0]["snippet"].as_str().unwrap().contains("<<left>>"));
    }

    #[tokio::test]
    async fn upgrade_scan_uses_extracted_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let surface = MainSurface::new(999);
        let mut old = message("old", "c1", "a", 1);
        old["schemaVersion"] = json!(3);
        call(
            &surface,
            &mut engine,
            "saveMessages",
            vec![json!([old, message("new", "c1", "b", 2)])],
        )
        .await;

        let stale = call(
            &surface,
            &mut engine,
            "getMessagesNeedingUpgrade",
            vec![json!(10), json!({"maxVersion": 10})],
        )
        .await;

        assert_eq!(stale.as_array().unwrap().len(), 1);
        assert_eq!(stale[0]["id"], "old");
    }

    #[tokio::test]
    async fn known_attachments_are_sorted_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let surface = MainSurface::new(999);
        let with_files = json!({
            "id": "m1",
            "conversationId": "c1",
            "hasAttachments": true,
            "attachments": [
                {"path": "b/2", "thumbnail": {"path": "a/1"}},
                {"path": "b/2", "screenshot": {"path": "c/3"}}
            ]
        });
        call(&surface, &mut engine, "saveMessage", vec![with_files]).await;
        call(&surface, &mut engine, "saveMessage", vec![message("m2", "c1", "text", 1)]).await;

        let paths = call(&surface, &mut engine, "getKnownMessageAttachments", vec![]).await;

        assert_eq!(paths, json!(["a/1", "b/2", "c/3"]));
    }

    #[tokio::test]
    async fn sessions_group_by_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let surface = MainSurface::new(999);
        for (id, conversation) in [("s1", "c1"), ("s2", "c1"), ("s3", "c2")] {
            call(
                &surface,
                &mut engine,
                "createOrUpdateSession",
                vec![json!({"id": id, "conversationId": conversation, "record": "x"})],
            )
            .await;
        }

        let c1 = call(&surface, &mut engine, "getSessionsByConversation", vec![json!("c1")]).await;
        assert_eq!(c1.as_array().unwrap().len(), 2);

        let removed =
            call(&surface, &mut engine, "removeSessionsByConversation", vec![json!("c1")]).await;
        assert_eq!(removed, 2);
        let gone = call(&surface, &mut engine, "getSessionById", vec![json!("s1")]).await;
        assert_eq!(gone, Json::Null);
        let kept = call(&surface, &mut engine, "getSessionById", vec![json!("s3")]).await;
        assert_eq!(kept["conversationId"], "c2");
    }

    #[tokio::test]
    async fn bad_arguments_do_not_poison_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path()).await;
        let surface = MainSurface::new(999);

        let err = surface
            .call(&mut engine, "getItemById", Args::new("getItemById", vec![json!({"no": "id"})]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArguments { .. }));

        let theme = json!({"id": "theme", "value": "dark"});
        call(&surface, &mut engine, "createOrUpdateItem", vec![theme]).await;
        let item = call(&surface, &mut engine, "getItemById", vec![json!("theme")]).await;
        assert_eq!(item["value"], "dark");
    }
}
