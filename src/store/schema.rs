//! Schemas of the two backing stores.
//!
//! Every document table keeps the full serialized record in `json` and
//! duplicates the few fields needed for predicates and ordering into
//! plain columns. Add new versions to the end.

use crate::store::migrations::{Migration, Schema, Step, TableRebuild};

static MAIN_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        step: Step::Sql(
            r#"
            CREATE TABLE conversations (
                id TEXT PRIMARY KEY,
                json TEXT NOT NULL,
                type TEXT,
                active_at INTEGER,
                name TEXT,
                e164 TEXT,
                serviceId TEXT
            );

            CREATE TABLE messages (
                rowid INTEGER PRIMARY KEY ASC,
                id TEXT NOT NULL UNIQUE,
                json TEXT NOT NULL,
                conversationId TEXT,
                type TEXT,
                body TEXT,
                sent_at INTEGER,
                received_at INTEGER,
                hasAttachments INTEGER,
                readStatus INTEGER
            );

            CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                json TEXT NOT NULL,
                conversationId TEXT,
                ourServiceId TEXT,
                serviceId TEXT
            );

            CREATE TABLE items (
                id TEXT PRIMARY KEY,
                json TEXT NOT NULL
            );

            CREATE TABLE unprocessed (
                id TEXT PRIMARY KEY,
                json TEXT NOT NULL,
                timestamp INTEGER,
                receivedAtCounter INTEGER,
                attempts INTEGER
            );
        "#,
        ),
    },
    Migration {
        version: 2,
        name: "message_search",
        step: Step::Sql(
            r#"
            CREATE VIRTUAL TABLE messages_fts USING fts5(body);

            INSERT INTO messages_fts (rowid, body)
                SELECT rowid, body FROM messages WHERE body IS NOT NULL;

            CREATE TRIGGER IF NOT EXISTS messages_on_insert AFTER INSERT ON messages
            BEGIN
                INSERT INTO messages_fts (rowid, body) VALUES (new.rowid, new.body);
            END;

            CREATE TRIGGER IF NOT EXISTS messages_on_delete AFTER DELETE ON messages
            BEGIN
                DELETE FROM messages_fts WHERE rowid = old.rowid;
            END;

            CREATE TRIGGER IF NOT EXISTS messages_on_update AFTER UPDATE OF body ON messages
            WHEN new.body IS NOT old.body
            BEGIN
                DELETE FROM messages_fts WHERE rowid = old.rowid;
                INSERT INTO messages_fts (rowid, body) VALUES (new.rowid, new.body);
            END;
        "#,
        ),
    },
    Migration {
        version: 3,
        name: "message_visibility_columns",
        step: Step::Sql(
            r#"
            ALTER TABLE messages ADD COLUMN schemaVersion INTEGER;
            ALTER TABLE messages ADD COLUMN isErased INTEGER;
            ALTER TABLE messages ADD COLUMN isViewOnce INTEGER;
            ALTER TABLE messages ADD COLUMN storyId TEXT;

            UPDATE messages SET
                schemaVersion = json_extract(json, '$.schemaVersion'),
                isErased = json_extract(json, '$.isErased'),
                isViewOnce = json_extract(json, '$.isViewOnce'),
                storyId = json_extract(json, '$.storyId');
        "#,
        ),
    },
];

const MAIN_INDEXES: &str = r#"
    CREATE INDEX IF NOT EXISTS conversations_active ON conversations (active_at);
    CREATE INDEX IF NOT EXISTS conversations_type ON conversations (type);
    CREATE INDEX IF NOT EXISTS messages_conversation ON messages (conversationId, received_at);
    CREATE INDEX IF NOT EXISTS messages_schemaVersion ON messages (schemaVersion);
    CREATE INDEX IF NOT EXISTS messages_hasAttachments ON messages (hasAttachments)
        WHERE hasAttachments = 1;
    CREATE INDEX IF NOT EXISTS sessions_conversation ON sessions (conversationId);
    CREATE INDEX IF NOT EXISTS unprocessed_timestamp ON unprocessed (timestamp);

    CREATE TRIGGER IF NOT EXISTS messages_on_insert AFTER INSERT ON messages
    BEGIN
        INSERT INTO messages_fts (rowid, body) VALUES (new.rowid, new.body);
    END;

    CREATE TRIGGER IF NOT EXISTS messages_on_delete AFTER DELETE ON messages
    BEGIN
        DELETE FROM messages_fts WHERE rowid = old.rowid;
    END;

    CREATE TRIGGER IF NOT EXISTS messages_on_update AFTER UPDATE OF body ON messages
    WHEN new.body IS NOT old.body
    BEGIN
        DELETE FROM messages_fts WHERE rowid = old.rowid;
        INSERT INTO messages_fts (rowid, body) VALUES (new.rowid, new.body);
    END;
"#;

pub static MAIN_SCHEMA: Schema = Schema {
    name: "main",
    migrations: MAIN_MIGRATIONS,
    indexes: MAIN_INDEXES,
};

static ACCELERATOR_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        step: Step::Sql(
            r#"
            CREATE TABLE unprocessed (
                id TEXT PRIMARY KEY,
                json TEXT NOT NULL,
                timestamp INTEGER,
                receivedAtCounter INTEGER,
                attempts INTEGER
            );

            CREATE TABLE read_positions (
                sourceDevice INTEGER NOT NULL,
                conversationId TEXT NOT NULL,
                maxServerTimestamp INTEGER NOT NULL,
                readAt INTEGER NOT NULL,
                sentAt INTEGER
            );
            CREATE INDEX read_positions_conversation
                ON read_positions (conversationId, maxServerTimestamp);
        "#,
        ),
    },
    Migration {
        version: 2,
        name: "read_positions_unique_key",
        step: Step::Rebuild(TableRebuild {
            table: "read_positions",
            create_sql: r#"
                CREATE TABLE read_positions_new (
                    sourceDevice INTEGER NOT NULL,
                    conversationId TEXT NOT NULL,
                    maxServerTimestamp INTEGER NOT NULL,
                    readAt INTEGER NOT NULL,
                    sentAt INTEGER,
                    maxNotifySequenceId INTEGER,
                    UNIQUE (sourceDevice, conversationId, maxServerTimestamp)
                );
            "#,
            copy_sql: r#"
                INSERT INTO read_positions_new
                    (sourceDevice, conversationId, maxServerTimestamp, readAt, sentAt)
                SELECT sourceDevice, conversationId, maxServerTimestamp, readAt, sentAt
                FROM read_positions WHERE true
                ON CONFLICT (sourceDevice, conversationId, maxServerTimestamp) DO UPDATE SET
                    readAt = MIN(read_positions_new.readAt, excluded.readAt),
                    sentAt = COALESCE(read_positions_new.sentAt, excluded.sentAt),
                    maxNotifySequenceId = COALESCE(
                        read_positions_new.maxNotifySequenceId,
                        excluded.maxNotifySequenceId
                    );
            "#,
        }),
    },
    Migration {
        version: 3,
        name: "tasks_votes_risk_checks",
        step: Step::Sql(
            r#"
            CREATE TABLE tasks (
                id TEXT PRIMARY KEY,
                json TEXT NOT NULL,
                type TEXT,
                attempts INTEGER,
                retryAt INTEGER
            );

            CREATE TABLE poll_votes (
                messageId TEXT NOT NULL,
                fromConversationId TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                json TEXT NOT NULL,
                PRIMARY KEY (messageId, fromConversationId)
            );

            CREATE TABLE risk_checks (
                url TEXT PRIMARY KEY,
                json TEXT NOT NULL,
                verdict TEXT,
                expiresAt INTEGER
            );
        "#,
        ),
    },
];

const ACCELERATOR_INDEXES: &str = r#"
    CREATE INDEX IF NOT EXISTS unprocessed_timestamp ON unprocessed (timestamp);
    CREATE INDEX IF NOT EXISTS read_positions_conversation
        ON read_positions (conversationId, maxServerTimestamp);
    CREATE INDEX IF NOT EXISTS tasks_retryAt ON tasks (retryAt);
    CREATE INDEX IF NOT EXISTS risk_checks_expiresAt ON risk_checks (expiresAt);
"#;

pub static ACCELERATOR_SCHEMA: Schema = Schema {
    name: "accelerator",
    migrations: ACCELERATOR_MIGRATIONS,
    indexes: ACCELERATOR_INDEXES,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::cipher::read_user_version;
    use crate::store::migrations::{ensure_indexes, migrate_to, run_migrations, table_indexes};
    use libsql::Connection;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[test]
    fn versions_are_consecutive() {
        for schema in [&MAIN_SCHEMA, &ACCELERATOR_SCHEMA] {
            for (i, m) in schema.migrations.iter().enumerate() {
                assert_eq!(m.version, i as i64 + 1, "{} step {}", schema.name, m.name);
            }
        }
    }

    #[tokio::test]
    async fn schemas_migrate_and_index_cleanly() {
        for schema in [&MAIN_SCHEMA, &ACCELERATOR_SCHEMA] {
            let conn = test_conn().await;
            let version = run_migrations(&conn, schema).await.unwrap();
            assert_eq!(version, schema.latest_version());
            ensure_indexes(&conn, schema).await.unwrap();
            ensure_indexes(&conn, schema).await.unwrap();
            assert_eq!(run_migrations(&conn, schema).await.unwrap(), version);
        }
    }

    #[tokio::test]
    async fn visibility_columns_backfill_from_documents() {
        let conn = test_conn().await;
        migrate_to(&conn, &MAIN_SCHEMA, 2).await.unwrap();
        conn.execute(
            "INSERT INTO messages (id, json, body) VALUES ('m1', ?1, 'hi')",
            libsql::params![r#"{"id":"m1","body":"hi","schemaVersion":7,"isErased":true}"#],
        )
        .await
        .unwrap();

        migrate_to(&conn, &MAIN_SCHEMA, 3).await.unwrap();

        let mut rows = conn
            .query("SELECT schemaVersion, isErased, isViewOnce FROM messages", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 7);
        assert_eq!(row.get::<i64>(1).unwrap(), 1);
        assert_eq!(row.get::<Option<i64>>(2).unwrap(), None);
    }

    #[tokio::test]
    async fn read_position_rebuild_merges_duplicates() {
        let conn = test_conn().await;
        migrate_to(&conn, &ACCELERATOR_SCHEMA, 1).await.unwrap();
        conn.execute_batch(
            "CREATE INDEX read_positions_readAt ON read_positions (readAt);
             INSERT INTO read_positions VALUES (1, 'c1', 100, 500, NULL);
             INSERT INTO read_positions VALUES (1, 'c1', 100, 300, NULL);
             INSERT INTO read_positions VALUES (1, 'c1', 100, 400, 90);
             INSERT INTO read_positions VALUES (2, 'c1', 100, 700, 80);",
        )
        .await
        .unwrap();

        migrate_to(&conn, &ACCELERATOR_SCHEMA, 2).await.unwrap();
        assert_eq!(read_user_version(&conn).await.unwrap(), 2);

        let mut rows = conn
            .query(
                "SELECT sourceDevice, readAt, sentAt FROM read_positions ORDER BY sourceDevice",
                (),
            )
            .await
            .unwrap();
        let first = rows.next().await.unwrap().unwrap();
        assert_eq!(first.get::<i64>(0).unwrap(), 1);
        assert_eq!(first.get::<i64>(1).unwrap(), 300);
        assert_eq!(first.get::<Option<i64>>(2).unwrap(), Some(90));
        let second = rows.next().await.unwrap().unwrap();
        assert_eq!(second.get::<i64>(1).unwrap(), 700);
        assert!(rows.next().await.unwrap().is_none());

        let names: Vec<String> = table_indexes(&conn, "read_positions")
            .await
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["read_positions_conversation", "read_positions_readAt"]);
    }
}
