//! Version-tracked schema migrations.
//!
//! The schema version lives in the file itself (`PRAGMA user_version`).
//! `run_migrations()` walks a [`Schema`]'s steps in ascending order; each
//! step is skipped when the file is already at or past its version, and
//! otherwise runs inside one transaction whose last statement sets the
//! version to exactly that step's number. A failed step rolls back as a
//! whole and leaves the version untouched, so the next launch redoes it.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::{DatabaseError, Error, Result};
use crate::store::cipher::read_user_version;

/// A single migration step.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub step: Step,
}

/// What a step does.
pub enum Step {
    /// Plain DDL/DML batch.
    Sql(&'static str),
    /// Restructure a table by copy-rename, keeping its indexes.
    Rebuild(TableRebuild),
}

/// Copy-rename of one table.
///
/// `create_sql` must create `{table}_new`; `copy_sql` moves rows from
/// `{table}` into it and carries any conflict-merge rules.
pub struct TableRebuild {
    pub table: &'static str,
    pub create_sql: &'static str,
    pub copy_sql: &'static str,
}

/// An ordered list of steps plus idempotent index/trigger definitions.
pub struct Schema {
    pub name: &'static str,
    pub migrations: &'static [Migration],
    /// `CREATE ... IF NOT EXISTS` statements re-applied on every open.
    pub indexes: &'static str,
}

impl Schema {
    /// Version the file is at once every step has run.
    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }
}

/// Bring `conn` to the schema's latest version.
pub async fn run_migrations(conn: &Connection, schema: &Schema) -> Result<i64> {
    migrate_to(conn, schema, schema.latest_version()).await
}

/// Apply steps up to and including `target`.
pub async fn migrate_to(conn: &Connection, schema: &Schema, target: i64) -> Result<i64> {
    let start = read_user_version(conn).await?;

    for migration in schema.migrations.iter().filter(|m| m.version <= target) {
        run_step(conn, migration).await?;
    }

    let version = read_user_version(conn).await?;
    if version != start {
        info!(schema = schema.name, from = start, to = version, "Database migrations complete");
    }
    Ok(version)
}

/// Apply one step. Returns whether it ran.
pub async fn run_step(conn: &Connection, migration: &Migration) -> Result<bool> {
    let current = read_user_version(conn).await?;
    if current >= migration.version {
        debug!(version = migration.version, current, "Migration already applied");
        return Ok(false);
    }
    if current != migration.version - 1 {
        return Err(Error::MigrationFailed {
            version: migration.version,
            reason: format!("database is at version {current}, expected {}", migration.version - 1),
        });
    }

    let failed = |reason: String| Error::MigrationFailed {
        version: migration.version,
        reason,
    };

    let tx = conn.transaction().await.map_err(|e| failed(format!("begin: {e}")))?;

    let applied = match &migration.step {
        Step::Sql(sql) => tx
            .execute_batch(sql)
            .await
            .map(|_| ())
            .map_err(|e| failed(format!("{e}"))),
        Step::Rebuild(rebuild) => rebuild_table(&tx, rebuild)
            .await
            .map_err(|e| failed(format!("{e}"))),
    };

    let versioned = match applied {
        Ok(()) => tx
            .execute_batch(&format!("PRAGMA user_version = {};", migration.version))
            .await
            .map(|_| ())
            .map_err(|e| failed(format!("set version: {e}"))),
        Err(e) => Err(e),
    };

    match versioned {
        Ok(()) => {
            tx.commit().await.map_err(|e| failed(format!("commit: {e}")))?;
            info!(version = migration.version, name = migration.name, "Applied migration");
            Ok(true)
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}

/// Re-create indexes and triggers. Safe to run on every open.
pub async fn ensure_indexes(conn: &Connection, schema: &Schema) -> Result<()> {
    conn.execute_batch(schema.indexes)
        .await
        .map_err(|e| DatabaseError::Query(format!("ensure_indexes({}): {e}", schema.name)))?;
    Ok(())
}

/// Index name and defining SQL for every explicit index on `table`.
///
/// Constraint-backed indexes have no SQL and are skipped; the new table
/// defines its own constraints.
pub async fn table_indexes(conn: &Connection, table: &str) -> Result<Vec<(String, String)>> {
    let mut rows = conn
        .query(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL ORDER BY name",
            libsql::params![table],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("table_indexes: {e}")))?;

    let mut indexes = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("table_indexes: {e}")))?
    {
        let name: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("table_indexes: {e}")))?;
        let sql: String = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("table_indexes: {e}")))?;
        indexes.push((name, sql));
    }
    Ok(indexes)
}

async fn rebuild_table(conn: &Connection, rebuild: &TableRebuild) -> Result<()> {
    let query = |e: libsql::Error| DatabaseError::Query(format!("rebuild {}: {e}", rebuild.table));

    let indexes = table_indexes(conn, rebuild.table).await?;
    for (name, _) in &indexes {
        conn.execute_batch(&format!("DROP INDEX IF EXISTS \"{name}\";"))
            .await
            .map_err(query)?;
    }

    conn.execute_batch(rebuild.create_sql).await.map_err(query)?;
    conn.execute_batch(rebuild.copy_sql).await.map_err(query)?;
    conn.execute_batch(&format!(
        "DROP TABLE \"{table}\"; ALTER TABLE \"{table}_new\" RENAME TO \"{table}\";",
        table = rebuild.table
    ))
    .await
    .map_err(query)?;

    for (name, sql) in &indexes {
        conn.execute_batch(&format!("{sql};")).await.map_err(query)?;
        debug!(table = rebuild.table, index = %name, "Recreated index");
    }
    Ok(())
}
