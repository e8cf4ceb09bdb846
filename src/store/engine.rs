//! Encrypted engine: one database file, one connection.
//!
//! The engine owns the open/key/migrate sequence, a statement cache tied to
//! the live connection, and the file-level primitives (size, checkpoint,
//! maintenance, rekey, erase). It is driven from a single worker thread, so
//! every method takes `&mut self` where the cache may change.

use libsql::{Connection, Statement};
use tracing::{debug, error, info};

use crate::config::EngineLocation;
use crate::error::{DatabaseError, Error, Result};
use crate::store::cipher::{self, DbKey, OpenOutcome, OpenStrategy, OpenedConnection};
use crate::store::migrations::{Schema, ensure_indexes, run_migrations};
use crate::store::statements::StatementCache;

/// Optional work done while closing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOptions {
    pub optimize: bool,
    pub vacuum: bool,
}

struct Live {
    // Dropped after `conn`; the connection must not outlive its database.
    conn: Connection,
    _db: libsql::Database,
}

pub struct Engine {
    location: EngineLocation,
    schema: &'static Schema,
    live: Option<Live>,
    statements: StatementCache,
}

impl Engine {
    /// A closed engine for the file at `location`.
    pub fn new(location: EngineLocation, schema: &'static Schema) -> Self {
        Self {
            location,
            schema,
            live: None,
            statements: StatementCache::new(),
        }
    }

    pub fn location(&self) -> &EngineLocation {
        &self.location
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    /// Open, key, migrate and smoke-test the database.
    pub async fn open(&mut self, key: DbKey) -> Result<OpenStrategy> {
        if self.live.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        std::fs::create_dir_all(&self.location.dir).map_err(|e| {
            DatabaseError::Io(format!("Failed to create database directory: {e}"))
        })?;

        let path = self.location.db_path();
        let (strategy, opened) = match cipher::open_with_fallback(&path, &key).await {
            OpenOutcome::Opened {
                strategy,
                connection,
            } => (strategy, connection),
            OpenOutcome::Exhausted { errors } => {
                let detail = errors
                    .iter()
                    .map(|(strategy, e)| format!("{strategy}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                error!(path = %path.display(), %detail, "All open strategies failed");
                return Err(Error::CorruptionSuspected(detail));
            }
        };

        let OpenedConnection { db, conn } = opened;
        let version = run_migrations(&conn, self.schema).await?;
        ensure_indexes(&conn, self.schema).await?;
        smoke_test(&conn).await?;

        self.statements.invalidate();
        self.live = Some(Live { conn, _db: db });
        info!(
            path = %path.display(),
            schema = self.schema.name,
            version,
            %strategy,
            "Database opened"
        );
        Ok(strategy)
    }

    /// The live connection.
    pub fn connection(&self) -> Result<&Connection> {
        self.live
            .as_ref()
            .map(|live| &live.conn)
            .ok_or(Error::NotInitialized)
    }

    /// Cached prepared statement for `sql` on the live connection.
    pub async fn prepare_cached(&mut self, sql: &str) -> Result<&mut Statement> {
        let live = self.live.as_ref().ok_or(Error::NotInitialized)?;
        self.statements.prepare(&live.conn, sql).await
    }

    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    pub async fn begin(&self) -> Result<()> {
        self.batch("BEGIN", "begin").await
    }

    /// Commit on `Ok`, roll back on `Err`, and hand the result through.
    pub async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.batch("COMMIT", "commit").await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.batch("ROLLBACK", "rollback").await {
                    debug!(error = %rollback, "Rollback after failure also failed");
                }
                Err(e)
            }
        }
    }

    pub async fn schema_version(&self) -> Result<i64> {
        cipher::read_user_version(self.connection()?).await
    }

    /// Close the connection, optionally optimizing and vacuuming first.
    /// Closing a closed engine is a no-op.
    pub async fn close(&mut self, options: CloseOptions) -> Result<()> {
        if self.live.is_none() {
            return Ok(());
        }
        // Half-stepped cached statements would block VACUUM.
        self.statements.invalidate();
        if options.optimize {
            self.batch("PRAGMA optimize;", "optimize").await?;
        }
        if options.vacuum {
            self.batch("VACUUM;", "vacuum").await?;
        }
        self.live = None;
        info!(path = %self.location.db_path().display(), "Database closed");
        Ok(())
    }

    /// Re-encrypt under `new_key` and reopen with it.
    pub async fn rekey(&mut self, new_key: DbKey) -> Result<()> {
        // The journal mode switch fails while any statement holds a read.
        self.statements.invalidate();
        let conn = self.connection()?;
        cipher::rekey_in_place(conn, &new_key).await?;

        self.live = None;
        self.open(new_key).await?;
        info!(path = %self.location.db_path().display(), "Database rekeyed");
        Ok(())
    }

    /// Flush the write-ahead log into the main file.
    pub async fn checkpoint(&mut self) -> Result<()> {
        self.statements.reset_all();
        let mut rows = self
            .connection()?
            .query("PRAGMA wal_checkpoint(TRUNCATE)", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("checkpoint: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Query(format!("checkpoint: {e}")))?;
        Ok(())
    }

    /// Checkpoint, optimize and vacuum. Only ever run against a backup copy.
    pub async fn maintain(&mut self) -> Result<()> {
        self.checkpoint().await?;
        self.statements.invalidate();
        self.batch("PRAGMA optimize;", "optimize").await?;
        self.batch("VACUUM;", "vacuum").await?;
        debug!(path = %self.location.db_path().display(), "Maintenance complete");
        Ok(())
    }

    /// Bytes used by the primary file and its side-files.
    pub fn size_on_disk(&self) -> Result<u64> {
        let mut total = 0;
        for path in self.location.file_set() {
            match std::fs::metadata(&path) {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DatabaseError::Io(format!("{}: {e}", path.display())).into());
                }
            }
        }
        Ok(total)
    }

    /// Delete the file set. The connection must already be closed.
    pub fn remove_db(&self) -> Result<()> {
        if self.live.is_some() {
            return Err(Error::CannotEraseOpenDB);
        }
        for path in self.location.file_set() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed database file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DatabaseError::Io(format!("{}: {e}", path.display())).into());
                }
            }
        }
        Ok(())
    }

    async fn batch(&self, sql: &str, what: &str) -> Result<()> {
        self.connection()?
            .execute_batch(sql)
            .await
            .map_err(|e| DatabaseError::Query(format!("{what}: {e}")))?;
        Ok(())
    }
}

async fn smoke_test(conn: &Connection) -> Result<()> {
    let mut rows = conn
        .query("SELECT count(*) FROM sqlite_master", ())
        .await
        .map_err(|e| Error::CorruptionSuspected(format!("smoke test: {e}")))?;
    match rows.next().await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(Error::CorruptionSuspected("smoke test returned no rows".to_string())),
        Err(e) => Err(Error::CorruptionSuspected(format!("smoke test: {e}"))),
    }
}
