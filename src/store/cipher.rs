//! Key handling and the ordered chain of open strategies.
//!
//! Opening an encrypted file is attempted with each [`OpenStrategy`] in
//! [`OPEN_STRATEGIES`] order. Every attempt is self-contained: it connects,
//! applies the key, proves the key by reading the catalog, and hands back a
//! live [`OpenedConnection`] or an error. [`open_with_fallback`] collects the
//! result as an [`OpenOutcome`] instead of relying on error fallthrough.

use std::fmt;
use std::path::Path;

use libsql::{Connection, Database as LibSqlDatabase};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::error::{DatabaseError, Error, Result};

/// Cipher compatibility level used for files created today.
const CURRENT_COMPAT: u8 = 4;

/// Older compatibility level some existing files were written with.
const LEGACY_COMPAT: u8 = 3;

/// Length of a key in hex characters (32 raw bytes).
pub const KEY_HEX_LEN: usize = 64;

/// A validated, hex-encoded database key.
#[derive(Clone)]
pub struct DbKey(SecretString);

impl DbKey {
    /// Validate the lexical form of a key: exactly 64 hex characters.
    /// Nothing touches the engine before this passes.
    pub fn parse(raw: &SecretString) -> Result<Self> {
        let text = raw.expose_secret();
        if text.is_empty() {
            return Err(Error::InvalidKey("key is empty".to_string()));
        }
        if text.len() != KEY_HEX_LEN {
            return Err(Error::InvalidKey(format!(
                "key must be {KEY_HEX_LEN} hex characters, got {}",
                text.len()
            )));
        }
        if !text.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidKey("key must be hex".to_string()));
        }
        hex::decode(text).map_err(|e| Error::InvalidKey(format!("{e}")))?;
        Ok(Self(raw.clone()))
    }

    fn hex(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DbKey(..)")
    }
}

/// One way of turning a file on disk into a usable, keyed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStrategy {
    /// Current compatibility defaults, straight into WAL.
    Current,
    /// Read the version counter under the older compatibility level, then
    /// reopen, upgrade the cipher format in place and restore the counter.
    LegacyUpgrade,
}

impl fmt::Display for OpenStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenStrategy::Current => f.write_str("current"),
            OpenStrategy::LegacyUpgrade => f.write_str("legacy-upgrade"),
        }
    }
}

/// Strategies in the order they are tried.
pub const OPEN_STRATEGIES: [OpenStrategy; 2] = [OpenStrategy::Current, OpenStrategy::LegacyUpgrade];

/// A database handle plus its single connection.
pub struct OpenedConnection {
    pub db: LibSqlDatabase,
    pub conn: Connection,
}

/// Result of walking the strategy chain.
pub enum OpenOutcome {
    Opened {
        strategy: OpenStrategy,
        connection: OpenedConnection,
    },
    Exhausted {
        errors: Vec<(OpenStrategy, Error)>,
    },
}

impl OpenStrategy {
    /// Make one attempt. Any handle opened here is dropped on failure.
    pub async fn attempt(self, path: &Path, key: &DbKey) -> Result<OpenedConnection> {
        match self {
            OpenStrategy::Current => {
                let opened = connect(path).await?;
                apply_key(&opened.conn, CURRENT_COMPAT, key).await?;
                verify_readable(&opened.conn).await?;
                enable_wal(&opened.conn).await?;
                Ok(opened)
            }
            OpenStrategy::LegacyUpgrade => {
                let version = {
                    let legacy = connect(path).await?;
                    apply_key(&legacy.conn, LEGACY_COMPAT, key).await?;
                    verify_readable(&legacy.conn).await?;
                    read_user_version(&legacy.conn).await?
                };

                let opened = connect(path).await?;
                apply_key(&opened.conn, LEGACY_COMPAT, key).await?;
                verify_readable(&opened.conn).await?;
                set_journal_mode(&opened.conn, "DELETE").await?;
                pragma_batch(
                    &opened.conn,
                    &format!(
                        "PRAGMA legacy = {CURRENT_COMPAT}; PRAGMA hexrekey = '{}';",
                        key.hex()
                    ),
                    "cipher upgrade",
                )
                .await?;
                verify_readable(&opened.conn).await?;
                if read_user_version(&opened.conn).await? != version {
                    pragma_batch(
                        &opened.conn,
                        &format!("PRAGMA user_version = {version};"),
                        "restore user_version",
                    )
                    .await?;
                }
                enable_wal(&opened.conn).await?;
                info!(path = %path.display(), version, "Upgraded cipher format");
                Ok(opened)
            }
        }
    }
}

/// Try every strategy in order until one succeeds.
pub async fn open_with_fallback(path: &Path, key: &DbKey) -> OpenOutcome {
    let mut errors = Vec::new();
    for strategy in OPEN_STRATEGIES {
        match strategy.attempt(path, key).await {
            Ok(connection) => {
                return OpenOutcome::Opened {
                    strategy,
                    connection,
                };
            }
            Err(e) => {
                warn!(path = %path.display(), %strategy, error = %e, "Open strategy failed");
                errors.push((strategy, e));
            }
        }
    }
    OpenOutcome::Exhausted { errors }
}

/// Re-encrypt the open file in place under `new_key`.
///
/// The codec cannot rekey in WAL mode, so the journal is switched to
/// rollback mode for the duration. The caller reopens afterwards, which
/// puts WAL back.
pub async fn rekey_in_place(conn: &Connection, new_key: &DbKey) -> Result<()> {
    set_journal_mode(conn, "DELETE").await?;
    pragma_batch(
        conn,
        &format!("PRAGMA hexrekey = '{}';", new_key.hex()),
        "rekey",
    )
    .await
}

async fn connect(path: &Path) -> Result<OpenedConnection> {
    let db = libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to open database: {e}")))?;
    let conn = db
        .connect()
        .map_err(|e| DatabaseError::Query(format!("Failed to create connection: {e}")))?;
    Ok(OpenedConnection { db, conn })
}

async fn apply_key(conn: &Connection, compat: u8, key: &DbKey) -> Result<()> {
    pragma_batch(
        conn,
        &format!(
            "PRAGMA cipher = 'sqlcipher'; PRAGMA legacy = {compat}; PRAGMA hexkey = '{}';",
            key.hex()
        ),
        "apply key",
    )
    .await
}

/// The key is only checked when the first page is read.
async fn verify_readable(conn: &Connection) -> Result<()> {
    let mut rows = conn
        .query("SELECT count(*) FROM sqlite_master", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("verify key: {e}")))?;
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("verify key: {e}")))?;
    Ok(())
}

async fn enable_wal(conn: &Connection) -> Result<()> {
    set_journal_mode(conn, "WAL").await?;
    pragma_batch(
        conn,
        "PRAGMA synchronous = FULL; PRAGMA fullfsync = ON;",
        "durability",
    )
    .await
}

async fn set_journal_mode(conn: &Connection, mode: &str) -> Result<()> {
    let mut rows = conn
        .query(&format!("PRAGMA journal_mode = {mode}"), ())
        .await
        .map_err(|e| DatabaseError::Query(format!("journal_mode {mode}: {e}")))?;
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("journal_mode {mode}: {e}")))?;
    Ok(())
}

pub(crate) async fn read_user_version(conn: &Connection) -> Result<i64> {
    let mut rows = conn
        .query("PRAGMA user_version", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("user_version: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("user_version: {e}")))?
    {
        Some(row) => Ok(row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Query(format!("user_version: {e}")))?),
        None => Ok(0),
    }
}

async fn pragma_batch(conn: &Connection, sql: &str, what: &str) -> Result<()> {
    conn.execute_batch(sql)
        .await
        .map_err(|e| DatabaseError::Query(format!("{what}: {e}")))?;
    Ok(())
}
