//! Prepared-statement cache keyed by exact SQL text.
//!
//! Every entry is stamped with the generation of the connection it was
//! prepared on. Closing or replacing the connection calls
//! [`StatementCache::invalidate`], which bumps the generation and drops all
//! entries, so a statement can never outlive or cross connections.
//!
//! A statement that was stepped but not run to completion keeps its read
//! transaction open. [`StatementCache::reset_all`] releases them, and must
//! run before anything that needs the connection to itself (checkpoint,
//! journal mode changes, rekey).

use std::collections::HashMap;

use libsql::{Connection, Statement};

use crate::error::{DatabaseError, Result};

struct Cached {
    generation: u64,
    statement: Statement,
}

#[derive(Default)]
pub struct StatementCache {
    generation: u64,
    entries: HashMap<String, Cached>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the connection entries are currently valid for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every statement. Must be called before the connection the
    /// entries were prepared on is dropped.
    pub fn invalidate(&mut self) {
        self.generation += 1;
        self.entries.clear();
    }

    /// Reset every cached statement, releasing any read transaction a
    /// partially stepped query still holds.
    pub fn reset_all(&mut self) {
        for cached in self.entries.values_mut() {
            cached.statement.reset();
        }
    }

    /// Return the cached statement for `sql`, preparing it on `conn` when
    /// it is missing or predates the current generation.
    pub async fn prepare(&mut self, conn: &Connection, sql: &str) -> Result<&mut Statement> {
        let stale = self
            .entries
            .get(sql)
            .is_none_or(|cached| cached.generation != self.generation);

        if stale {
            let statement = conn
                .prepare(sql)
                .await
                .map_err(|e| DatabaseError::Query(format!("prepare: {e}")))?;
            self.entries.insert(
                sql.to_string(),
                Cached {
                    generation: self.generation,
                    statement,
                },
            );
        }

        let cached = self
            .entries
            .get_mut(sql)
            .ok_or_else(|| DatabaseError::Query(format!("statement cache miss: {sql}")))?;
        cached.statement.reset();
        Ok(&mut cached.statement)
    }
}
