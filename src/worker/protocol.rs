//! Messages exchanged between a host transport and its worker thread.

use std::fmt;

use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::store::engine::CloseOptions;

/// Which backing engine a worker hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerTag {
    Main,
    Accelerator,
}

impl fmt::Display for WorkerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerTag::Main => f.write_str("main"),
            WorkerTag::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Work a worker can be asked to do.
#[derive(Debug)]
pub enum Request {
    Initialize { key: SecretString },
    Close { options: CloseOptions, exit: bool },
    RemoveDb,
    Rekey { key: SecretString },
    Checkpoint,
    /// Checkpoint, optimize, vacuum and optionally rekey. Backup copies only.
    Maintain { new_key: Option<SecretString> },
    Size,
    SqlCall { method: String, args: Vec<Value> },
    SqlMethods,
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &str {
        match self {
            Request::Initialize { .. } => "initialize",
            Request::Close { .. } => "close",
            Request::RemoveDb => "removeDB",
            Request::Rekey { .. } => "rekey",
            Request::Checkpoint => "checkpoint",
            Request::Maintain { .. } => "maintain",
            Request::Size => "size",
            Request::SqlCall { method, .. } => method,
            Request::SqlMethods => "getSQLMethods",
        }
    }
}

/// A request tagged with its sequence number.
#[derive(Debug)]
pub struct Envelope {
    pub seq: u64,
    pub request: Request,
}

/// Successful reply bodies.
#[derive(Debug)]
pub enum Payload {
    Done,
    Value(Value),
    Size(u64),
    Methods(Vec<String>),
}

/// Answer to exactly one envelope, matched by `seq`.
#[derive(Debug)]
pub struct Reply {
    pub seq: u64,
    pub outcome: Result<Payload, Error>,
    pub duration_ms: u64,
}

/// Log severity carried on the worker's log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warn,
    Error,
}

/// Everything a worker sends back to its host.
#[derive(Debug)]
pub enum WorkerEvent {
    Reply(Reply),
    Log { level: LogLevel, message: String },
}

/// Result of one `sqlCall`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlCallResult {
    pub result: Value,
    pub duration_ms: u64,
    pub seq_id: u64,
}

/// Result of one dispatched call, tagged with the engine that served it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOutcome {
    pub result: Value,
    pub duration_ms: u64,
    pub seq_id: u64,
    pub worker_tag: WorkerTag,
}
