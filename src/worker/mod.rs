//! Worker transport: one isolated thread per backing engine.
//!
//! Core components:
//! - `protocol`: Envelopes, replies and log events crossing the boundary
//! - `pending`: Outstanding requests keyed by sequence number
//! - `surface`: The named SQL methods a worker serves
//! - `host`: The worker thread loop (FIFO, one engine)
//! - `transport`: Host-side `Transport` contract and its worker-backed impl

pub(crate) mod host;
pub mod pending;
pub mod protocol;
pub mod surface;
pub mod transport;

pub use protocol::{CallOutcome, SqlCallResult, WorkerTag};
pub use surface::{Args, SqlSurface};
pub use transport::{Transport, WorkerOptions, WorkerTransport};
