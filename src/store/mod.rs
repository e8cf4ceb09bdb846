//! Persistence layer: encrypted SQLite engines and the SQL they serve.
//!
//! - `cipher`: Key validation and the ordered open strategies
//! - `engine`: One encrypted file, one connection
//! - `migrations` / `schema`: Versioned schema steps for both stores
//! - `statements`: Generation-checked prepared statement cache
//! - `records`: JSON documents with extracted columns
//! - `query`: Chunked multi-value queries and full-text search
//! - `unprocessed`: The envelope queue both stores carry
//! - `main_db` / `accelerator_db`: The method tables of each worker

pub mod accelerator_db;
pub mod cipher;
pub mod engine;
pub mod main_db;
pub mod migrations;
pub mod query;
pub mod records;
pub mod schema;
pub mod statements;
pub mod unprocessed;

pub use accelerator_db::{AcceleratorSurface, ReadPosition};
pub use cipher::{DbKey, OpenStrategy};
pub use engine::{CloseOptions, Engine};
pub use main_db::MainSurface;
