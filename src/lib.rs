//! Cipher Store: encrypted, two-engine persistence core.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod store;
pub mod worker;

pub use config::StoreConfig;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
