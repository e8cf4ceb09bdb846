//! The SQL method table a worker exposes over `sqlCall`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::store::engine::Engine;
use crate::store::migrations::Schema;

/// A fixed catalog of named methods served against one engine.
///
/// Implementations are stateless apart from configuration; all data lives
/// in the engine. Futures stay on the worker thread, so they need not be
/// `Send`.
#[async_trait(?Send)]
pub trait SqlSurface: Send + Sync {
    /// Schema the engine is migrated to on open.
    fn schema(&self) -> &'static Schema;

    /// Every method name `call` accepts.
    fn methods(&self) -> &'static [&'static str];

    /// Run one method. Unknown names fail with [`Error::UnknownMethod`].
    async fn call(&self, engine: &mut Engine, method: &str, args: Args) -> Result<Json>;
}

/// Positional JSON arguments of one call.
#[derive(Debug, Clone)]
pub struct Args {
    method: String,
    values: Vec<Json>,
}

impl Args {
    pub fn new(method: impl Into<String>, values: Vec<Json>) -> Self {
        Self {
            method: method.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw argument at `index`, if present.
    pub fn raw(&self, index: usize) -> Option<&Json> {
        self.values.get(index)
    }

    /// Decode argument `index`; missing or mistyped is `InvalidArguments`.
    pub fn required<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| self.invalid(format!("missing argument {index}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| self.invalid(format!("argument {index}: {e}")))
    }

    /// Decode argument `index`, treating absent and `null` as `None`.
    pub fn optional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>> {
        match self.values.get(index) {
            None | Some(Json::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| self.invalid(format!("argument {index}: {e}"))),
        }
    }

    pub fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidArguments {
            method: self.method.clone(),
            reason: reason.into(),
        }
    }
}
