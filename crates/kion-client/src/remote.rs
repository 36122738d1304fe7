//! The remote-access seam used by every reconciliation step

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generic access to the Kion REST API.
///
/// Paths are relative to the configured API base (e.g. `/v3/account/12`).
/// Every method distinguishes an HTTP 404 (`ClientError::NotFound`) from
/// other failures so callers can treat absence as a state, not an error.
#[async_trait]
pub trait Remote: Send + Sync {
    /// GET a JSON document
    async fn get(&self, path: &str) -> Result<Value>;

    /// POST an optional JSON body; creation endpoints answer with a record id
    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Creation>;

    /// PATCH a JSON body
    async fn patch(&self, path: &str, body: &Value) -> Result<()>;

    /// PUT a JSON body
    async fn put(&self, path: &str, body: &Value) -> Result<()>;

    /// DELETE with an optional JSON body, returning the response document
    /// (`Value::Null` when the service sent none)
    async fn delete(&self, path: &str, body: Option<&Value>) -> Result<Value>;
}

/// Typed helpers on top of [`Remote`]
#[async_trait]
pub trait RemoteExt: Remote {
    /// GET and deserialize the response into `T`
    async fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.get(path).await?;
        decode(value)
    }

    /// DELETE and deserialize the response into `T`
    async fn delete_as<T: DeserializeOwned>(&self, path: &str, body: Option<&Value>) -> Result<T> {
        let value = self.delete(path, body).await?;
        decode(value)
    }
}

impl<R: Remote + ?Sized> RemoteExt for R {}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    let body = value.to_string();
    serde_json::from_value(value).map_err(|_| ClientError::Decode { body })
}

/// Response of creation-style endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creation {
    #[serde(default)]
    pub record_id: u64,
    #[serde(default)]
    pub status: u16,
}
