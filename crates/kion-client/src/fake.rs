//! In-memory [`Remote`] for tests
//!
//! Responses are scripted per method and path. One-shot responses queued
//! with [`FakeRemote::on`] are consumed first, then the sticky response set
//! with [`FakeRemote::always`]; an unscripted route answers 404.

use crate::error::{ClientError, Result};
use crate::remote::{Creation, Remote};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeMethod {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl std::fmt::Display for FakeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FakeMethod::Get => write!(f, "GET"),
            FakeMethod::Post => write!(f, "POST"),
            FakeMethod::Patch => write!(f, "PATCH"),
            FakeMethod::Put => write!(f, "PUT"),
            FakeMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// A scripted answer
#[derive(Debug, Clone)]
pub enum FakeResponse {
    /// 200 with a JSON document
    Json(Value),
    /// 201 with `{"record_id": id}`
    Created(u64),
    /// 200 with an empty body
    Ok,
    NotFound,
    /// Non-2xx with the given body
    Status(u16, String),
}

/// A request the fake received
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: FakeMethod,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Default)]
struct Routes {
    queued: HashMap<(FakeMethod, String), VecDeque<FakeResponse>>,
    sticky: HashMap<(FakeMethod, String), FakeResponse>,
    calls: Vec<RecordedCall>,
}

#[derive(Default)]
pub struct FakeRemote {
    routes: Mutex<Routes>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response
    pub fn on(&self, method: FakeMethod, path: impl Into<String>, response: FakeResponse) -> &Self {
        self.lock()
            .queued
            .entry((method, path.into()))
            .or_default()
            .push_back(response);
        self
    }

    /// Answer every remaining request on this route with `response`
    pub fn always(
        &self,
        method: FakeMethod,
        path: impl Into<String>,
        response: FakeResponse,
    ) -> &Self {
        self.lock().sticky.insert((method, path.into()), response);
        self
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Calls matching a method and path
    pub fn calls_to(&self, method: FakeMethod, path: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn respond(&self, method: FakeMethod, path: &str, body: Option<&Value>) -> Result<Value> {
        let mut routes = self.lock();
        routes.calls.push(RecordedCall {
            method,
            path: path.to_string(),
            body: body.cloned(),
        });

        let key = (method, path.to_string());
        let response = routes
            .queued
            .get_mut(&key)
            .and_then(|q| q.pop_front())
            .or_else(|| routes.sticky.get(&key).cloned())
            .unwrap_or(FakeResponse::NotFound);

        match response {
            FakeResponse::Json(value) => Ok(value),
            FakeResponse::Created(id) => Ok(serde_json::json!({ "record_id": id, "status": 201 })),
            FakeResponse::Ok => Ok(Value::Null),
            FakeResponse::NotFound => Err(ClientError::NotFound {
                method: method.to_string(),
                url: path.to_string(),
                body: String::new(),
            }),
            FakeResponse::Status(status, body) => Err(ClientError::Status {
                status,
                method: method.to_string(),
                url: path.to_string(),
                body,
            }),
        }
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn get(&self, path: &str) -> Result<Value> {
        self.respond(FakeMethod::Get, path, None)
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Creation> {
        let value = self.respond(FakeMethod::Post, path, body)?;
        if value.is_null() {
            return Ok(Creation::default());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn patch(&self, path: &str, body: &Value) -> Result<()> {
        self.respond(FakeMethod::Patch, path, Some(body)).map(|_| ())
    }

    async fn put(&self, path: &str, body: &Value) -> Result<()> {
        self.respond(FakeMethod::Put, path, Some(body)).map(|_| ())
    }

    async fn delete(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        self.respond(FakeMethod::Delete, path, body)
    }
}
