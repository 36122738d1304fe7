//! Kion client error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {method} {url}: {body}")]
    NotFound {
        method: String,
        url: String,
        body: String,
    },

    #[error("url: {url}, method: {method}, status: {status}, body: {body}")]
    Status {
        status: u16,
        method: String,
        url: String,
        body: String,
    },

    #[error("could not unmarshal response body: {body}")]
    Decode { body: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// True for an HTTP 404 from the remote service.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    /// HTTP status code, when the error came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::NotFound { .. } => Some(404),
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// The `message` field of a JSON error body, if the service sent one.
    pub fn api_message(&self) -> Option<String> {
        let body = match self {
            ClientError::NotFound { body, .. } | ClientError::Status { body, .. } => body,
            _ => return None,
        };
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        value
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
