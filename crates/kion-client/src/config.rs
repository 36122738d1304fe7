//! Client configuration

use crate::error::{ClientError, Result};
use std::time::Duration;

const DEFAULT_API_PATH: &str = "/api";

/// Connection settings for the Kion API
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL without trailing slash, e.g. `https://kion.example.com`
    pub url: String,
    /// API key sent as a bearer token
    pub api_key: String,
    /// Base path of the API
    pub api_path: String,
    pub skip_ssl_validation: bool,
    /// Per-request timeout; `None` leaves reqwest's default
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            api_path: DEFAULT_API_PATH.to_string(),
            skip_ssl_validation: false,
            request_timeout: None,
        }
    }

    /// Create ClientConfig from environment variables
    ///
    /// `KION_URL` and `KION_APIKEY` are required; `KION_APIPATH` defaults to
    /// `/api` and `KION_SKIPSSLVALIDATION` accepts `true`/`1`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("KION_URL")
            .ok_or_else(|| ClientError::MissingEnvVar("KION_URL".to_string()))?;
        let api_key = lookup("KION_APIKEY")
            .ok_or_else(|| ClientError::MissingEnvVar("KION_APIKEY".to_string()))?;

        let mut config = Self::new(url, api_key);
        if let Some(path) = lookup("KION_APIPATH") {
            config.api_path = path;
        }
        if let Some(skip) = lookup("KION_SKIPSSLVALIDATION") {
            config.skip_ssl_validation = parse_bool(&skip)?;
        }
        Ok(config)
    }

    /// Full base URL the request paths are appended to
    pub fn base_url(&self) -> Result<String> {
        let url = self.url.trim_end_matches('/');
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ClientError::InvalidConfig(format!(
                "The URL is not valid: {}",
                self.url
            )));
        }
        let path = self.api_path.trim_matches('/');
        if path.is_empty() {
            Ok(url.to_string())
        } else {
            Ok(format!("{}/{}", url, path))
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => Err(ClientError::InvalidConfig(format!(
            "KION_SKIPSSLVALIDATION must be a boolean, got {other}"
        ))),
    }
}
