//! Kion REST API client
//!
//! Direct reqwest implementation of [`Remote`] using bearer token
//! authentication. Responses other than 200/201 become errors; 404 is
//! reported as [`ClientError::NotFound`].

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::remote::{Creation, Remote};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;

/// HTTP client for the Kion API
pub struct KionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl KionClient {
    /// Create a new client
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().danger_accept_invalid_certs(config.skip_ssl_validation);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url()?,
            api_key: config.api_key,
        })
    }

    /// Create a client from `KION_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Get the API base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and return the raw response body
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<String> {
        let url = self.url(path);
        tracing::trace!("{} {}", method, url);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(text);
        }

        tracing::debug!("{} {} returned {}", method, url, status);
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound {
                method: method.to_string(),
                url,
                body: text,
            });
        }
        Err(ClientError::Status {
            status: status.as_u16(),
            method: method.to_string(),
            url,
            body: text,
        })
    }
}

fn parse_document(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|_| ClientError::Decode {
        body: text.to_string(),
    })
}

#[async_trait]
impl Remote for KionClient {
    async fn get(&self, path: &str) -> Result<Value> {
        let text = self.send(Method::GET, path, None).await?;
        parse_document(&text)
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Creation> {
        // Owner/association endpoints answer 200 with a record id of 0, so
        // the status code is not checked beyond success here.
        let text = self.send(Method::POST, path, body).await?;
        match parse_document(&text)? {
            Value::Null => Ok(Creation::default()),
            value => serde_json::from_value(value).map_err(|_| ClientError::Decode { body: text }),
        }
    }

    async fn patch(&self, path: &str, body: &Value) -> Result<()> {
        self.send(Method::PATCH, path, Some(body)).await?;
        Ok(())
    }

    async fn put(&self, path: &str, body: &Value) -> Result<()> {
        self.send(Method::PUT, path, Some(body)).await?;
        Ok(())
    }

    async fn delete(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        let text = self.send(Method::DELETE, path, body).await?;
        parse_document(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let client = KionClient::new(ClientConfig::new("https://kion.example.com/", "key")).unwrap();
        assert_eq!(client.base_url(), "https://kion.example.com/api");
        assert_eq!(
            client.url("/v3/account/12"),
            "https://kion.example.com/api/v3/account/12"
        );
    }

    #[test]
    fn test_parse_empty_document() {
        assert_eq!(parse_document("  ").unwrap(), Value::Null);
        assert!(matches!(
            parse_document("<html>"),
            Err(ClientError::Decode { .. })
        ));
    }
}
