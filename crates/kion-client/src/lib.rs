//! Kion API access layer
//!
//! The reconciliation core talks to the Kion service only through the
//! [`Remote`] trait. [`KionClient`] implements it over HTTPS with reqwest.
//!
//! # Configuration
//!
//! - `KION_URL`: base URL of the Kion installation (required)
//! - `KION_APIKEY`: app API key (required)
//! - `KION_APIPATH`: API base path, default `/api`
//! - `KION_SKIPSSLVALIDATION`: accept invalid TLS certificates
//!
//! # Example
//!
//! ```ignore
//! use kion_client::{KionClient, RemoteExt};
//!
//! let client = KionClient::from_env()?;
//! let account: serde_json::Value = client.get_as("/v3/account/12").await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod remote;

pub use client::KionClient;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
#[cfg(any(test, feature = "test-utils"))]
pub use fake::{FakeMethod, FakeRemote, FakeResponse, RecordedCall};
pub use remote::{Creation, Remote, RemoteExt};
