//! Kion account reconciliation core
//!
//! Keeps a locally tracked account in line with its desired state:
//!
//! - [`location`] decides whether an account lives in the cache or a project
//! - [`creator`] and [`poller`] create new accounts and wait until they are usable
//! - [`conversion`] moves accounts between the cache and projects
//! - [`association`] reconciles many-to-many relations with minimal calls
//! - [`service::AccountService`] sequences all of the above per account
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kion_account::{AccountService, AccountSpec, AccountType};
//! use kion_client::KionClient;
//! use tokio_util::sync::CancellationToken;
//!
//! let service = AccountService::new(Arc::new(KionClient::from_env()?));
//! let spec = AccountSpec::new(AccountType::Aws, "sandbox", 1).with_project(5);
//! let state = service.create(&spec, &CancellationToken::new()).await?;
//! ```

pub mod association;
pub mod conversion;
pub mod creator;
pub mod error;
pub mod location;
pub mod model;
pub mod poller;
pub mod service;

pub use association::{
    AssociationChangeSet, AssociationDelta, AssociationEndpoint, ReconcileOutcome, diff,
    read_labels, reconcile, reconcile_all, reconcile_labels,
};
pub use conversion::{ConversionRequest, Converter, RetryConfig};
pub use creator::{CreationLock, create_cache_account};
pub use error::{AccountError, ErrorKind, Result};
pub use location::{ImportId, Location, LocationSource, Resolution, probe, resolve};
pub use model::{
    AccountId, AccountRecord, AccountSpec, AccountState, AccountType, CacheAccount,
    FinancialTransferMode, Label, Labels, MoveSettings, ProjectAccount, ProjectId,
};
pub use poller::{PollConfig, Poller};
pub use service::{AccountService, ServiceConfig};
