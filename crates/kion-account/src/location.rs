//! Where an account lives: the cache pool or a project
//!
//! Resolution precedence, first match wins:
//!
//! 1. an import id prefix (`account_id=` or `account_cache_id=`)
//! 2. the location recorded in stored state
//! 3. a non-zero project id
//! 4. the cache
//!
//! The first two are authoritative: a lookup miss must be reported, never
//! retried against the other collection. Only inferred locations may be
//! probed with a fallback.

use crate::error::{AccountError, Result};
use crate::model::{AccountId, AccountRecord, CacheAccount, Envelope, ProjectAccount};
use kion_client::{Remote, RemoteExt};
use serde::{Deserialize, Serialize};

const ACCOUNT_ID_PREFIX: &str = "account_id=";
const ACCOUNT_CACHE_ID_PREFIX: &str = "account_cache_id=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Project,
    Cache,
}

impl Location {
    pub fn other(&self) -> Location {
        match self {
            Location::Project => Location::Cache,
            Location::Cache => Location::Project,
        }
    }

    /// Collection path segment
    pub fn collection(&self) -> &'static str {
        match self {
            Location::Project => "account",
            Location::Cache => "account-cache",
        }
    }

    pub fn record_path(&self, id: AccountId) -> String {
        format!("/v3/{}/{}", self.collection(), id)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Project => write!(f, "project"),
            Location::Cache => write!(f, "cache"),
        }
    }
}

impl std::str::FromStr for Location {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(Location::Project),
            "cache" => Ok(Location::Cache),
            other => Err(AccountError::InvalidRecord(format!(
                "unknown account location '{other}'"
            ))),
        }
    }
}

/// Which signal decided the location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationSource {
    ImportPrefix,
    StoredState,
    ProjectId,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub location: Location,
    pub source: LocationSource,
}

impl Resolution {
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self.source,
            LocationSource::ImportPrefix | LocationSource::StoredState
        )
    }

    /// Locations a read may try, in order
    pub fn probe_order(&self) -> Vec<Location> {
        if self.is_authoritative() {
            vec![self.location]
        } else {
            vec![self.location, self.location.other()]
        }
    }
}

/// An import identifier, optionally tagged with its collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportId {
    pub id: AccountId,
    pub location: Option<Location>,
}

impl ImportId {
    /// Parse `account_id=42`, `account_cache_id=42` or a bare `42`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (location, number) = if let Some(rest) = raw.strip_prefix(ACCOUNT_ID_PREFIX) {
            (Some(Location::Project), rest)
        } else if let Some(rest) = raw.strip_prefix(ACCOUNT_CACHE_ID_PREFIX) {
            (Some(Location::Cache), rest)
        } else {
            (None, raw)
        };

        let id = number
            .parse::<u64>()
            .map_err(|_| AccountError::InvalidImportId(raw.to_string()))?;
        Ok(Self {
            id: AccountId(id),
            location,
        })
    }
}

/// Decide where an account lives
pub fn resolve(
    explicit: Option<Location>,
    import_id: Option<&ImportId>,
    has_project_id: bool,
) -> Resolution {
    if let Some(location) = import_id.and_then(|i| i.location) {
        return Resolution {
            location,
            source: LocationSource::ImportPrefix,
        };
    }
    if let Some(location) = explicit {
        return Resolution {
            location,
            source: LocationSource::StoredState,
        };
    }
    if has_project_id {
        return Resolution {
            location: Location::Project,
            source: LocationSource::ProjectId,
        };
    }
    Resolution {
        location: Location::Cache,
        source: LocationSource::Default,
    }
}

/// Fetch the account from one collection
pub async fn fetch<R: Remote + ?Sized>(
    remote: &R,
    id: AccountId,
    location: Location,
) -> kion_client::Result<AccountRecord> {
    let path = location.record_path(id);
    match location {
        Location::Project => {
            let envelope: Envelope<ProjectAccount> = remote.get_as(&path).await?;
            Ok(AccountRecord::Project(envelope.data))
        }
        Location::Cache => {
            let envelope: Envelope<CacheAccount> = remote.get_as(&path).await?;
            Ok(AccountRecord::Cache(envelope.data))
        }
    }
}

/// Try each location in order, stopping at the first answer that is not a 404
pub async fn probe<R: Remote + ?Sized>(
    remote: &R,
    id: AccountId,
    order: &[Location],
) -> Result<(Location, AccountRecord)> {
    for &location in order {
        match fetch(remote, id, location).await {
            Ok(record) => return Ok((location, record)),
            Err(e) if e.is_not_found() => {
                tracing::debug!("Account {} not found in {}", id, location);
            }
            Err(e) => return Err(AccountError::remote("read account", id, e)),
        }
    }
    Err(AccountError::NotFound(format!(
        "account {} in {}",
        id,
        order
            .iter()
            .map(Location::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    )))
}
