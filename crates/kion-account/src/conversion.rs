//! Moving accounts between the cache and projects
//!
//! Every transition is a single remote call that answers with the record id
//! the account carries afterwards. Callers must replace their stored id with
//! it.

use crate::error::{AccountError, Result};
use crate::location::Location;
use crate::model::{AccountId, AccountType, MoveSettings, ProjectId};
use kion_client::{ClientError, Creation, Remote, RemoteExt};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Remote message reported while a cloud rule is still being applied
pub const RULE_IN_PROGRESS: &str = "Rule is already in progress";

/// Retry policy for cache to project conversions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(30),
        }
    }
}

/// One requested transition
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub account_type: AccountType,
    pub source: Location,
    pub target: Location,
    pub source_id: AccountId,
    /// Project the account is currently in
    pub current_project_id: Option<ProjectId>,
    /// Project wanted after the transition
    pub project_id: Option<ProjectId>,
    /// YYYY-MM or YYYYMM, used when entering a project from the cache
    pub start_datecode: Option<String>,
    pub move_settings: MoveSettings,
}

impl ConversionRequest {
    pub fn to_project(
        account_type: AccountType,
        cache_id: AccountId,
        project_id: ProjectId,
        start_datecode: impl Into<String>,
    ) -> Self {
        Self {
            account_type,
            source: Location::Cache,
            target: Location::Project,
            source_id: cache_id,
            current_project_id: None,
            project_id: Some(project_id),
            start_datecode: Some(start_datecode.into()),
            move_settings: MoveSettings::default(),
        }
    }

    pub fn to_cache(account_type: AccountType, account_id: AccountId, current: ProjectId) -> Self {
        Self {
            account_type,
            source: Location::Project,
            target: Location::Cache,
            source_id: account_id,
            current_project_id: Some(current),
            project_id: None,
            start_datecode: None,
            move_settings: MoveSettings::default(),
        }
    }

    pub fn between_projects(
        account_type: AccountType,
        account_id: AccountId,
        current: ProjectId,
        target: ProjectId,
        move_settings: MoveSettings,
    ) -> Self {
        Self {
            account_type,
            source: Location::Project,
            target: Location::Project,
            source_id: account_id,
            current_project_id: Some(current),
            project_id: Some(target),
            start_datecode: None,
            move_settings,
        }
    }
}

#[derive(Debug, Serialize)]
struct MoveBody {
    project_id: u64,
    financials: String,
    move_datecode: u32,
}

/// Strip separators from a datecode (`2024-03` becomes `202403`)
pub fn normalize_datecode(datecode: &str) -> String {
    datecode.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Current month as YYYYMM
pub fn current_datecode() -> String {
    chrono::Utc::now().format("%Y%m").to_string()
}

/// Whether `err` reports a cloud rule still being applied to the account
pub fn is_transient_conflict(err: &ClientError) -> bool {
    match err.api_message() {
        Some(message) => message.contains(RULE_IN_PROGRESS),
        // Older services answer with a plain text body.
        None => err.to_string().contains(RULE_IN_PROGRESS),
    }
}

/// Executes [`ConversionRequest`]s
#[derive(Debug, Clone, Default)]
pub struct Converter {
    retry: RetryConfig,
}

impl Converter {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Perform the transition and return the account's new id
    pub async fn convert<R: Remote + ?Sized>(
        &self,
        remote: &R,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<AccountId> {
        match (request.source, request.target) {
            (Location::Cache, Location::Project) => {
                let project = request.project_id.ok_or_else(|| {
                    AccountError::InvalidTransition(format!(
                        "cached account {} needs a project to convert into",
                        request.source_id
                    ))
                })?;
                self.cache_to_project(remote, request, project, cancel).await
            }
            (Location::Project, Location::Cache) => self.project_to_cache(remote, request).await,
            (Location::Project, Location::Project) => {
                let project = request.project_id.ok_or_else(|| {
                    AccountError::InvalidTransition(format!(
                        "account {} needs a target project",
                        request.source_id
                    ))
                })?;
                if request.current_project_id == Some(project) {
                    tracing::debug!(
                        "Account {} already in project {}",
                        request.source_id,
                        project
                    );
                    return Ok(request.source_id);
                }
                self.move_between_projects(remote, request, project).await
            }
            (Location::Cache, Location::Cache) => Err(AccountError::InvalidTransition(format!(
                "cached account {} is already in the cache",
                request.source_id
            ))),
        }
    }

    async fn cache_to_project<R: Remote + ?Sized>(
        &self,
        remote: &R,
        request: &ConversionRequest,
        project: ProjectId,
        cancel: &CancellationToken,
    ) -> Result<AccountId> {
        const OPERATION: &str = "convert cached account to project account";

        let datecode = request
            .start_datecode
            .as_deref()
            .map(normalize_datecode)
            .unwrap_or_else(current_datecode);
        let path = format!(
            "/v3/account-cache/{}/convert/{}?start_datecode={}",
            request.source_id, project, datecode
        );
        let retrying = request.account_type.retries_rule_conflicts();
        let max_attempts = self.retry.max_attempts.max(1);

        tracing::info!(
            "Converting cached account {} into project {}",
            request.source_id,
            project
        );

        let mut attempt = 1;
        loop {
            let err = match remote.post(&path, None).await {
                Ok(created) => return checked_id(OPERATION, request.source_id, created),
                Err(e) => e,
            };

            if !is_transient_conflict(&err) {
                return Err(AccountError::remote(OPERATION, request.source_id, err));
            }
            if !retrying {
                return Err(AccountError::TransientConflict {
                    id: request.source_id.to_string(),
                    source: err,
                });
            }
            if attempt >= max_attempts {
                return Err(AccountError::RetriesExhausted {
                    operation: OPERATION,
                    id: request.source_id.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            tracing::warn!(
                "Cloud rule in progress for cached account {} (attempt {}/{}), retrying in {:?}",
                request.source_id,
                attempt,
                max_attempts,
                self.retry.delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(AccountError::Cancelled(format!(
                        "converting cached account {}",
                        request.source_id
                    )));
                }
                _ = tokio::time::sleep(self.retry.delay) => {}
            }
            attempt += 1;
        }
    }

    async fn project_to_cache<R: Remote + ?Sized>(
        &self,
        remote: &R,
        request: &ConversionRequest,
    ) -> Result<AccountId> {
        const OPERATION: &str = "convert project account to cached account";

        let path = format!("/v3/account/revert/{}", request.source_id);
        tracing::info!("Reverting account {} to the cache", request.source_id);
        let reverted: Creation = remote
            .delete_as(&path, None)
            .await
            .map_err(|e| AccountError::remote(OPERATION, request.source_id, e))?;
        checked_id(OPERATION, request.source_id, reverted)
    }

    async fn move_between_projects<R: Remote + ?Sized>(
        &self,
        remote: &R,
        request: &ConversionRequest,
        project: ProjectId,
    ) -> Result<AccountId> {
        const OPERATION: &str = "move account to a different project";

        let body = MoveBody {
            project_id: project.0,
            financials: request.move_settings.financials.to_string(),
            move_datecode: request.move_settings.move_datecode.unwrap_or(0),
        };
        let body = serde_json::to_value(&body).map_err(|e| AccountError::InvalidRecord(e.to_string()))?;
        let path = format!("/v3/account/{}/move", request.source_id);

        tracing::info!(
            "Moving account {} from project {:?} to project {} ({})",
            request.source_id,
            request.current_project_id.map(|p| p.0),
            project,
            request.move_settings.financials
        );
        let moved = remote
            .post(&path, Some(&body))
            .await
            .map_err(|e| AccountError::remote(OPERATION, request.source_id, e))?;
        checked_id(OPERATION, request.source_id, moved)
    }
}

fn checked_id(operation: &str, source: AccountId, created: Creation) -> Result<AccountId> {
    if created.record_id == 0 {
        return Err(AccountError::InvalidRecord(format!(
            "{operation} for {source} returned record id 0"
        )));
    }
    Ok(AccountId(created.record_id))
}
