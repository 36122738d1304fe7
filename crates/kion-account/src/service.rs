//! Account lifecycle orchestration

use crate::association::{read_labels, reconcile_labels};
use crate::conversion::{ConversionRequest, Converter, RetryConfig, current_datecode};
use crate::creator::{CreationLock, create_cache_account};
use crate::error::{AccountError, Result};
use crate::location::{self, ImportId, Location, resolve};
use crate::model::{
    AccountId, AccountRecord, AccountSpec, AccountState, AccountType, updatable_body,
};
use crate::poller::{ACCOUNT_CREATED, ACCOUNT_EXISTS, MISSING_ACCOUNT_NUMBER, PollConfig, Poller};
use kion_client::Remote;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Tunables for [`AccountService`]
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline for a newly created account to become ready
    pub create_timeout: Duration,
    pub retry: RetryConfig,
    pub poll_min_interval: Duration,
    pub poll_max_interval: Duration,
    pub poll_jitter: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let poll = PollConfig::default();
        Self {
            create_timeout: Duration::from_secs(20 * 60),
            retry: RetryConfig::default(),
            poll_min_interval: poll.min_interval,
            poll_max_interval: poll.max_interval,
            poll_jitter: poll.jitter,
        }
    }
}

impl ServiceConfig {
    fn poll_config(&self, account_type: AccountType) -> PollConfig {
        let preset = match account_type {
            AccountType::GoogleCloud => PollConfig::account_exists(self.create_timeout),
            _ => PollConfig::account_number(self.create_timeout),
        };
        preset
            .with_intervals(self.poll_min_interval, self.poll_max_interval)
            .with_jitter(self.poll_jitter)
    }
}

/// Creates, reads, updates and deletes accounts against one Kion service
///
/// The service owns the [`CreationLock`]; clones share it.
#[derive(Clone)]
pub struct AccountService {
    remote: Arc<dyn Remote>,
    lock: CreationLock,
    converter: Converter,
    config: ServiceConfig,
}

impl AccountService {
    pub fn new(remote: Arc<dyn Remote>) -> Self {
        Self::with_config(remote, ServiceConfig::default())
    }

    pub fn with_config(remote: Arc<dyn Remote>, config: ServiceConfig) -> Self {
        Self {
            remote,
            lock: CreationLock::new(),
            converter: Converter::new(config.retry),
            config,
        }
    }

    /// Replace the creation lock, e.g. to share one across services
    pub fn with_lock(mut self, lock: CreationLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Create or import the account described by `spec`
    ///
    /// Once the account exists remotely, any later failure is returned as
    /// [`AccountError::Partial`] carrying the state reached so far.
    #[instrument(skip(self, spec, cancel), fields(account_type = %spec.account_type, name = %spec.name))]
    pub async fn create(&self, spec: &AccountSpec, cancel: &CancellationToken) -> Result<AccountState> {
        let resolution = resolve(None, None, spec.project().is_some());
        let imported = spec.account_number.is_some();
        let mut state = if imported {
            self.import_existing(spec, resolution.location).await?
        } else {
            let cache_id = create_cache_account(
                self.remote.as_ref(),
                &self.lock,
                spec.account_type,
                &spec.create_body(),
            )
            .await?;
            AccountState::cached(cache_id, spec.account_type)
        };
        state.attributes = desired_attributes(spec);

        if let Err(e) = self.settle(&mut state, spec, !imported, cancel).await {
            warn!(
                "Create of {} stopped with account {} in {}: {}",
                spec.name, state.id, state.location, e
            );
            return Err(AccountError::partial(state, e));
        }

        info!("Account {} ready in {}", state.id, state.location);
        Ok(state)
    }

    async fn import_existing(&self, spec: &AccountSpec, location: Location) -> Result<AccountState> {
        let project = spec.project();
        if project.is_some() && spec.start_datecode.is_none() {
            return Err(AccountError::InvalidRecord(format!(
                "importing {} into a project requires a start datecode",
                spec.name
            )));
        }

        let path = format!(
            "/v3/{}?account-type={}",
            location.collection(),
            spec.account_type.query_value()
        );
        debug!("Importing {} account via POST {}", spec.account_type, path);
        let created = self
            .remote
            .post(&path, Some(&spec.import_body(location)))
            .await
            .map_err(|e| AccountError::remote("import account", &spec.name, e))?;
        if created.record_id == 0 {
            return Err(AccountError::InvalidRecord(format!(
                "import of {} returned record id 0",
                spec.name
            )));
        }

        let id = AccountId(created.record_id);
        Ok(match project {
            Some(project) => {
                let mut state = AccountState::in_project(id, spec.account_type, project);
                state.start_datecode = spec.start_datecode.clone();
                state
            }
            None => AccountState::cached(id, spec.account_type),
        })
    }

    /// Steps after the create or import POST, applied to `state` as they complete
    async fn settle(
        &self,
        state: &mut AccountState,
        spec: &AccountSpec,
        created: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if created {
            self.wait_until_created(state.account_type, state.id, cancel)
                .await?;

            if let Some(project) = spec.project() {
                let datecode = spec
                    .start_datecode
                    .clone()
                    .unwrap_or_else(current_datecode);
                let request =
                    ConversionRequest::to_project(state.account_type, state.id, project, &datecode);
                let new_id = self
                    .converter
                    .convert(self.remote.as_ref(), &request, cancel)
                    .await?;
                state.relocate(new_id, Some(project));
                state.start_datecode = Some(datecode);
            }
        }

        if let Some(datecode) = &state.start_datecode {
            state
                .attributes
                .insert("start_datecode".to_string(), json!(datecode));
        }
        self.apply_labels(state, spec).await?;
        state.check_invariant()
    }

    async fn wait_until_created(
        &self,
        account_type: AccountType,
        id: AccountId,
        cancel: &CancellationToken,
    ) -> Result<AccountRecord> {
        let poller = Poller::new(self.config.poll_config(account_type));
        let remote = self.remote.as_ref();
        let exists_only = account_type == AccountType::GoogleCloud;
        let label = Location::Cache.record_path(id);

        poller
            .wait_until_ready(&label, cancel, move || async move {
                let record = location::fetch(remote, id, Location::Cache).await?;
                let state = if exists_only {
                    ACCOUNT_EXISTS
                } else if record.account_number().is_empty() {
                    MISSING_ACCOUNT_NUMBER
                } else {
                    ACCOUNT_CREATED
                };
                Ok((record, state.to_string()))
            })
            .await
    }

    /// Refresh a tracked account from the service
    ///
    /// The stored location is authoritative; a 404 there is reported as
    /// [`AccountError::NotFound`] without looking in the other collection.
    #[instrument(skip(self, state), fields(id = %state.id))]
    pub async fn read(&self, state: &AccountState) -> Result<(AccountState, AccountRecord)> {
        let resolution = resolve(Some(state.location), None, state.project_id.is_some());
        let (_, record) = location::probe(self.remote.as_ref(), state.id, &resolution.probe_order())
            .await?;
        let mut current = refreshed(state.clone(), &record);
        self.refresh_labels(&mut current).await?;
        Ok((current, record))
    }

    /// Adopt an existing account by import id
    ///
    /// `account_id=N` and `account_cache_id=N` pin the collection; a bare id
    /// is looked up in the cache first, then in projects.
    #[instrument(skip(self))]
    pub async fn import(
        &self,
        account_type: AccountType,
        import_id: &str,
    ) -> Result<(AccountState, AccountRecord)> {
        let import = ImportId::parse(import_id)?;
        let resolution = resolve(None, Some(&import), false);
        let (location, record) =
            location::probe(self.remote.as_ref(), import.id, &resolution.probe_order()).await?;
        debug!("Import id {} resolved to {}", import_id, location);

        let mut state = refreshed(AccountState::cached(import.id, account_type), &record);
        self.refresh_labels(&mut state).await?;
        Ok((state, record))
    }

    /// Replace tracked labels with the ones stored remotely
    async fn refresh_labels(&self, state: &mut AccountState) -> Result<()> {
        if state.location == Location::Cache {
            return Ok(());
        }
        match read_labels(self.remote.as_ref(), Location::Project.collection(), state.id).await {
            Ok(labels) => state.labels = labels,
            Err(AccountError::Association { source, .. }) if source.is_not_found() => {
                debug!("No labels recorded for account {}", state.id);
                state.labels.clear();
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Bring a tracked account in line with `desired`
    ///
    /// `state` is updated after every completed step, so on error it still
    /// names the account's current id and location.
    #[instrument(skip(self, state, desired, cancel), fields(id = %state.id))]
    pub async fn update(
        &self,
        state: &mut AccountState,
        desired: &AccountSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.apply_location(state, desired, cancel).await?;
        self.apply_attributes(state, desired).await?;
        self.apply_labels(state, desired).await?;
        state.check_invariant()
    }

    async fn apply_location(
        &self,
        state: &mut AccountState,
        desired: &AccountSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let account_type = state.account_type;
        let request = match (state.project_id, desired.project()) {
            (None, Some(project)) => {
                let datecode = desired
                    .start_datecode
                    .clone()
                    .unwrap_or_else(current_datecode);
                ConversionRequest::to_project(account_type, state.id, project, datecode)
            }
            (Some(current), None) => ConversionRequest::to_cache(account_type, state.id, current),
            (Some(current), Some(project)) if current != project => {
                ConversionRequest::between_projects(
                    account_type,
                    state.id,
                    current,
                    project,
                    desired.move_settings.unwrap_or_default(),
                )
            }
            _ => return Ok(()),
        };

        let new_id = self
            .converter
            .convert(self.remote.as_ref(), &request, cancel)
            .await?;
        info!(
            "Account {} is now {} in {}",
            state.id, new_id, request.target
        );
        state.relocate(new_id, request.project_id);

        match request.target {
            Location::Project if request.source == Location::Cache => {
                state.start_datecode = request.start_datecode.clone();
                if let Some(datecode) = &state.start_datecode {
                    state
                        .attributes
                        .insert("start_datecode".to_string(), json!(datecode));
                }
            }
            Location::Cache => {
                state.start_datecode = None;
                state.attributes.remove("start_datecode");
            }
            Location::Project => {}
        }
        Ok(())
    }

    async fn apply_attributes(&self, state: &mut AccountState, desired: &AccountSpec) -> Result<()> {
        let wanted = desired_attributes(desired);
        let body = updatable_body(state.location, &wanted);
        if body == updatable_body(state.location, &state.attributes) {
            return Ok(());
        }

        let path = state.path();
        debug!("Updating account attributes via PATCH {}", path);
        self.remote
            .patch(&path, &body)
            .await
            .map_err(|e| AccountError::remote("update account", state.id, e))?;

        if state.location == Location::Project {
            state.start_datecode = desired.start_datecode.clone().or(state.start_datecode.take());
        }
        state.attributes = wanted;
        Ok(())
    }

    async fn apply_labels(&self, state: &mut AccountState, desired: &AccountSpec) -> Result<()> {
        if state.location == Location::Cache {
            if !desired.labels.is_empty() {
                warn!("Labels are ignored while account {} is in the cache", state.id);
            }
            return Ok(());
        }
        reconcile_labels(
            self.remote.as_ref(),
            Location::Project.collection(),
            state.id,
            &state.labels,
            &desired.labels,
        )
        .await?;
        state.labels = desired.labels.clone();
        Ok(())
    }

    /// Remove the account; an account already gone counts as deleted
    #[instrument(skip(self, state), fields(id = %state.id))]
    pub async fn delete(&self, state: &AccountState) -> Result<()> {
        let path = state.path();
        match self.remote.delete(&path, None).await {
            Ok(_) => {
                info!("Deleted account {} from {}", state.id, state.location);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Account {} already deleted", state.id);
                Ok(())
            }
            Err(e) => Err(AccountError::remote("delete account", state.id, e)),
        }
    }
}

/// Attributes tracked for change detection, including the account name
fn desired_attributes(spec: &AccountSpec) -> Map<String, Value> {
    let mut attributes = spec.attributes.clone();
    attributes.insert("account_name".to_string(), json!(spec.name));
    if let Some(datecode) = &spec.start_datecode {
        attributes.insert("start_datecode".to_string(), json!(datecode));
    }
    attributes
}

fn refreshed(mut state: AccountState, record: &AccountRecord) -> AccountState {
    state.location = record.location();
    state.project_id = record.project_id();
    match record {
        AccountRecord::Project(account) => {
            if !account.start_datecode.is_empty() {
                state.start_datecode = Some(account.start_datecode.clone());
                state
                    .attributes
                    .insert("start_datecode".to_string(), json!(account.start_datecode));
            }
            state
                .attributes
                .insert("account_name".to_string(), json!(account.account_name));
        }
        AccountRecord::Cache(account) => {
            state.start_datecode = None;
            state.attributes.remove("start_datecode");
            state.labels.clear();
            state
                .attributes
                .insert("account_name".to_string(), json!(account.account_name));
        }
    }
    state
}
