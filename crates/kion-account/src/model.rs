//! Account data model

use crate::error::{AccountError, Result};
use crate::location::Location;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Identifier of an account or cached account, assigned by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a Kion project
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl ProjectId {
    /// Treats 0 as "no project", the way the service reports cached accounts
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

/// Deserialize an optional project id, mapping 0 to `None`
fn project_or_none<'de, D>(deserializer: D) -> std::result::Result<Option<ProjectId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<u64>::deserialize(deserializer)?;
    Ok(raw.and_then(ProjectId::from_raw))
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cloud provider kind of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
    Aws,
    GoogleCloud,
    Azure,
    Custom,
}

impl AccountType {
    /// Value of the `account-type` query parameter
    pub fn query_value(&self) -> &'static str {
        match self {
            AccountType::Aws => "aws",
            AccountType::GoogleCloud => "google-cloud",
            AccountType::Azure => "azure",
            AccountType::Custom => "custom",
        }
    }

    /// Field name carrying the provider-side account number
    pub fn account_number_field(&self) -> &'static str {
        match self {
            AccountType::GoogleCloud => "google_cloud_project_id",
            AccountType::Azure => "subscription_uuid",
            AccountType::Aws | AccountType::Custom => "account_number",
        }
    }

    /// Whether cache to project conversion may hit a running rule evaluation
    pub fn retries_rule_conflicts(&self) -> bool {
        matches!(self, AccountType::Aws)
    }

    /// Whether new accounts can be created (as opposed to imported)
    pub fn supports_creation(&self) -> bool {
        !matches!(self, AccountType::Custom)
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.query_value())
    }
}

/// Labels of a project account, one value per key
pub type Labels = BTreeMap<String, String>;

/// One label as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// How financial history follows an account moved between projects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialTransferMode {
    #[default]
    Move,
    Preserve,
}

impl std::fmt::Display for FinancialTransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinancialTransferMode::Move => write!(f, "move"),
            FinancialTransferMode::Preserve => write!(f, "preserve"),
        }
    }
}

/// Settings used only when moving between projects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveSettings {
    pub financials: FinancialTransferMode,
    /// YYYYMM; 0 or `None` moves all financial history
    pub move_datecode: Option<u32>,
}

/// Desired state of one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSpec {
    pub account_type: AccountType,
    pub name: String,
    pub payer_id: u64,
    /// `None` places the account in the cache
    #[serde(default, deserialize_with = "project_or_none")]
    pub project_id: Option<ProjectId>,
    /// YYYY-MM or YYYYMM
    pub start_datecode: Option<String>,
    /// Present when importing an existing provider account
    pub account_number: Option<String>,
    #[serde(default)]
    pub move_settings: Option<MoveSettings>,
    #[serde(default)]
    pub labels: Labels,
    /// Updatable attributes sent as-is (`account_email`, `linked_role`, ...)
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Provider-specific creation fields (`organizational_unit`, `csp`, ...)
    #[serde(default)]
    pub create_fields: Map<String, Value>,
}

impl AccountSpec {
    pub fn new(account_type: AccountType, name: impl Into<String>, payer_id: u64) -> Self {
        Self {
            account_type,
            name: name.into(),
            payer_id,
            project_id: None,
            start_datecode: None,
            account_number: None,
            move_settings: None,
            labels: Labels::new(),
            attributes: Map::new(),
            create_fields: Map::new(),
        }
    }

    pub fn with_project(mut self, project_id: u64) -> Self {
        self.project_id = ProjectId::from_raw(project_id);
        self
    }

    pub fn with_start_datecode(mut self, datecode: impl Into<String>) -> Self {
        self.start_datecode = Some(datecode.into());
        self
    }

    pub fn with_account_number(mut self, number: impl Into<String>) -> Self {
        self.account_number = Some(number.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Wanted project; a stored 0 counts as no project
    pub fn project(&self) -> Option<ProjectId> {
        self.project_id.filter(|p| p.0 != 0)
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Body for `POST /v3/account-cache/create`
    pub(crate) fn create_body(&self) -> Value {
        let mut body = self.create_fields.clone();
        merge_attributes(&mut body, &self.attributes, CREATE_ATTRIBUTES);
        body.insert("account_name".to_string(), json!(self.name));
        body.insert("payer_id".to_string(), json!(self.payer_id));
        Value::Object(body)
    }

    /// Body for importing an existing account into `location`
    pub(crate) fn import_body(&self, location: Location) -> Value {
        let mut body = self.create_fields.clone();
        let allowed = match location {
            Location::Project => PROJECT_UPDATABLE,
            Location::Cache => CACHE_UPDATABLE,
        };
        merge_attributes(&mut body, &self.attributes, allowed);
        body.insert("account_name".to_string(), json!(self.name));
        body.insert("payer_id".to_string(), json!(self.payer_id));
        if let Some(number) = &self.account_number {
            body.insert(
                self.account_type.account_number_field().to_string(),
                json!(number),
            );
        }
        if location == Location::Project {
            let project = self.project().map(|p| p.0).unwrap_or(0);
            body.insert("project_id".to_string(), json!(project));
            body.insert(
                "start_datecode".to_string(),
                json!(self.start_datecode.clone().unwrap_or_default()),
            );
        }
        Value::Object(body)
    }
}

const CREATE_ATTRIBUTES: &[&str] = &[
    "account_alias",
    "account_email",
    "include_linked_account_spend",
    "linked_role",
];

/// Attributes a project account accepts on PATCH
pub(crate) const PROJECT_UPDATABLE: &[&str] = &[
    "account_alias",
    "account_email",
    "account_name",
    "include_linked_account_spend",
    "linked_role",
    "skip_access_checking",
    "start_datecode",
    "use_org_account_info",
];

/// Attributes a cached account accepts on PATCH
pub(crate) const CACHE_UPDATABLE: &[&str] = &[
    "account_alias",
    "account_email",
    "account_name",
    "include_linked_account_spend",
    "linked_role",
    "skip_access_checking",
];

fn merge_attributes(body: &mut Map<String, Value>, attributes: &Map<String, Value>, allowed: &[&str]) {
    for (key, value) in attributes {
        if allowed.contains(&key.as_str()) {
            body.insert(key.clone(), value.clone());
        }
    }
}

/// PATCH body restricted to what `location` accepts
pub(crate) fn updatable_body(location: Location, attributes: &Map<String, Value>) -> Value {
    let allowed = match location {
        Location::Project => PROJECT_UPDATABLE,
        Location::Cache => CACHE_UPDATABLE,
    };
    let mut body = Map::new();
    merge_attributes(&mut body, attributes, allowed);
    Value::Object(body)
}

/// Locally tracked state of one account after the last apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub id: AccountId,
    pub account_type: AccountType,
    pub location: Location,
    #[serde(default, deserialize_with = "project_or_none")]
    pub project_id: Option<ProjectId>,
    pub start_datecode: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl AccountState {
    pub fn cached(id: AccountId, account_type: AccountType) -> Self {
        Self {
            id,
            account_type,
            location: Location::Cache,
            project_id: None,
            start_datecode: None,
            labels: Labels::new(),
            attributes: Map::new(),
        }
    }

    pub fn in_project(id: AccountId, account_type: AccountType, project_id: ProjectId) -> Self {
        Self {
            location: Location::Project,
            project_id: Some(project_id),
            ..Self::cached(id, account_type)
        }
    }

    /// Record that the account now lives at `location` under a new id
    pub fn relocate(&mut self, id: AccountId, project_id: Option<ProjectId>) {
        self.id = id;
        self.project_id = project_id.filter(|p| p.0 != 0);
        self.location = if self.project_id.is_some() {
            Location::Project
        } else {
            Location::Cache
        };
        if self.location == Location::Cache {
            // Cached accounts carry no labels.
            self.labels.clear();
        }
    }

    /// Project id is set if and only if the account is in a project
    pub fn check_invariant(&self) -> Result<()> {
        match (self.location, self.project_id) {
            (Location::Project, Some(_)) | (Location::Cache, None) => Ok(()),
            (location, project) => Err(AccountError::InvalidRecord(format!(
                "account {} has location {} but project {:?}",
                self.id, location, project
            ))),
        }
    }

    /// Path of this account's record
    pub fn path(&self) -> String {
        self.location.record_path(self.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Envelope<T> {
    pub data: T,
}

/// Account attached to a project, as returned by `GET /v3/account/{id}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectAccount {
    pub id: u64,
    pub account_alias: Option<String>,
    pub account_number: String,
    pub account_type_id: u64,
    pub car_external_id: String,
    pub created_at: String,
    pub account_email: String,
    pub include_linked_account_spend: bool,
    pub linked_account_number: String,
    pub linked_role: String,
    pub account_name: String,
    pub payer_id: u64,
    pub project_id: u64,
    pub service_external_id: String,
    pub skip_access_checking: bool,
    pub start_datecode: String,
    pub use_org_account_info: bool,
}

/// Account in the cache, as returned by `GET /v3/account-cache/{id}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheAccount {
    pub id: u64,
    pub account_alias: Option<String>,
    pub account_number: String,
    pub account_type_id: u64,
    pub car_external_id: String,
    pub created_at: String,
    pub account_email: String,
    pub include_linked_account_spend: bool,
    pub linked_account_number: String,
    pub linked_role: String,
    pub account_name: String,
    pub payer_id: u64,
    pub service_external_id: String,
    pub skip_access_checking: bool,
}

/// A fetched account, tagged by the collection it came from
#[derive(Debug, Clone, PartialEq)]
pub enum AccountRecord {
    Project(ProjectAccount),
    Cache(CacheAccount),
}

impl AccountRecord {
    pub fn location(&self) -> Location {
        match self {
            AccountRecord::Project(_) => Location::Project,
            AccountRecord::Cache(_) => Location::Cache,
        }
    }

    pub fn account_number(&self) -> &str {
        match self {
            AccountRecord::Project(a) => &a.account_number,
            AccountRecord::Cache(a) => &a.account_number,
        }
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        match self {
            AccountRecord::Project(a) => ProjectId::from_raw(a.project_id),
            AccountRecord::Cache(_) => None,
        }
    }

    /// Flatten into the attribute map of the given account kind
    pub fn to_fields(&self, account_type: AccountType) -> BTreeMap<String, Value> {
        let number_field = account_type.account_number_field().to_string();
        let mut fields = BTreeMap::new();
        let aws = account_type == AccountType::Aws;

        match self {
            AccountRecord::Project(a) => {
                fields.insert("account_alias".into(), json!(a.account_alias));
                fields.insert(number_field, json!(a.account_number));
                fields.insert("account_type_id".into(), json!(a.account_type_id));
                fields.insert("created_at".into(), json!(a.created_at));
                fields.insert("name".into(), json!(a.account_name));
                fields.insert("payer_id".into(), json!(a.payer_id));
                fields.insert("project_id".into(), json!(a.project_id));
                fields.insert("skip_access_checking".into(), json!(a.skip_access_checking));
                fields.insert("start_datecode".into(), json!(a.start_datecode));
                if aws {
                    fields.insert("car_external_id".into(), json!(a.car_external_id));
                    fields.insert("email".into(), json!(a.account_email));
                    fields.insert(
                        "include_linked_account_spend".into(),
                        json!(a.include_linked_account_spend),
                    );
                    fields.insert("linked_account_number".into(), json!(a.linked_account_number));
                    fields.insert("linked_role".into(), json!(a.linked_role));
                    fields.insert("service_external_id".into(), json!(a.service_external_id));
                    fields.insert("use_org_account_info".into(), json!(a.use_org_account_info));
                }
            }
            AccountRecord::Cache(a) => {
                fields.insert("account_alias".into(), json!(a.account_alias));
                fields.insert(number_field, json!(a.account_number));
                fields.insert("account_type_id".into(), json!(a.account_type_id));
                fields.insert("created_at".into(), json!(a.created_at));
                fields.insert("name".into(), json!(a.account_name));
                fields.insert("payer_id".into(), json!(a.payer_id));
                fields.insert("project_id".into(), json!(0));
                fields.insert("skip_access_checking".into(), json!(a.skip_access_checking));
                if aws {
                    fields.insert("car_external_id".into(), json!(a.car_external_id));
                    fields.insert("email".into(), json!(a.account_email));
                    fields.insert(
                        "include_linked_account_spend".into(),
                        json!(a.include_linked_account_spend),
                    );
                    fields.insert("linked_account_number".into(), json!(a.linked_account_number));
                    fields.insert("linked_role".into(), json!(a.linked_role));
                    fields.insert("service_external_id".into(), json!(a.service_external_id));
                }
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_zero_is_none() {
        assert_eq!(ProjectId::from_raw(0), None);
        assert_eq!(ProjectId::from_raw(7), Some(ProjectId(7)));
    }

    #[test]
    fn test_zero_project_deserializes_to_none() {
        let spec: AccountSpec = serde_json::from_value(json!({
            "account_type": "aws",
            "name": "sandbox",
            "payer_id": 1,
            "project_id": 0,
            "start_datecode": null,
            "account_number": null
        }))
        .unwrap();
        assert_eq!(spec.project_id, None);
        assert_eq!(spec.project(), None);

        let state: AccountState = serde_json::from_value(json!({
            "id": 12,
            "account_type": "azure",
            "location": "cache",
            "project_id": 0,
            "start_datecode": null
        }))
        .unwrap();
        assert_eq!(state.project_id, None);
        assert!(state.check_invariant().is_ok());

        let spec: AccountSpec = serde_json::from_value(json!({
            "account_type": "aws",
            "name": "sandbox",
            "payer_id": 1,
            "project_id": 5,
            "start_datecode": "2024-03",
            "account_number": null
        }))
        .unwrap();
        assert_eq!(spec.project(), Some(ProjectId(5)));
    }

    #[test]
    fn test_labels_keep_one_value_per_key() {
        let spec = AccountSpec::new(AccountType::Aws, "sandbox", 1)
            .with_label("env", "dev")
            .with_label("env", "prod");
        assert_eq!(spec.labels.len(), 1);
        assert_eq!(spec.labels["env"], "prod");
    }

    #[test]
    fn test_account_number_field_per_type() {
        assert_eq!(AccountType::Aws.account_number_field(), "account_number");
        assert_eq!(
            AccountType::GoogleCloud.account_number_field(),
            "google_cloud_project_id"
        );
        assert_eq!(AccountType::Azure.account_number_field(), "subscription_uuid");
        assert_eq!(AccountType::GoogleCloud.query_value(), "google-cloud");
    }

    #[test]
    fn test_state_invariant() {
        let mut state = AccountState::cached(AccountId(1), AccountType::Aws);
        assert!(state.check_invariant().is_ok());

        state.relocate(AccountId(2), Some(ProjectId(5)));
        assert_eq!(state.location, Location::Project);
        assert!(state.check_invariant().is_ok());

        state.project_id = None;
        assert!(state.check_invariant().is_err());
    }

    #[test]
    fn test_relocate_to_cache_drops_labels() {
        let mut state = AccountState::in_project(AccountId(3), AccountType::Aws, ProjectId(9));
        state.labels.insert("env".into(), "prod".into());
        state.relocate(AccountId(4), None);
        assert_eq!(state.location, Location::Cache);
        assert!(state.labels.is_empty());
        assert_eq!(state.path(), "/v3/account-cache/4");
    }

    #[test]
    fn test_cache_record_fields() {
        let record = AccountRecord::Cache(CacheAccount {
            id: 8,
            account_number: "123456789012".to_string(),
            account_name: "sandbox".to_string(),
            linked_role: "OrganizationAccountAccessRole".to_string(),
            ..Default::default()
        });

        let aws = record.to_fields(AccountType::Aws);
        assert_eq!(aws["project_id"], json!(0));
        assert_eq!(aws["account_number"], json!("123456789012"));
        assert_eq!(aws["linked_role"], json!("OrganizationAccountAccessRole"));

        let gcp = record.to_fields(AccountType::GoogleCloud);
        assert_eq!(gcp["google_cloud_project_id"], json!("123456789012"));
        assert!(!gcp.contains_key("linked_role"));
    }

    #[test]
    fn test_updatable_body_per_location() {
        let mut attributes = Map::new();
        attributes.insert("account_name".into(), json!("renamed"));
        attributes.insert("start_datecode".into(), json!("2024-03"));
        attributes.insert("use_org_account_info".into(), json!(true));

        let project = updatable_body(Location::Project, &attributes);
        assert_eq!(project["start_datecode"], json!("2024-03"));

        let cache = updatable_body(Location::Cache, &attributes);
        assert_eq!(cache, json!({"account_name": "renamed"}));
    }

    #[test]
    fn test_import_body_for_project() {
        let spec = AccountSpec::new(AccountType::Aws, "imported", 2)
            .with_project(5)
            .with_start_datecode("2024-01")
            .with_account_number("111122223333")
            .with_attribute("linked_role", json!("Admin"));

        let body = spec.import_body(Location::Project);
        assert_eq!(body["account_number"], json!("111122223333"));
        assert_eq!(body["project_id"], json!(5));
        assert_eq!(body["start_datecode"], json!("2024-01"));
        assert_eq!(body["linked_role"], json!("Admin"));

        let cache = spec.import_body(Location::Cache);
        assert!(cache.get("project_id").is_none());
    }
}
