//! Account reconciliation error types

use crate::model::AccountState;
use kion_client::ClientError;
use std::time::Duration;
use thiserror::Error;

/// Account reconciliation errors
#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Account not found: {0}")]
    NotFound(String),

    #[error("Governance operation already in progress for {id}: {source}")]
    TransientConflict {
        id: String,
        #[source]
        source: ClientError,
    },

    #[error("Timeout after {timeout:?} waiting for {id} (last state: {last_state})")]
    Timeout {
        id: String,
        last_state: String,
        timeout: Duration,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Unable to {operation} (item: {id}): {source}")]
    Remote {
        operation: &'static str,
        id: String,
        #[source]
        source: ClientError,
    },

    #[error("Unable to {operation} (item: {id}) after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        id: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    #[error("Unable to update associations [{relations}]: {source}")]
    Association {
        relations: String,
        #[source]
        source: ClientError,
    },

    #[error("Unexpected state '{state}' for {id}, wanted one of {target:?}")]
    UnexpectedState {
        id: String,
        state: String,
        target: Vec<String>,
    },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid import id: {0}")]
    InvalidImportId(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A create that failed after the account already existed remotely
    #[error("{source} (account {} left in {})", .state.id, .state.location)]
    Partial {
        state: Box<AccountState>,
        #[source]
        source: Box<AccountError>,
    },
}

/// Coarse error taxonomy used by callers to decide what to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The entity is absent
    NotFound,
    /// A concurrent governance operation is running; retry later
    TransientConflict,
    /// A wait ran past its deadline
    Timeout,
    /// The caller aborted a wait
    Cancelled,
    /// Anything else; never retried by this crate
    Fatal,
}

impl AccountError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccountError::NotFound(_) => ErrorKind::NotFound,
            AccountError::TransientConflict { .. } => ErrorKind::TransientConflict,
            AccountError::Timeout { .. } => ErrorKind::Timeout,
            AccountError::Cancelled(_) => ErrorKind::Cancelled,
            AccountError::Remote { source, .. } if source.is_not_found() => ErrorKind::NotFound,
            AccountError::Partial { source, .. } => source.kind(),
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// The account left behind by a failed create, if one exists
    pub fn partial_state(&self) -> Option<&AccountState> {
        match self {
            AccountError::Partial { state, .. } => Some(&**state),
            _ => None,
        }
    }

    pub(crate) fn partial(state: AccountState, source: AccountError) -> Self {
        AccountError::Partial {
            state: Box::new(state),
            source: Box::new(source),
        }
    }

    pub(crate) fn remote(operation: &'static str, id: impl ToString, source: ClientError) -> Self {
        AccountError::Remote {
            operation,
            id: id.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, AccountError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found() -> ClientError {
        ClientError::NotFound {
            method: "GET".to_string(),
            url: "/v3/account/1".to_string(),
            body: String::new(),
        }
    }

    #[test]
    fn test_remote_not_found_is_classified() {
        let err = AccountError::remote("read account", 1, not_found());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_retries_exhausted_is_fatal() {
        let err = AccountError::RetriesExhausted {
            operation: "convert cached account to project account",
            id: "100".to_string(),
            attempts: 3,
            source: ClientError::Decode {
                body: String::new(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_partial_keeps_state_and_kind() {
        use crate::model::{AccountId, AccountType};

        let timeout = AccountError::Timeout {
            id: "account-cache/7".to_string(),
            last_state: "MissingAccountNumber".to_string(),
            timeout: Duration::from_secs(60),
        };
        let err = AccountError::partial(AccountState::cached(AccountId(7), AccountType::Aws), timeout);

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.partial_state().map(|s| s.id), Some(AccountId(7)));
        assert!(err.to_string().contains("account 7 left in"));
        assert!(AccountError::NotFound("x".into()).partial_state().is_none());
    }

    #[test]
    fn test_timeout_message_names_last_state() {
        let err = AccountError::Timeout {
            id: "account-cache/7".to_string(),
            last_state: "MissingAccountNumber".to_string(),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("MissingAccountNumber"));
    }
}
