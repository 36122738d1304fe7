//! Serialized account creation
//!
//! The service rejects concurrent create requests from the same caller, so
//! every create POST goes through one [`CreationLock`].

use crate::error::{AccountError, Result};
use crate::model::{AccountId, AccountType};
use kion_client::Remote;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Mutual exclusion for account create requests
///
/// Clones share the same lock. The lock only covers the create call itself;
/// waiting for the new account to become ready happens outside of it.
#[derive(Debug, Clone)]
pub struct CreationLock {
    inner: Option<Arc<Mutex<()>>>,
}

impl CreationLock {
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(()))),
        }
    }

    /// A lock that never blocks, for single-caller tests
    pub fn unlocked() -> Self {
        Self { inner: None }
    }

    /// Run `f` while holding the lock
    pub async fn run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        match &self.inner {
            Some(mutex) => {
                let _guard = mutex.lock().await;
                f().await
            }
            None => f().await,
        }
    }
}

impl Default for CreationLock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn create_path(account_type: AccountType) -> String {
    format!(
        "/v3/account-cache/create?account-type={}",
        account_type.query_value()
    )
}

/// Request a new provider account, landing in the cache
pub async fn create_cache_account<R: Remote + ?Sized>(
    remote: &R,
    lock: &CreationLock,
    account_type: AccountType,
    payload: &Value,
) -> Result<AccountId> {
    if !account_type.supports_creation() {
        return Err(AccountError::InvalidTransition(format!(
            "{account_type} accounts can only be imported"
        )));
    }

    let path = create_path(account_type);
    let created = lock
        .run(|| {
            tracing::debug!("Creating {} account via POST {}", account_type, path);
            remote.post(&path, Some(payload))
        })
        .await
        .map_err(|e| AccountError::remote("create account", account_type, e))?;

    if created.record_id == 0 {
        return Err(AccountError::InvalidRecord(format!(
            "create {account_type} account returned record id 0"
        )));
    }

    tracing::info!("Created {} account cache id {}", account_type, created.record_id);
    Ok(AccountId(created.record_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kion_client::{FakeMethod, FakeRemote, FakeResponse};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_returns_record_id() {
        let fake = FakeRemote::new();
        fake.on(
            FakeMethod::Post,
            "/v3/account-cache/create?account-type=aws",
            FakeResponse::Created(77),
        );

        let id = create_cache_account(
            &fake,
            &CreationLock::unlocked(),
            AccountType::Aws,
            &json!({"account_name": "sandbox"}),
        )
        .await
        .unwrap();

        assert_eq!(id, AccountId(77));
        let calls = fake.calls();
        assert_eq!(calls[0].body, Some(json!({"account_name": "sandbox"})));
    }

    #[tokio::test]
    async fn test_zero_record_id_is_error() {
        let fake = FakeRemote::new();
        fake.on(
            FakeMethod::Post,
            "/v3/account-cache/create?account-type=azure",
            FakeResponse::Created(0),
        );

        let err = create_cache_account(&fake, &CreationLock::new(), AccountType::Azure, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_custom_accounts_are_not_created() {
        let fake = FakeRemote::new();
        let err = create_cache_account(&fake, &CreationLock::new(), AccountType::Custom, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::InvalidTransition(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_serializes_callers() {
        let lock = CreationLock::new();
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                lock.run(|| async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
