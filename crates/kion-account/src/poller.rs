//! Readiness polling with exponential backoff
//!
//! A refresh callback reports the current state label of a remote entity.
//! The poller keeps calling it until a target label is observed, the
//! deadline passes or the caller cancels.

use crate::error::{AccountError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// State label recorded when a refresh answers 404
pub const NOT_FOUND_STATE: &str = "NotFound";

/// Pending label while a new account has no provider account number yet
pub const MISSING_ACCOUNT_NUMBER: &str = "MissingAccountNumber";
/// Target label once the provider account number is populated
pub const ACCOUNT_CREATED: &str = "AccountCreated";
/// Target label once the cached account record is readable
pub const ACCOUNT_EXISTS: &str = "AccountExists";

/// Polling parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Labels that mean "keep waiting"
    pub pending: Vec<String>,
    /// Labels that end the wait successfully
    pub target: Vec<String>,
    /// Overall deadline, measured from the start of the wait
    pub timeout: Duration,
    /// Pause before the first refresh
    pub delay: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Upper bound of the random delay added to each interval
    pub jitter: Duration,
    /// Consecutive target observations required
    pub continuous_target_occurrence: u32,
    /// Consecutive 404 answers tolerated; `None` tolerates them until timeout
    pub not_found_checks: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            target: Vec::new(),
            timeout: Duration::from_secs(20 * 60),
            delay: Duration::ZERO,
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            jitter: Duration::from_millis(500),
            continuous_target_occurrence: 1,
            not_found_checks: None,
        }
    }
}

impl PollConfig {
    pub fn new(target: &[&str], timeout: Duration) -> Self {
        Self {
            target: target.iter().map(|s| s.to_string()).collect(),
            timeout,
            ..Default::default()
        }
    }

    pub fn with_pending(mut self, pending: &[&str]) -> Self {
        self.pending = pending.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_intervals(mut self, min: Duration, max: Duration) -> Self {
        self.min_interval = min;
        self.max_interval = max.max(min);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences.max(1);
        self
    }

    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = Some(checks);
        self
    }

    /// Wait for the provider account number of a new AWS or Azure account
    pub fn account_number(timeout: Duration) -> Self {
        Self::new(&[ACCOUNT_CREATED], timeout).with_pending(&[MISSING_ACCOUNT_NUMBER])
    }

    /// Wait for a new Google Cloud project to settle in the cache
    pub fn account_exists(timeout: Duration) -> Self {
        Self::new(&[ACCOUNT_EXISTS], timeout).with_continuous_target_occurrence(10)
    }

    fn is_target(&self, state: &str) -> bool {
        self.target.iter().any(|t| t == state)
    }

    fn is_pending(&self, state: &str) -> bool {
        self.pending.iter().any(|p| p == state)
    }
}

/// Waits for a remote entity to reach a target state
#[derive(Debug, Clone)]
pub struct Poller {
    config: PollConfig,
}

impl Poller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Refresh until a target label is observed
    ///
    /// `refresh` yields the current payload and its state label. A 404 from
    /// `refresh` counts as the [`NOT_FOUND_STATE`] pending state; any other
    /// error aborts the wait.
    pub async fn wait_until_ready<T, F, Fut>(
        &self,
        id: &str,
        cancel: &CancellationToken,
        mut refresh: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = kion_client::Result<(T, String)>>,
    {
        let config = &self.config;
        // A timeout past the clock's range means no deadline.
        let deadline = Instant::now().checked_add(config.timeout);
        let required = config.continuous_target_occurrence.max(1);
        let mut last_state = String::from("(none)");
        let mut interval = config.min_interval;
        let mut target_seen = 0u32;
        let mut not_found_seen = 0u32;

        if !config.delay.is_zero() {
            self.pause(id, config.delay, deadline, cancel, &last_state)
                .await?;
        }

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(AccountError::Cancelled(format!("waiting for {id}")));
                }
                _ = sleep_until_some(deadline) => {
                    return Err(self.timeout(id, &last_state));
                }
                outcome = refresh() => outcome,
            };

            match outcome {
                Ok((value, state)) => {
                    not_found_seen = 0;
                    if config.is_target(&state) {
                        target_seen += 1;
                        tracing::trace!(
                            "{} reached {} ({}/{})",
                            id,
                            state,
                            target_seen,
                            required
                        );
                        if target_seen >= required {
                            tracing::debug!("{} is ready ({})", id, state);
                            return Ok(value);
                        }
                    } else if config.is_pending(&state) {
                        target_seen = 0;
                        tracing::trace!("{} still {}", id, state);
                    } else {
                        return Err(AccountError::UnexpectedState {
                            id: id.to_string(),
                            state,
                            target: config.target.clone(),
                        });
                    }
                    last_state = state;
                }
                Err(e) if e.is_not_found() => {
                    target_seen = 0;
                    not_found_seen += 1;
                    tracing::trace!("{} not found ({} in a row)", id, not_found_seen);
                    if config.not_found_checks.is_some_and(|limit| not_found_seen > limit) {
                        return Err(AccountError::NotFound(format!(
                            "{id} after {not_found_seen} checks"
                        )));
                    }
                    last_state = NOT_FOUND_STATE.to_string();
                }
                Err(e) => return Err(AccountError::remote("refresh state", id, e)),
            }

            let wait = interval.saturating_add(self.jitter());
            self.pause(id, wait, deadline, cancel, &last_state).await?;
            interval = interval.saturating_mul(2).min(config.max_interval);
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    async fn pause(
        &self,
        id: &str,
        wait: Duration,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
        last_state: &str,
    ) -> Result<()> {
        let wake = match (Instant::now().checked_add(wait), deadline) {
            (Some(wake), Some(deadline)) => Some(wake.min(deadline)),
            (wake, deadline) => wake.or(deadline),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(AccountError::Cancelled(format!("waiting for {id}")))
            }
            _ = sleep_until_some(wake) => {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    Err(self.timeout(id, last_state))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn timeout(&self, id: &str, last_state: &str) -> AccountError {
        AccountError::Timeout {
            id: id.to_string(),
            last_state: last_state.to_string(),
            timeout: self.config.timeout,
        }
    }
}

async fn sleep_until_some(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use kion_client::ClientError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn not_found() -> ClientError {
        ClientError::NotFound {
            method: "GET".to_string(),
            url: "/v3/account-cache/7".to_string(),
            body: String::new(),
        }
    }

    fn quick(config: PollConfig) -> Poller {
        Poller::new(
            config
                .with_intervals(Duration::from_millis(100), Duration::from_secs(1))
                .with_jitter(Duration::ZERO),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_target() {
        let poller = quick(PollConfig::account_number(Duration::from_secs(60)));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let number = poller
            .wait_until_ready("account-cache/7", &CancellationToken::new(), || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Ok((String::new(), MISSING_ACCOUNT_NUMBER.to_string()))
                    } else {
                        Ok(("123456789012".to_string(), ACCOUNT_CREATED.to_string()))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(number, "123456789012");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_has_no_deadline() {
        let poller = Poller::new(
            PollConfig::account_number(Duration::MAX)
                .with_intervals(Duration::from_millis(100), Duration::MAX)
                .with_jitter(Duration::ZERO),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let number = poller
            .wait_until_ready("account-cache/7", &CancellationToken::new(), || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Ok((String::new(), MISSING_ACCOUNT_NUMBER.to_string()))
                    } else {
                        Ok(("123456789012".to_string(), ACCOUNT_CREATED.to_string()))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(number, "123456789012");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_state() {
        let poller = quick(PollConfig::account_number(Duration::from_secs(5)));
        let started = Instant::now();

        let err = poller
            .wait_until_ready("account-cache/7", &CancellationToken::new(), || async {
                Ok(((), MISSING_ACCOUNT_NUMBER.to_string()))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        match err {
            AccountError::Timeout { last_state, .. } => {
                assert_eq!(last_state, MISSING_ACCOUNT_NUMBER)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_refresh_times_out() {
        let poller = quick(PollConfig::account_number(Duration::from_secs(3)));

        let err = poller
            .wait_until_ready("account-cache/7", &CancellationToken::new(), || async {
                std::future::pending::<kion_client::Result<((), String)>>().await
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let poller = quick(PollConfig::account_number(Duration::from_secs(600)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let err = poller
            .wait_until_ready("account-cache/7", &cancel, || async {
                Ok(((), MISSING_ACCOUNT_NUMBER.to_string()))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_pending() {
        let poller = quick(PollConfig::account_number(Duration::from_secs(60)));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        poller
            .wait_until_ready("account-cache/7", &CancellationToken::new(), || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(not_found())
                    } else {
                        Ok(((), ACCOUNT_CREATED.to_string()))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_checks_cap() {
        let poller = quick(
            PollConfig::account_number(Duration::from_secs(60)).with_not_found_checks(2),
        );

        let err = poller
            .wait_until_ready("account-cache/7", &CancellationToken::new(), || async {
                Err::<((), String), _>(not_found())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_state() {
        let poller = quick(PollConfig::account_number(Duration::from_secs(60)));

        let err = poller
            .wait_until_ready("account-cache/7", &CancellationToken::new(), || async {
                Ok(((), "Deleted".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AccountError::UnexpectedState { ref state, .. } if state == "Deleted"));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_target_occurrence_resets() {
        let poller = quick(PollConfig::account_exists(Duration::from_secs(600)));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        poller
            .wait_until_ready("account-cache/7", &CancellationToken::new(), || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    // One 404 after three confirmations restarts the count.
                    if n == 3 {
                        Err(not_found())
                    } else {
                        Ok(((), ACCOUNT_EXISTS.to_string()))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 14);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_abort() {
        let poller = quick(PollConfig::account_number(Duration::from_secs(60)));

        let err = poller
            .wait_until_ready("account-cache/7", &CancellationToken::new(), || async {
                Err::<((), String), _>(ClientError::Decode {
                    body: "<html>".to_string(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AccountError::Remote { .. }));
    }

    #[test]
    fn test_presets() {
        let aws = PollConfig::account_number(Duration::from_secs(1200));
        assert_eq!(aws.pending, vec![MISSING_ACCOUNT_NUMBER.to_string()]);
        assert_eq!(aws.target, vec![ACCOUNT_CREATED.to_string()]);
        assert_eq!(aws.continuous_target_occurrence, 1);

        let gcp = PollConfig::account_exists(Duration::from_secs(1200));
        assert!(gcp.pending.is_empty());
        assert_eq!(gcp.continuous_target_occurrence, 10);
    }
}
