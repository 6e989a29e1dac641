//! Per-account connection lifecycle.
//!
//! One state machine per account id. Edges:
//! `Stopped → Starting → Connected`; `Starting|Degraded → Error` once the
//! retry budget is spent; `Error → Starting` on a fresh start; `Connected ⇄
//! Degraded` on transient provider signals; any state `→ Stopped` on
//! cancellation; `Connected|Stopped → LoggedOut` on explicit logout.
//! LoggedOut is terminal until the account is re-provisioned.

use crate::accounts;
use crate::config::LinqAccountConfig;
use crate::error::{BridgeError, Result};
use crate::provider::ProviderClient;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Stopped,
    Starting,
    Connected,
    Degraded,
    Error,
    LoggedOut,
}

/// Whether `from → to` is an edge of the lifecycle graph.
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::{Connected, Degraded, Error, LoggedOut, Starting, Stopped};
    match (from, to) {
        // Cancellation may land from anywhere except a terminal logout.
        (LoggedOut, _) => false,
        (_, Stopped) => true,
        (Stopped, Starting) => true,
        (Starting, Connected) => true,
        (Starting, Error) => true,
        (Error, Starting) => true,
        (Connected, Degraded) => true,
        (Degraded, Connected) => true,
        (Degraded, Error) => true,
        (Connected | Stopped, LoggedOut) => true,
        _ => false,
    }
}

/// Bounded exponential backoff for connect attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
            max_attempts: 6,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), capped at the ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.ceiling)
    }
}

struct AccountEntry {
    state: ConnectionState,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

type SharedStates = Arc<Mutex<HashMap<String, AccountEntry>>>;

pub struct ConnectionSupervisor {
    backoff: BackoffPolicy,
    states: SharedStates,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl ConnectionSupervisor {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current state for an account; `None` when never started.
    pub fn state(&self, account_id: &str) -> Option<ConnectionState> {
        self.states.lock().get(account_id).map(|e| e.state)
    }

    fn set_state(states: &SharedStates, account_id: &str, to: ConnectionState) {
        let mut map = states.lock();
        if let Some(entry) = map.get_mut(account_id) {
            if !is_valid_transition(entry.state, to) {
                tracing::error!(
                    "linq[{account_id}]: refusing invalid transition {:?} -> {to:?}",
                    entry.state
                );
                return;
            }
            tracing::debug!("linq[{account_id}]: {:?} -> {to:?}", entry.state);
            entry.state = to;
        }
    }

    /// Start an account's connection loop.
    ///
    /// Configuration problems fail fast without any connection attempt.
    /// Connectivity failures retry under the backoff policy; once the
    /// attempt budget is spent the account parks in `Error` and surfaces
    /// through the status path instead of retrying forever.
    pub fn start(
        &self,
        account_id: &str,
        account: &LinqAccountConfig,
        provider: Arc<dyn ProviderClient>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if !accounts::is_configured(account) {
            return Err(BridgeError::config(
                account_id,
                "api_token and from_phone are required",
            ));
        }

        {
            let mut map = self.states.lock();
            match map.get(account_id).map(|e| e.state) {
                Some(ConnectionState::LoggedOut) => {
                    return Err(BridgeError::config(
                        account_id,
                        "account is logged out; re-provision credentials first",
                    ));
                }
                Some(
                    ConnectionState::Starting
                    | ConnectionState::Connected
                    | ConnectionState::Degraded,
                ) => {
                    tracing::debug!("linq[{account_id}]: already running");
                    return Ok(());
                }
                _ => {}
            }
            // Exactly one entry per account id; restart replaces it whole.
            map.insert(
                account_id.to_string(),
                AccountEntry {
                    state: ConnectionState::Starting,
                    cancel: cancel.clone(),
                    task: None,
                },
            );
        }

        let states = Arc::clone(&self.states);
        let backoff = self.backoff.clone();
        let id = account_id.to_string();
        let task = tokio::spawn(async move {
            Self::run_account(&states, &id, provider.as_ref(), &cancel, &backoff).await;
        });
        if let Some(entry) = self.states.lock().get_mut(account_id) {
            entry.task = Some(task);
        }
        Ok(())
    }

    async fn run_account(
        states: &SharedStates,
        account_id: &str,
        provider: &dyn ProviderClient,
        cancel: &CancellationToken,
        backoff: &BackoffPolicy,
    ) {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                Self::set_state(states, account_id, ConnectionState::Stopped);
                return;
            }

            match provider.connect().await {
                Ok(()) => {
                    // Each successful (re)connect refunds the attempt budget.
                    attempt = 0;
                    Self::set_state(states, account_id, ConnectionState::Connected);

                    tokio::select! {
                        () = cancel.cancelled() => {
                            Self::set_state(states, account_id, ConnectionState::Stopped);
                            return;
                        }
                        res = provider.open_event_source(cancel) => match res {
                            Ok(()) => {
                                // Webhook subscription provisioned; hold the
                                // account open until cancellation.
                                cancel.cancelled().await;
                                Self::set_state(states, account_id, ConnectionState::Stopped);
                                return;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "linq[{account_id}]: event source dropped: {e}"
                                );
                                Self::set_state(states, account_id, ConnectionState::Degraded);
                            }
                        }
                    }
                }
                Err(e @ BridgeError::Config { .. }) => {
                    // Bad credentials never self-heal; don't burn retries.
                    tracing::error!("linq[{account_id}]: {e}");
                    Self::set_state(states, account_id, ConnectionState::Error);
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= backoff.max_attempts {
                        tracing::error!(
                            "linq[{account_id}]: giving up after {attempt} attempts: {e}"
                        );
                        Self::set_state(states, account_id, ConnectionState::Error);
                        return;
                    }
                    let delay = backoff.delay(attempt);
                    tracing::warn!(
                        "linq[{account_id}]: connect failed ({e}), retrying in {delay:?}"
                    );
                    // Cancellation is checked before every retry; the
                    // backoff timer itself is abortable.
                    tokio::select! {
                        () = cancel.cancelled() => {
                            Self::set_state(states, account_id, ConnectionState::Stopped);
                            return;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Cancel the account's connection and release its resources.
    pub fn stop(&self, account_id: &str) -> Result<()> {
        let mut map = self.states.lock();
        let entry = map
            .get_mut(account_id)
            .ok_or_else(|| BridgeError::NotFound(account_id.to_string()))?;
        entry.cancel.cancel();
        if is_valid_transition(entry.state, ConnectionState::Stopped) {
            entry.state = ConnectionState::Stopped;
        }
        Ok(())
    }

    /// Await the account's connection task (used by shutdown paths and tests).
    pub async fn join(&self, account_id: &str) {
        let task = self
            .states
            .lock()
            .get_mut(account_id)
            .and_then(|entry| entry.task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Revoke provider credentials, then park the account in `LoggedOut`.
    ///
    /// If revocation fails the state is left untouched and the error goes
    /// back to the caller.
    pub async fn logout(
        &self,
        account_id: &str,
        provider: Arc<dyn ProviderClient>,
    ) -> Result<()> {
        match self.state(account_id) {
            None | Some(ConnectionState::Stopped | ConnectionState::Connected) => {}
            Some(ConnectionState::LoggedOut) => return Ok(()),
            Some(other) => {
                return Err(BridgeError::Config {
                    account_id: account_id.to_string(),
                    reason: format!("cannot log out while {other:?}"),
                })
            }
        }

        provider.logout().await?;

        let mut map = self.states.lock();
        let entry = map
            .entry(account_id.to_string())
            .or_insert_with(|| AccountEntry {
                state: ConnectionState::Stopped,
                cancel: CancellationToken::new(),
                task: None,
            });
        entry.cancel.cancel();
        entry.state = ConnectionState::LoggedOut;
        tracing::info!("linq[{account_id}]: logged out");
        Ok(())
    }

    /// Transient provider signal (failed sends, failed probe) while running.
    pub fn mark_degraded(&self, account_id: &str) {
        Self::set_state(&self.states, account_id, ConnectionState::Degraded);
    }

    /// Recovery signal after a degraded period.
    pub fn mark_recovered(&self, account_id: &str) {
        Self::set_state(&self.states, account_id, ConnectionState::Connected);
    }

    /// Drop the terminal `LoggedOut` marker after re-provisioning.
    pub fn forget(&self, account_id: &str) {
        self.states.lock().remove(account_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SendReceipt;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedProvider {
        connect_failures: AtomicUsize,
        connect_calls: AtomicUsize,
        logout_ok: AtomicBool,
    }

    impl ScriptedProvider {
        fn failing_connects(n: usize) -> Self {
            Self {
                connect_failures: AtomicUsize::new(n),
                connect_calls: AtomicUsize::new(0),
                logout_ok: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        async fn connect(&self) -> Result<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(BridgeError::Connectivity("connection refused".into()));
            }
            Ok(())
        }
        async fn open_event_source(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn send_text(
            &self,
            _target: &str,
            _text: &str,
            _reply_to: Option<&str>,
        ) -> Result<SendReceipt> {
            unimplemented!("not used in supervisor tests")
        }
        async fn send_media(
            &self,
            _target: &str,
            _caption: &str,
            _media_url: &str,
        ) -> Result<SendReceipt> {
            unimplemented!("not used in supervisor tests")
        }
        async fn list_phone_numbers(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn logout(&self) -> Result<()> {
            if self.logout_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BridgeError::Connectivity("revocation failed".into()))
            }
        }
    }

    fn account() -> LinqAccountConfig {
        LinqAccountConfig {
            api_token: "tok".into(),
            from_phone: "+15551234567".into(),
            ..Default::default()
        }
    }

    #[test]
    fn transition_graph_matches_lifecycle() {
        use ConnectionState::*;
        assert!(is_valid_transition(Stopped, Starting));
        assert!(is_valid_transition(Starting, Connected));
        assert!(is_valid_transition(Starting, Error));
        assert!(is_valid_transition(Error, Starting));
        assert!(is_valid_transition(Connected, Degraded));
        assert!(is_valid_transition(Degraded, Connected));
        assert!(is_valid_transition(Degraded, Error));
        assert!(is_valid_transition(Degraded, Stopped));
        assert!(is_valid_transition(Connected, LoggedOut));
        assert!(is_valid_transition(Stopped, LoggedOut));

        assert!(!is_valid_transition(Stopped, Connected));
        assert!(!is_valid_transition(Starting, Degraded));
        assert!(!is_valid_transition(Degraded, LoggedOut));
        assert!(!is_valid_transition(LoggedOut, Starting));
        assert!(!is_valid_transition(LoggedOut, Stopped), "logout is terminal");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(60), "capped");
        assert_eq!(policy.delay(32), Duration::from_secs(60), "no overflow");
    }

    #[tokio::test]
    async fn unconfigured_account_never_connects() {
        let supervisor = ConnectionSupervisor::default();
        let provider = Arc::new(ScriptedProvider::failing_connects(0));
        let bad = LinqAccountConfig::default();

        let err = supervisor
            .start("default", &bad, provider.clone(), CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
        assert_eq!(provider.connect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.state("default"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_start_reaches_connected() {
        let supervisor = ConnectionSupervisor::default();
        let provider = Arc::new(ScriptedProvider::failing_connects(0));
        let cancel = CancellationToken::new();

        supervisor
            .start("default", &account(), provider, cancel.clone())
            .expect("starts");
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if supervisor.state("default") == Some(ConnectionState::Connected) {
                break;
            }
        }
        assert_eq!(supervisor.state("default"), Some(ConnectionState::Connected));

        cancel.cancel();
        supervisor.join("default").await;
        assert_eq!(supervisor.state("default"), Some(ConnectionState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_parks_in_error() {
        let supervisor = ConnectionSupervisor::new(BackoffPolicy {
            initial: Duration::from_millis(10),
            ceiling: Duration::from_millis(100),
            max_attempts: 3,
        });
        let provider = Arc::new(ScriptedProvider::failing_connects(usize::MAX));

        supervisor
            .start("default", &account(), provider.clone(), CancellationToken::new())
            .expect("starts");
        supervisor.join("default").await;

        assert_eq!(supervisor.state("default"), Some(ConnectionState::Error));
        assert_eq!(provider.connect_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_recover_within_budget() {
        let supervisor = ConnectionSupervisor::new(BackoffPolicy {
            initial: Duration::from_millis(10),
            ceiling: Duration::from_millis(100),
            max_attempts: 5,
        });
        let provider = Arc::new(ScriptedProvider::failing_connects(2));
        let cancel = CancellationToken::new();

        supervisor
            .start("default", &account(), provider.clone(), cancel.clone())
            .expect("starts");
        // Two failures, two backoff sleeps, then success.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if supervisor.state("default") == Some(ConnectionState::Connected) {
                break;
            }
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        assert_eq!(supervisor.state("default"), Some(ConnectionState::Connected));
        assert_eq!(provider.connect_calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        supervisor.join("default").await;
    }

    /// Connects once, then every event source and reconnect attempt fails.
    struct DroppingProvider {
        connect_calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderClient for DroppingProvider {
        async fn connect(&self) -> Result<()> {
            if self.connect_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                Err(BridgeError::Connectivity("connection refused".into()))
            }
        }
        async fn open_event_source(&self, _cancel: &CancellationToken) -> Result<()> {
            Err(BridgeError::Connectivity("stream reset".into()))
        }
        async fn send_text(
            &self,
            _target: &str,
            _text: &str,
            _reply_to: Option<&str>,
        ) -> Result<SendReceipt> {
            unimplemented!("not used in supervisor tests")
        }
        async fn send_media(
            &self,
            _target: &str,
            _caption: &str,
            _media_url: &str,
        ) -> Result<SendReceipt> {
            unimplemented!("not used in supervisor tests")
        }
        async fn list_phone_numbers(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn logout(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_reconnects_are_bounded() {
        let supervisor = ConnectionSupervisor::new(BackoffPolicy {
            initial: Duration::from_millis(10),
            ceiling: Duration::from_millis(100),
            max_attempts: 3,
        });
        let provider = Arc::new(DroppingProvider {
            connect_calls: AtomicUsize::new(0),
        });

        supervisor
            .start("default", &account(), provider.clone(), CancellationToken::new())
            .expect("starts");
        supervisor.join("default").await;

        // One successful connect, then the reconnect budget: the account
        // parks in Error instead of retrying forever.
        assert_eq!(supervisor.state("default"), Some(ConnectionState::Error));
        assert_eq!(provider.connect_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_backoff_promptly() {
        let supervisor = ConnectionSupervisor::new(BackoffPolicy {
            initial: Duration::from_secs(3600),
            ceiling: Duration::from_secs(3600),
            max_attempts: 10,
        });
        let provider = Arc::new(ScriptedProvider::failing_connects(usize::MAX));
        let cancel = CancellationToken::new();

        supervisor
            .start("default", &account(), provider, cancel.clone())
            .expect("starts");
        tokio::task::yield_now().await;

        cancel.cancel();
        supervisor.join("default").await;
        assert_eq!(supervisor.state("default"), Some(ConnectionState::Stopped));
    }

    #[tokio::test]
    async fn failed_logout_leaves_state_unchanged() {
        let supervisor = ConnectionSupervisor::default();
        let provider = Arc::new(ScriptedProvider::failing_connects(0));
        provider.logout_ok.store(false, Ordering::SeqCst);

        let err = supervisor
            .logout("default", provider.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connectivity(_)));
        assert_ne!(supervisor.state("default"), Some(ConnectionState::LoggedOut));

        provider.logout_ok.store(true, Ordering::SeqCst);
        supervisor.logout("default", provider).await.expect("logs out");
        assert_eq!(supervisor.state("default"), Some(ConnectionState::LoggedOut));
    }

    #[tokio::test]
    async fn logged_out_account_refuses_start_until_forgotten() {
        let supervisor = ConnectionSupervisor::default();
        let provider = Arc::new(ScriptedProvider::failing_connects(0));

        supervisor
            .logout("default", provider.clone())
            .await
            .expect("logs out");
        let err = supervisor
            .start("default", &account(), provider.clone(), CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));

        supervisor.forget("default");
        supervisor
            .start("default", &account(), provider, CancellationToken::new())
            .expect("starts after re-provisioning");
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_recovers_to_connected() {
        let supervisor = ConnectionSupervisor::default();
        let provider = Arc::new(ScriptedProvider::failing_connects(0));
        let cancel = CancellationToken::new();

        supervisor
            .start("default", &account(), provider, cancel.clone())
            .expect("starts");
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if supervisor.state("default") == Some(ConnectionState::Connected) {
                break;
            }
        }

        supervisor.mark_degraded("default");
        assert_eq!(supervisor.state("default"), Some(ConnectionState::Degraded));
        supervisor.mark_recovered("default");
        assert_eq!(supervisor.state("default"), Some(ConnectionState::Connected));

        cancel.cancel();
        supervisor.join("default").await;
    }
}
