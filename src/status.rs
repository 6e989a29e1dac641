//! Account health: bounded probes, rate-limited audits, host-facing
//! snapshots.

use crate::accounts;
use crate::config::LinqAccountConfig;
use crate::provider::ProviderClient;
use crate::supervisor::ConnectionState;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Host-facing resolution of an account's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedState {
    Unconfigured,
    Connecting,
    Connected,
    Degraded,
    Error,
    LoggedOut,
}

/// Outcome of one bounded connectivity/credential check.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub ok: bool,
    pub latency_ms: Option<u64>,
    pub timed_out: bool,
    pub error: Option<String>,
}

/// Deeper standing check: is the sending number actually provisioned for
/// this token?
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub probe: ProbeReport,
    pub from_phone_provisioned: bool,
    pub issues: Vec<String>,
}

/// Snapshot merged from config, connection state, and the latest probe.
/// Recomputed on demand, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub account_id: String,
    pub state: ResolvedState,
    pub summary: Option<accounts::AccountSummary>,
    pub probe: Option<ProbeReport>,
    pub issues: Vec<String>,
}

/// Connectivity check bounded by `timeout`. Returns a timeout failure
/// instead of blocking past the deadline.
pub async fn probe_account(provider: &dyn ProviderClient, timeout: Duration) -> ProbeReport {
    let started = Instant::now();
    match tokio::time::timeout(timeout, provider.connect()).await {
        Ok(Ok(())) => ProbeReport {
            ok: true,
            latency_ms: Some(started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64),
            timed_out: false,
            error: None,
        },
        Ok(Err(e)) => ProbeReport {
            ok: false,
            latency_ms: None,
            timed_out: false,
            error: Some(e.to_string()),
        },
        Err(_) => ProbeReport {
            ok: false,
            latency_ms: None,
            timed_out: true,
            error: Some(format!("probe timed out after {} ms", timeout.as_millis())),
        },
    }
}

pub struct StatusProber {
    probe_timeout: Duration,
    /// Audits hit the provider's listing endpoint; keep a floor between them.
    audit_interval: Duration,
    last_audit: Mutex<HashMap<String, (Instant, AuditReport)>>,
}

impl Default for StatusProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(300))
    }
}

impl StatusProber {
    pub fn new(probe_timeout: Duration, audit_interval: Duration) -> Self {
        Self {
            probe_timeout,
            audit_interval,
            last_audit: Mutex::new(HashMap::new()),
        }
    }

    pub async fn probe(&self, provider: &dyn ProviderClient) -> ProbeReport {
        probe_account(provider, self.probe_timeout).await
    }

    /// Quota/standing audit, rate-limited per account: inside the interval
    /// the account's cached report is returned instead of hitting the
    /// provider again.
    pub async fn audit(
        &self,
        provider: &dyn ProviderClient,
        account_id: &str,
        account: &LinqAccountConfig,
    ) -> AuditReport {
        if let Some((at, cached)) = self.last_audit.lock().get(account_id) {
            if at.elapsed() < self.audit_interval {
                tracing::debug!("linq[{account_id}]: audit rate-limited, serving cached report");
                return cached.clone();
            }
        }

        let probe = self.probe(provider).await;
        let mut issues = Vec::new();
        let from_phone_provisioned = if probe.ok {
            match provider.list_phone_numbers().await {
                Ok(numbers) => {
                    let listed = numbers.iter().any(|n| n == &account.from_phone);
                    if !listed {
                        issues.push(format!(
                            "from_phone {} is not provisioned for this token",
                            account.from_phone
                        ));
                    }
                    listed
                }
                Err(e) => {
                    issues.push(format!("phone number listing failed: {e}"));
                    false
                }
            }
        } else {
            issues.push(
                probe
                    .error
                    .clone()
                    .unwrap_or_else(|| "probe failed".to_string()),
            );
            false
        };

        let report = AuditReport {
            probe,
            from_phone_provisioned,
            issues,
        };
        self.last_audit
            .lock()
            .insert(account_id.to_string(), (Instant::now(), report.clone()));
        report
    }
}

/// Merge config, connection state, and the latest probe into one snapshot.
pub fn build_account_snapshot(
    account_id: &str,
    account: Option<&LinqAccountConfig>,
    connection: Option<ConnectionState>,
    probe: Option<&ProbeReport>,
) -> StatusSnapshot {
    let mut issues = Vec::new();

    let summary = account.map(accounts::describe_account);

    let state = match account {
        None => {
            issues.push("account is not present in the configuration".to_string());
            ResolvedState::Unconfigured
        }
        Some(record) if !accounts::is_configured(record) => {
            if record.api_token.trim().is_empty() {
                issues.push("api_token is missing".to_string());
            }
            if record.from_phone.trim().is_empty() {
                issues.push("from_phone is missing".to_string());
            }
            ResolvedState::Unconfigured
        }
        Some(record) => {
            if !record.enabled {
                issues.push("account is disabled".to_string());
            }
            match connection {
                Some(ConnectionState::Connected) => match probe {
                    Some(p) if !p.ok => {
                        issues.push(
                            p.error
                                .clone()
                                .unwrap_or_else(|| "probe failed".to_string()),
                        );
                        ResolvedState::Degraded
                    }
                    _ => ResolvedState::Connected,
                },
                Some(ConnectionState::Starting) => ResolvedState::Connecting,
                Some(ConnectionState::Degraded) => {
                    issues.push("provider connection is degraded".to_string());
                    ResolvedState::Degraded
                }
                Some(ConnectionState::Error) => {
                    issues.push("connection gave up after repeated failures".to_string());
                    ResolvedState::Error
                }
                Some(ConnectionState::LoggedOut) => {
                    issues.push("account is logged out; re-provision to reconnect".to_string());
                    ResolvedState::LoggedOut
                }
                Some(ConnectionState::Stopped) | None => {
                    issues.push("account has not been started".to_string());
                    ResolvedState::Connecting
                }
            }
        }
    };

    StatusSnapshot {
        account_id: account_id.to_string(),
        state,
        summary,
        probe: probe.cloned(),
        issues,
    }
}
