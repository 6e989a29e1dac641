//! Account registry: resolve, enable/disable, and describe per-tenant
//! account records.
//!
//! Everything here is synchronous and side-effect free. The enable/delete
//! operations are pure transforms that return an updated configuration value
//! for the caller to persist (single-writer discipline lives at the host's
//! config store, not here).

use crate::config::{LinqAccountConfig, LinqChannelConfig};
use crate::error::{BridgeError, Result};
use serde::Serialize;

/// Fallback account id when the config names none.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Canonical form of an account id: trimmed, lowercase, never empty.
pub fn normalize_account_id(raw: &str) -> String {
    let id = raw.trim().to_ascii_lowercase();
    if id.is_empty() {
        DEFAULT_ACCOUNT_ID.to_string()
    } else {
        id
    }
}

/// All account ids present in the configuration, in stable order.
pub fn list_account_ids(cfg: &LinqChannelConfig) -> Vec<String> {
    cfg.accounts.keys().cloned().collect()
}

/// Resolve an account record by id.
pub fn resolve_account<'a>(
    cfg: &'a LinqChannelConfig,
    account_id: &str,
) -> Result<&'a LinqAccountConfig> {
    let id = normalize_account_id(account_id);
    cfg.accounts
        .get(&id)
        .ok_or(BridgeError::NotFound(id))
}

/// The first enabled account, falling back to [`DEFAULT_ACCOUNT_ID`].
pub fn default_account_id(cfg: &LinqChannelConfig) -> String {
    cfg.accounts
        .iter()
        .find(|(_, account)| account.enabled)
        .map(|(id, _)| id.clone())
        .unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string())
}

/// Return a new configuration with the account's enabled flag set.
pub fn set_account_enabled(
    cfg: &LinqChannelConfig,
    account_id: &str,
    enabled: bool,
) -> Result<LinqChannelConfig> {
    let id = normalize_account_id(account_id);
    let mut next = cfg.clone();
    match next.accounts.get_mut(&id) {
        Some(account) => {
            account.enabled = enabled;
            Ok(next)
        }
        None => Err(BridgeError::NotFound(id)),
    }
}

/// Return a new configuration with the account removed.
pub fn delete_account(cfg: &LinqChannelConfig, account_id: &str) -> Result<LinqChannelConfig> {
    let id = normalize_account_id(account_id);
    let mut next = cfg.clone();
    if next.accounts.remove(&id).is_none() {
        return Err(BridgeError::NotFound(id));
    }
    Ok(next)
}

/// True iff the required credentials are present and non-empty.
pub fn is_configured(account: &LinqAccountConfig) -> bool {
    !account.api_token.trim().is_empty() && !account.from_phone.trim().is_empty()
}

/// Display-safe account summary: credentials become presence flags.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub name: Option<String>,
    pub from_phone: String,
    pub enabled: bool,
    pub has_api_token: bool,
    pub has_signing_secret: bool,
    pub allowed_sender_count: usize,
}

/// Redacted summary for host display. Never exposes token material.
pub fn describe_account(account: &LinqAccountConfig) -> AccountSummary {
    AccountSummary {
        name: account.name.clone(),
        from_phone: account.from_phone.clone(),
        enabled: account.enabled,
        has_api_token: !account.api_token.trim().is_empty(),
        has_signing_secret: account
            .signing_secret
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty()),
        allowed_sender_count: account.allowed_senders.len(),
    }
}
