//! Typed configuration records consumed by the bridge.
//!
//! The host owns config persistence; the bridge only reads these records and
//! returns updated values from the pure enable/delete transforms in
//! [`crate::accounts`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    750
}

fn default_chunk_limit() -> usize {
    1500
}

/// How outbound sends for a target are grouped before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every send call is dispatched immediately as its own unit.
    #[default]
    Direct,
    /// Sends accumulate until the host flushes the logical turn.
    Buffered,
    /// Consecutive sends within the debounce window merge into one unit.
    Coalesced,
}

/// Formatting mode the chunker must respect when splitting long text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    #[default]
    Plain,
    Markdown,
}

/// Access policy applied to direct messages from unknown senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Unknown senders get a pairing code and wait for operator approval.
    #[default]
    Pairing,
    /// Only allow-listed senders are routed; everyone else is dropped.
    Allowlist,
    /// Anyone may message the account.
    Open,
}

/// One Linq partner account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LinqAccountConfig {
    /// Linq Partner API token (Bearer auth)
    pub api_token: String,
    /// Phone number to send from (E.164 format)
    pub from_phone: String,
    /// Webhook signing secret for signature verification
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Callback URL registered with Linq for inbound webhook events
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Allowed sender handles (phone numbers) or "*" for all
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    /// Disabled accounts are listed but never started
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional display name for status output
    #[serde(default)]
    pub name: Option<String>,
}

/// Top-level channel section: per-account records plus shared delivery knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LinqChannelConfig {
    /// Account records keyed by account id.
    #[serde(default)]
    pub accounts: BTreeMap<String, LinqAccountConfig>,
    /// Policy for direct messages from senders not on the allow-list.
    #[serde(default)]
    pub dm_policy: DmPolicy,
    /// Grouping policy for outbound sends.
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    /// Debounce window for coalesced mode, in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub coalesce_debounce_ms: u64,
    /// Maximum characters per outbound message before chunking.
    #[serde(default = "default_chunk_limit")]
    pub text_chunk_limit: usize,
    /// Formatting mode the chunker preserves across split points.
    #[serde(default)]
    pub chunk_mode: ChunkMode,
}

impl Default for LinqChannelConfig {
    fn default() -> Self {
        Self {
            accounts: BTreeMap::new(),
            dm_policy: DmPolicy::default(),
            delivery_mode: DeliveryMode::default(),
            coalesce_debounce_ms: default_debounce_ms(),
            text_chunk_limit: default_chunk_limit(),
            chunk_mode: ChunkMode::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = LinqChannelConfig::default();
        assert!(cfg.accounts.is_empty());
        assert_eq!(cfg.dm_policy, DmPolicy::Pairing);
        assert_eq!(cfg.delivery_mode, DeliveryMode::Direct);
        assert_eq!(cfg.coalesce_debounce_ms, 750);
        assert_eq!(cfg.text_chunk_limit, 1500);
    }

    #[test]
    fn account_deserializes_from_toml() {
        let cfg: LinqChannelConfig = toml::from_str(
            r#"
            delivery_mode = "coalesced"
            chunk_mode = "markdown"

            [accounts.default]
            api_token = "tok"
            from_phone = "+15551234567"
            allowed_senders = ["+1234567890"]
            "#,
        )
        .expect("valid config");

        assert_eq!(cfg.delivery_mode, DeliveryMode::Coalesced);
        assert_eq!(cfg.chunk_mode, ChunkMode::Markdown);
        let account = cfg.accounts.get("default").expect("default account");
        assert_eq!(account.from_phone, "+15551234567");
        assert!(account.enabled, "enabled defaults to true");
        assert!(account.signing_secret.is_none());
    }

    #[test]
    fn schema_export_includes_accounts() {
        let schema = schemars::schema_for!(LinqChannelConfig);
        let json = serde_json::to_string(&schema).expect("schema serializes");
        assert!(json.contains("accounts"));
        assert!(json.contains("dm_policy"));
    }
}
