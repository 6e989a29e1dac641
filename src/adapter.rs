//! Channel facade: the host-facing entry points.
//!
//! Wires the registry, supervisor, routers, dispatchers, pairing, and the
//! prober together per account. The host owns the HTTP route for webhooks
//! and calls [`LinqAdapter::ingest_webhook`] with the raw body and
//! signature headers.

use crate::accounts;
use crate::config::{LinqAccountConfig, LinqChannelConfig};
use crate::error::{BridgeError, Result};
use crate::host::HostContext;
use crate::inbound::{normalize_e164, InboundOutcome, InboundRouter, CHANNEL_NAME};
use crate::outbound::{DispatchResult, DispatcherOptions, JobReport, OutboundDispatcher};
use crate::pairing::PairingCoordinator;
use crate::provider::{linq, LinqClient, ProviderClient};
use crate::status::{self, ProbeReport, StatusProber, StatusSnapshot};
use crate::supervisor::ConnectionSupervisor;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type ProviderFactory =
    Box<dyn Fn(&LinqAccountConfig) -> Arc<dyn ProviderClient> + Send + Sync>;

/// Normalize an outbound target: E.164 for phone-shaped input, provider
/// chat ids passed through, anything else rejected.
pub fn normalize_target(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::InvalidTarget(raw.to_string()));
    }
    if trimmed.starts_with('+') || trimmed.chars().all(|c| c.is_ascii_digit()) {
        return normalize_e164(trimmed)
            .ok_or_else(|| BridgeError::InvalidTarget(raw.to_string()));
    }
    if trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
    {
        return Ok(trimmed.to_string());
    }
    Err(BridgeError::InvalidTarget(raw.to_string()))
}

pub struct LinqAdapter {
    cfg: RwLock<LinqChannelConfig>,
    host: HostContext,
    supervisor: ConnectionSupervisor,
    prober: StatusProber,
    pairing: Arc<PairingCoordinator>,
    providers: Mutex<HashMap<String, Arc<dyn ProviderClient>>>,
    routers: Mutex<HashMap<String, Arc<InboundRouter>>>,
    dispatchers: Mutex<HashMap<String, Arc<OutboundDispatcher>>>,
    provider_factory: ProviderFactory,
}

impl LinqAdapter {
    pub fn new(cfg: LinqChannelConfig, host: HostContext) -> Self {
        Self::with_provider_factory(
            cfg,
            host,
            Box::new(|account| Arc::new(LinqClient::new(account)) as Arc<dyn ProviderClient>),
        )
    }

    /// Inject a provider factory (tests, staging endpoints).
    pub fn with_provider_factory(
        cfg: LinqChannelConfig,
        host: HostContext,
        provider_factory: ProviderFactory,
    ) -> Self {
        let pairing = Arc::new(PairingCoordinator::new(host.allow_list.clone()));
        Self {
            cfg: RwLock::new(cfg),
            host,
            supervisor: ConnectionSupervisor::default(),
            prober: StatusProber::default(),
            pairing,
            providers: Mutex::new(HashMap::new()),
            routers: Mutex::new(HashMap::new()),
            dispatchers: Mutex::new(HashMap::new()),
            provider_factory,
        }
    }

    pub fn pairing(&self) -> &PairingCoordinator {
        &self.pairing
    }

    fn evict_account_caches(&self, account_id: &str) {
        self.providers.lock().remove(account_id);
        self.routers.lock().remove(account_id);
        self.dispatchers.lock().remove(account_id);
    }

    /// Swap in a new configuration (external reload) and drop every cache
    /// built from the old values. Active connections are untouched; routers
    /// and dispatchers are rebuilt from the new config on next use.
    pub fn update_config(&self, next: LinqChannelConfig) {
        *self.cfg.write() = next;
        self.providers.lock().clear();
        self.routers.lock().clear();
        self.dispatchers.lock().clear();
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn list_account_ids(&self) -> Vec<String> {
        accounts::list_account_ids(&self.cfg.read())
    }

    pub fn default_account_id(&self) -> String {
        accounts::default_account_id(&self.cfg.read())
    }

    pub fn describe_account(&self, account_id: &str) -> Result<accounts::AccountSummary> {
        let cfg = self.cfg.read();
        let account = accounts::resolve_account(&cfg, account_id)?;
        Ok(accounts::describe_account(account))
    }

    fn resolve_account(&self, account_id: &str) -> Result<(String, LinqAccountConfig)> {
        let cfg = self.cfg.read();
        let id = accounts::normalize_account_id(account_id);
        let account = accounts::resolve_account(&cfg, &id)?.clone();
        Ok((id, account))
    }

    fn provider_for(&self, account_id: &str) -> Result<Arc<dyn ProviderClient>> {
        if let Some(provider) = self.providers.lock().get(account_id) {
            return Ok(provider.clone());
        }
        let (id, account) = self.resolve_account(account_id)?;
        let provider = (self.provider_factory)(&account);
        self.providers.lock().insert(id, provider.clone());
        Ok(provider)
    }

    fn router_for(&self, account_id: &str) -> Result<Arc<InboundRouter>> {
        if let Some(router) = self.routers.lock().get(account_id) {
            return Ok(router.clone());
        }
        let (id, account) = self.resolve_account(account_id)?;
        let provider = self.provider_for(&id)?;
        let policy = self.cfg.read().dm_policy;
        let router = Arc::new(InboundRouter::new(
            id.clone(),
            account,
            policy,
            self.host.clone(),
            self.pairing.clone(),
            provider,
        ));
        self.routers.lock().insert(id, router.clone());
        Ok(router)
    }

    fn dispatcher_for(&self, account_id: &str) -> Result<Arc<OutboundDispatcher>> {
        if let Some(dispatcher) = self.dispatchers.lock().get(account_id) {
            return Ok(dispatcher.clone());
        }
        let provider = self.provider_for(account_id)?;
        let opts = DispatcherOptions::from(&*self.cfg.read());
        let dispatcher = OutboundDispatcher::new(provider, opts);
        self.dispatchers
            .lock()
            .insert(account_id.to_string(), dispatcher.clone());
        Ok(dispatcher)
    }

    // ── Lifecycle ──

    pub fn start_account(&self, account_id: &str, cancel: CancellationToken) -> Result<()> {
        let (id, account) = self.resolve_account(account_id)?;
        if !account.enabled {
            return Err(BridgeError::config(&id, "account is disabled"));
        }
        let provider = self.provider_for(&id)?;
        self.supervisor.start(&id, &account, provider, cancel)
    }

    pub fn stop_account(&self, account_id: &str) -> Result<()> {
        let id = accounts::normalize_account_id(account_id);
        self.supervisor.stop(&id)
    }

    pub async fn logout_account(&self, account_id: &str) -> Result<()> {
        let (id, _) = self.resolve_account(account_id)?;
        let provider = self.provider_for(&id)?;
        self.supervisor.logout(&id, provider).await?;
        // Stale caches die with the credentials.
        self.evict_account_caches(&id);
        Ok(())
    }

    // ── Inbound ──

    /// Handle one webhook delivery. The host passes the raw body plus the
    /// `X-Webhook-Timestamp` / `X-Webhook-Signature` header values.
    ///
    /// Returns `Ok(None)` for events that parse to nothing actionable
    /// (non-message events, self-echoes, empty payloads).
    pub async fn ingest_webhook(
        &self,
        account_id: &str,
        body: &str,
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> Result<Option<InboundOutcome>> {
        let (id, account) = self.resolve_account(account_id)?;

        if let Some(secret) = account
            .signing_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            let (Some(ts), Some(sig)) = (timestamp, signature) else {
                return Err(BridgeError::Pairing(
                    "webhook signature headers missing".into(),
                ));
            };
            if !linq::verify_webhook_signature(secret, body, ts, sig) {
                return Err(BridgeError::Pairing("webhook signature rejected".into()));
            }
        }

        let payload: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| BridgeError::InvalidTarget(format!("unparseable payload: {e}")))?;
        let Some(event) = linq::parse_webhook_event(&payload) else {
            return Ok(None);
        };

        let router = self.router_for(&id)?;
        router.handle_event(event).await.map(Some)
    }

    // ── Outbound ──

    pub async fn send_text(
        &self,
        cancel: &CancellationToken,
        account_id: &str,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<DispatchResult> {
        let (id, _) = self.resolve_account(account_id)?;
        let target = normalize_target(target)?;
        let dispatcher = self.dispatcher_for(&id)?;
        dispatcher.send_text(cancel, &target, text, reply_to).await
    }

    pub async fn send_media(
        &self,
        cancel: &CancellationToken,
        account_id: &str,
        target: &str,
        caption: &str,
        media_url: &str,
    ) -> Result<JobReport> {
        let (id, _) = self.resolve_account(account_id)?;
        let target = normalize_target(target)?;
        let dispatcher = self.dispatcher_for(&id)?;
        Ok(dispatcher
            .send_media(cancel, &target, caption, media_url)
            .await)
    }

    /// Flush the buffered logical turn for a target.
    pub async fn flush_turn(
        &self,
        cancel: &CancellationToken,
        account_id: &str,
        target: &str,
    ) -> Result<Option<JobReport>> {
        let (id, _) = self.resolve_account(account_id)?;
        let target = normalize_target(target)?;
        let dispatcher = self.dispatcher_for(&id)?;
        Ok(dispatcher.flush_turn(cancel, &target).await)
    }

    // ── Pairing ──

    /// Operator approval of a pending sender.
    pub async fn approve_sender(&self, account_id: &str, sender: &str) -> Result<bool> {
        let (id, _) = self.resolve_account(account_id)?;
        let provider = self.provider_for(&id)?;
        let sender = normalize_e164(sender)
            .ok_or_else(|| BridgeError::InvalidTarget(sender.to_string()))?;
        self.pairing
            .approve(provider.as_ref(), CHANNEL_NAME, &id, &sender)
            .await
    }

    /// Operator approval by pairing code.
    pub async fn approve_code(&self, account_id: &str, code: &str) -> Result<String> {
        let (id, _) = self.resolve_account(account_id)?;
        let provider = self.provider_for(&id)?;
        self.pairing
            .approve_code(provider.as_ref(), CHANNEL_NAME, &id, code)
            .await
    }

    // ── Status ──

    pub async fn probe_account(&self, account_id: &str, timeout: Duration) -> Result<ProbeReport> {
        let (id, _) = self.resolve_account(account_id)?;
        let provider = self.provider_for(&id)?;
        Ok(status::probe_account(provider.as_ref(), timeout).await)
    }

    pub async fn audit_account(&self, account_id: &str) -> Result<status::AuditReport> {
        let (id, account) = self.resolve_account(account_id)?;
        let provider = self.provider_for(&id)?;
        Ok(self.prober.audit(provider.as_ref(), &id, &account).await)
    }

    pub fn build_account_snapshot(
        &self,
        account_id: &str,
        probe: Option<&ProbeReport>,
    ) -> StatusSnapshot {
        let cfg = self.cfg.read();
        let id = accounts::normalize_account_id(account_id);
        let account = cfg.accounts.get(&id);
        status::build_account_snapshot(&id, account, self.supervisor.state(&id), probe)
    }

    // ── Config transforms ──

    /// Apply the pure enablement transform and hand the new value to the
    /// host's config store.
    pub async fn set_account_enabled(&self, account_id: &str, enabled: bool) -> Result<()> {
        let next = accounts::set_account_enabled(&self.cfg.read(), account_id, enabled)?;
        self.host.config_store.persist(&next).await?;
        *self.cfg.write() = next;
        self.evict_account_caches(&accounts::normalize_account_id(account_id));
        Ok(())
    }

    /// Remove an account and persist the updated configuration.
    pub async fn delete_account(&self, account_id: &str) -> Result<()> {
        let next = accounts::delete_account(&self.cfg.read(), account_id)?;
        self.host.config_store.persist(&next).await?;
        *self.cfg.write() = next;

        let id = accounts::normalize_account_id(account_id);
        self.evict_account_caches(&id);
        self.supervisor.forget(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_normalization() {
        assert_eq!(
            normalize_target("+1 (555) 123-4567").unwrap(),
            "+15551234567"
        );
        assert_eq!(normalize_target("15551234567").unwrap(), "+15551234567");
        assert_eq!(normalize_target("chat-v3-123").unwrap(), "chat-v3-123");
        assert!(normalize_target("").is_err());
        assert!(normalize_target("not a target!").is_err());
        assert!(normalize_target("+12").is_err());
    }
}
