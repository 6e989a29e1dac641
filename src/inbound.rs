//! Inbound routing: normalize provider events, resolve the session route,
//! apply access policy, and deduplicate.
//!
//! Events for one account are handled in arrival order by a single router;
//! accounts never share a router, so cross-account traffic parallelizes
//! freely.

use crate::config::{DmPolicy, LinqAccountConfig};
use crate::error::{BridgeError, Result};
use crate::host::{HostContext, PeerId, SessionRoute};
use crate::pairing::PairingCoordinator;
use crate::provider::{ChatKind, MediaRef, ProviderClient, ProviderEvent};
use crate::util::truncate_with_ellipsis;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

pub const CHANNEL_NAME: &str = "linq";

/// How many recent provider message ids we remember per account.
const DEDUP_WINDOW: usize = 256;

/// Canonical inbound message, immutable once constructed.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Provider message id (dedup key).
    pub message_id: String,
    pub account_id: String,
    /// Canonical E.164 sender.
    pub sender: String,
    pub peer: PeerId,
    pub body: String,
    pub media: Vec<MediaRef>,
    pub timestamp: u64,
}

/// What the router did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Delivered to the host session pipeline.
    Delivered { session_key: String },
    /// Same provider message id seen before; dropped without reprocessing.
    Duplicate,
    /// Unknown sender under a pairing policy; a code reply went out.
    PairingPending { code: String, created: bool },
    /// Unknown sender under an allow-list-only policy.
    Denied,
}

/// Normalize a raw handle to E.164: `+` followed by 7–15 digits.
///
/// Accepts separators (spaces, dashes, dots, parentheses) and a bare
/// national/international digit string; anything else is unparseable.
pub fn normalize_e164(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let rest = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let mut digits = String::with_capacity(rest.len());
    for ch in rest.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !matches!(ch, ' ' | '-' | '.' | '(' | ')') {
            return None;
        }
    }

    if (7..=15).contains(&digits.len()) {
        Some(format!("+{digits}"))
    } else {
        None
    }
}

/// Bounded recent-id window absorbing provider at-least-once delivery.
struct DedupWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; returns false if it was already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

pub struct InboundRouter {
    account_id: String,
    account: LinqAccountConfig,
    policy: DmPolicy,
    host: HostContext,
    pairing: Arc<PairingCoordinator>,
    provider: Arc<dyn ProviderClient>,
    seen: Mutex<DedupWindow>,
}

impl InboundRouter {
    pub fn new(
        account_id: impl Into<String>,
        account: LinqAccountConfig,
        policy: DmPolicy,
        host: HostContext,
        pairing: Arc<PairingCoordinator>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            account,
            policy,
            host,
            pairing,
            provider,
            seen: Mutex::new(DedupWindow::new(DEDUP_WINDOW)),
        }
    }

    /// Build the canonical envelope for a provider event.
    ///
    /// Fails with `InvalidTarget` when the sender identity does not
    /// normalize; such events are dropped with a diagnostic, never
    /// forwarded.
    pub fn normalize(&self, event: &ProviderEvent) -> Result<InboundEnvelope> {
        let sender = normalize_e164(&event.sender)
            .ok_or_else(|| BridgeError::InvalidTarget(event.sender.clone()))?;

        // Group conversations key on the provider chat id; direct chats on
        // the peer number so the session survives chat-id churn.
        let peer = match (&event.chat_kind, event.chat_id.as_deref()) {
            (ChatKind::Direct, _) => PeerId {
                kind: ChatKind::Direct,
                id: sender.clone(),
            },
            (kind, Some(chat_id)) => PeerId {
                kind: *kind,
                id: chat_id.to_string(),
            },
            (kind, None) => PeerId {
                kind: *kind,
                id: sender.clone(),
            },
        };

        Ok(InboundEnvelope {
            message_id: event.message_id.clone(),
            account_id: self.account_id.clone(),
            sender,
            peer,
            body: event.body.clone(),
            media: event.media.clone(),
            timestamp: event.timestamp,
        })
    }

    /// Stable session route for (account, peer).
    pub fn resolve_route(&self, peer: &PeerId) -> SessionRoute {
        self.host.sessions.resolve_route(&self.account_id, peer)
    }

    async fn is_sender_allowed(&self, sender: &str) -> Result<bool> {
        if self
            .account
            .allowed_senders
            .iter()
            .any(|entry| entry == "*" || entry == sender)
        {
            return Ok(true);
        }
        let stored = self.host.allow_list.read(&self.account_id).await?;
        Ok(stored.iter().any(|entry| entry == sender))
    }

    /// Process one provider event end to end.
    ///
    /// At-most-once: the message id is recorded before delivery, so a
    /// provider retry of the same id never reaches the host twice.
    pub async fn handle_event(&self, event: ProviderEvent) -> Result<InboundOutcome> {
        let envelope = match self.normalize(&event) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    "linq[{}]: dropping event {}: {e} (body {:?})",
                    self.account_id,
                    event.message_id,
                    truncate_with_ellipsis(&event.body, 40)
                );
                return Err(e);
            }
        };

        if !self.seen.lock().insert(&envelope.message_id) {
            tracing::debug!(
                "linq[{}]: duplicate message {}, dropping",
                self.account_id,
                envelope.message_id
            );
            return Ok(InboundOutcome::Duplicate);
        }

        if !self.is_sender_allowed(&envelope.sender).await? {
            match self.policy {
                DmPolicy::Open => {}
                DmPolicy::Allowlist => {
                    tracing::warn!(
                        "linq[{}]: ignoring message from unauthorized sender {}",
                        self.account_id,
                        envelope.sender
                    );
                    return Ok(InboundOutcome::Denied);
                }
                DmPolicy::Pairing => {
                    let ticket =
                        self.pairing
                            .upsert_request(CHANNEL_NAME, &envelope.sender, None);
                    if ticket.created {
                        let id_line = format!("From: {}", envelope.sender);
                        let reply =
                            PairingCoordinator::build_pairing_reply(&id_line, &ticket.code);
                        // Reply goes to the chat when we have one, else the number.
                        let target = event.chat_id.as_deref().unwrap_or(&envelope.sender);
                        if let Err(e) = self.provider.send_text(target, &reply, None).await {
                            tracing::warn!(
                                "linq[{}]: pairing reply to {} failed: {e}",
                                self.account_id,
                                envelope.sender
                            );
                        }
                    }
                    return Ok(InboundOutcome::PairingPending {
                        code: ticket.code,
                        created: ticket.created,
                    });
                }
            }
        }

        let route = self.resolve_route(&envelope.peer);
        let session_key = route.session_key.clone();
        self.host.inbound.deliver(envelope, route).await?;
        Ok(InboundOutcome::Delivered { session_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinqChannelConfig;
    use crate::host::{
        AllowListStore, ConfigStore, InboundSink, SessionRouter, StaticSessionRouter,
    };
    use crate::provider::SendReceipt;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct MemoryAllowList {
        entries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AllowListStore for MemoryAllowList {
        async fn read(&self, _account_id: &str) -> Result<Vec<String>> {
            Ok(self.entries.lock().clone())
        }
        async fn upsert(&self, _account_id: &str, entry: &str) -> Result<()> {
            self.entries.lock().push(entry.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemorySink {
        delivered: Mutex<Vec<(InboundEnvelope, SessionRoute)>>,
    }

    #[async_trait]
    impl InboundSink for MemorySink {
        async fn deliver(&self, envelope: InboundEnvelope, route: SessionRoute) -> Result<()> {
            self.delivered.lock().push((envelope, route));
            Ok(())
        }
    }

    struct NoopConfigStore;

    #[async_trait]
    impl ConfigStore for NoopConfigStore {
        async fn persist(&self, _cfg: &LinqChannelConfig) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProvider {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ProviderClient for RecordingProvider {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn open_event_source(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn send_text(
            &self,
            target: &str,
            text: &str,
            _reply_to: Option<&str>,
        ) -> Result<SendReceipt> {
            self.sent.lock().push((target.to_string(), text.to_string()));
            Ok(SendReceipt {
                channel: "linq",
                message_id: None,
                chat_id: None,
            })
        }
        async fn send_media(
            &self,
            _target: &str,
            _caption: &str,
            _media_url: &str,
        ) -> Result<SendReceipt> {
            unimplemented!("not used in inbound tests")
        }
        async fn list_phone_numbers(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn logout(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        router: InboundRouter,
        sink: Arc<MemorySink>,
        provider: Arc<RecordingProvider>,
    }

    fn fixture(policy: DmPolicy, allowed: &[&str]) -> Fixture {
        let sink = Arc::new(MemorySink::default());
        let provider = Arc::new(RecordingProvider::default());
        let allow_list = Arc::new(MemoryAllowList::default());
        let host = HostContext {
            sessions: Arc::new(StaticSessionRouter) as Arc<dyn SessionRouter>,
            allow_list: allow_list.clone(),
            inbound: sink.clone(),
            config_store: Arc::new(NoopConfigStore),
        };
        let pairing = Arc::new(PairingCoordinator::new(allow_list));
        let account = LinqAccountConfig {
            api_token: "tok".into(),
            from_phone: "+15550000000".into(),
            allowed_senders: allowed.iter().map(|s| (*s).to_string()).collect(),
            ..Default::default()
        };
        Fixture {
            router: InboundRouter::new(
                "default",
                account,
                policy,
                host,
                pairing,
                provider.clone(),
            ),
            sink,
            provider,
        }
    }

    fn event(id: &str, sender: &str, body: &str) -> ProviderEvent {
        ProviderEvent {
            message_id: id.to_string(),
            sender: sender.to_string(),
            chat_id: Some("chat-1".to_string()),
            chat_kind: ChatKind::Direct,
            body: body.to_string(),
            media: vec![],
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn e164_normalization() {
        assert_eq!(
            normalize_e164("+1 (555) 123-4567").as_deref(),
            Some("+15551234567")
        );
        assert_eq!(normalize_e164("15551234567").as_deref(), Some("+15551234567"));
        assert_eq!(normalize_e164("not-a-number"), None);
        assert_eq!(normalize_e164("+123"), None, "too short");
        assert_eq!(normalize_e164("+1234567890123456"), None, "too long");
    }

    #[test]
    fn dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        assert!(window.insert("a"));
        assert!(window.insert("b"));
        assert!(!window.insert("a"));
        assert!(window.insert("c"), "evicts a");
        assert!(window.insert("a"), "a fell out of the window");
    }

    #[tokio::test]
    async fn allowed_sender_is_delivered_once() {
        let fx = fixture(DmPolicy::Pairing, &["+15551234567"]);

        let outcome = fx
            .router
            .handle_event(event("m-1", "+15551234567", "hello"))
            .await
            .expect("handled");
        assert!(matches!(outcome, InboundOutcome::Delivered { .. }));

        let dup = fx
            .router
            .handle_event(event("m-1", "+15551234567", "hello"))
            .await
            .expect("handled");
        assert_eq!(dup, InboundOutcome::Duplicate);
        assert_eq!(fx.sink.delivered.lock().len(), 1, "no second delivery");
    }

    #[tokio::test]
    async fn session_key_is_stable_across_events() {
        let fx = fixture(DmPolicy::Open, &[]);

        let first = fx
            .router
            .handle_event(event("m-1", "+15551234567", "one"))
            .await
            .expect("handled");
        let second = fx
            .router
            .handle_event(event("m-2", "+15551234567", "two"))
            .await
            .expect("handled");

        let (InboundOutcome::Delivered { session_key: a }, InboundOutcome::Delivered { session_key: b }) =
            (first, second)
        else {
            panic!("both events should deliver");
        };
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn unknown_sender_gets_pairing_code_and_no_delivery() {
        let fx = fixture(DmPolicy::Pairing, &[]);

        let outcome = fx
            .router
            .handle_event(event("m-1", "+15551234567", "hi"))
            .await
            .expect("handled");

        let InboundOutcome::PairingPending { code, created } = outcome else {
            panic!("expected pairing outcome");
        };
        assert!(created);
        assert_eq!(code.len(), 4);
        assert!(fx.sink.delivered.lock().is_empty(), "nothing reaches the host");

        let sent = fx.provider.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains(&code));
        assert!(sent[0].1.contains("+15551234567"));
    }

    #[tokio::test]
    async fn repeated_unknown_sender_reuses_code_without_replying_again() {
        let fx = fixture(DmPolicy::Pairing, &[]);

        let first = fx
            .router
            .handle_event(event("m-1", "+15551234567", "hi"))
            .await
            .expect("handled");
        let second = fx
            .router
            .handle_event(event("m-2", "+15551234567", "hello?"))
            .await
            .expect("handled");

        let (InboundOutcome::PairingPending { code: c1, created: true },
             InboundOutcome::PairingPending { code: c2, created: false }) = (first, second)
        else {
            panic!("expected two pairing outcomes");
        };
        assert_eq!(c1, c2);
        assert_eq!(fx.provider.sent.lock().len(), 1, "one code reply only");
    }

    #[tokio::test]
    async fn allowlist_policy_denies_silently() {
        let fx = fixture(DmPolicy::Allowlist, &[]);
        let outcome = fx
            .router
            .handle_event(event("m-1", "+15551234567", "hi"))
            .await
            .expect("handled");
        assert_eq!(outcome, InboundOutcome::Denied);
        assert!(fx.sink.delivered.lock().is_empty());
        assert!(fx.provider.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn invalid_sender_is_dropped_with_invalid_target() {
        let fx = fixture(DmPolicy::Open, &[]);
        let err = fx
            .router
            .handle_event(event("m-1", "gibberish", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTarget(_)));
        assert!(fx.sink.delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn group_events_route_on_chat_id() {
        let fx = fixture(DmPolicy::Open, &[]);
        let mut ev = event("m-1", "+15551234567", "hi all");
        ev.chat_kind = ChatKind::Group;

        let outcome = fx.router.handle_event(ev).await.expect("handled");
        let InboundOutcome::Delivered { session_key } = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(session_key, "linq:default:group:chat-1");
    }
}
