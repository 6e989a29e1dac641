//! Pairing handshake for unknown senders.
//!
//! An unknown sender gets a short numeric code; an operator approves the
//! code out of band, which appends the sender to the allow-list store and
//! notifies them. Pending requests expire after a TTL and at most one is
//! live per (channel, sender).

use crate::error::{BridgeError, Result};
use crate::host::AllowListStore;
use crate::provider::ProviderClient;
use parking_lot::Mutex;
use rand::RngExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed notification sent to a sender once an operator approves them.
pub const PAIRING_APPROVED_MESSAGE: &str =
    "You're paired. Messages from this number will now reach the assistant.";

const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct PendingRequest {
    code: String,
    created_at: Instant,
    /// Optional display name captured from the provider event.
    sender_name: Option<String>,
}

/// Result of an upsert: the live code plus whether this call created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingTicket {
    pub code: String,
    pub created: bool,
}

pub struct PairingCoordinator {
    ttl: Duration,
    allow_list: Arc<dyn AllowListStore>,
    pending: Mutex<HashMap<(String, String), PendingRequest>>,
}

impl PairingCoordinator {
    pub fn new(allow_list: Arc<dyn AllowListStore>) -> Self {
        Self::with_ttl(allow_list, DEFAULT_TTL)
    }

    pub fn with_ttl(allow_list: Arc<dyn AllowListStore>, ttl: Duration) -> Self {
        Self {
            ttl,
            allow_list,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Create or return the pending pairing request for (channel, sender).
    ///
    /// A second call before the TTL expires returns the same code with
    /// `created = false`. Expired requests are treated as absent.
    pub fn upsert_request(
        &self,
        channel: &str,
        sender_id: &str,
        sender_name: Option<&str>,
    ) -> PairingTicket {
        let key = (channel.to_string(), sender_id.to_string());
        let mut pending = self.pending.lock();

        let now = Instant::now();
        pending.retain(|_, req| now.duration_since(req.created_at) < self.ttl);

        if let Some(existing) = pending.get(&key) {
            return PairingTicket {
                code: existing.code.clone(),
                created: false,
            };
        }

        // Codes must be unique among concurrently pending requests.
        let mut code = generate_code();
        while pending.values().any(|req| req.code == code) {
            code = generate_code();
        }

        pending.insert(
            key,
            PendingRequest {
                code: code.clone(),
                created_at: now,
                sender_name: sender_name.map(ToString::to_string),
            },
        );
        tracing::info!("pairing: issued code for {sender_id} on {channel}");
        PairingTicket {
            code,
            created: true,
        }
    }

    /// Deterministic, human-readable reply for a pending request.
    pub fn build_pairing_reply(id_line: &str, code: &str) -> String {
        format!(
            "This number isn't paired with the assistant yet.\n\
             {id_line}\n\
             Pairing code: {code}\n\
             Ask the operator to approve this code to continue."
        )
    }

    /// Display name captured with the pending request, if any.
    pub fn sender_display(&self, channel: &str, sender_id: &str) -> Option<String> {
        self.pending
            .lock()
            .get(&(channel.to_string(), sender_id.to_string()))
            .and_then(|req| req.sender_name.clone())
    }

    /// Look up the sender awaiting approval under `code`.
    pub fn sender_for_code(&self, channel: &str, code: &str) -> Option<String> {
        let mut pending = self.pending.lock();
        let now = Instant::now();
        pending.retain(|_, req| now.duration_since(req.created_at) < self.ttl);
        pending
            .iter()
            .find(|((ch, _), req)| ch == channel && req.code == code)
            .map(|((_, sender), _)| sender.clone())
    }

    /// Approve a sender: append to the allow-list store and notify them.
    ///
    /// Idempotent — approving an already-approved sender is a no-op and
    /// returns `Ok(false)`.
    pub async fn approve(
        &self,
        provider: &dyn ProviderClient,
        channel: &str,
        account_id: &str,
        sender_id: &str,
    ) -> Result<bool> {
        let already = self
            .allow_list
            .read(account_id)
            .await?
            .iter()
            .any(|entry| entry == sender_id);
        if already {
            self.pending
                .lock()
                .remove(&(channel.to_string(), sender_id.to_string()));
            return Ok(false);
        }

        self.allow_list.upsert(account_id, sender_id).await?;
        self.pending
            .lock()
            .remove(&(channel.to_string(), sender_id.to_string()));

        if let Err(e) = provider
            .send_text(sender_id, PAIRING_APPROVED_MESSAGE, None)
            .await
        {
            // Approval stands even if the notification bounces.
            tracing::warn!("pairing: approval notice to {sender_id} failed: {e}");
        }
        tracing::info!("pairing: approved {sender_id} for account {account_id}");
        Ok(true)
    }

    /// Approve by code instead of sender id.
    pub async fn approve_code(
        &self,
        provider: &dyn ProviderClient,
        channel: &str,
        account_id: &str,
        code: &str,
    ) -> Result<String> {
        let sender = self
            .sender_for_code(channel, code)
            .ok_or_else(|| BridgeError::Pairing(format!("unknown or expired code {code}")))?;
        self.approve(provider, channel, account_id, &sender).await?;
        Ok(sender)
    }

    /// Number of live pending requests (expired ones excluded).
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock();
        let now = Instant::now();
        pending.retain(|_, req| now.duration_since(req.created_at) < self.ttl);
        pending.len()
    }
}

/// 4-digit numeric code, zero-padded.
fn generate_code() -> String {
    let n: u16 = rand::rng().random_range(0..10_000);
    format!("{n:04}")
}

#[cfg(test)]
mod tests {
    use super::*;
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
            let mut entries = self.entries.lock();
            if !entries.iter().any(|e| e == entry) {
                entries.push(entry.to_string());
            }
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
                message_id: Some("m-1".into()),
                chat_id: None,
            })
        }
        async fn send_media(
            &self,
            _target: &str,
            _caption: &str,
            _media_url: &str,
        ) -> Result<SendReceipt> {
            unimplemented!("not used in pairing tests")
        }
        async fn list_phone_numbers(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn logout(&self) -> Result<()> {
            Ok(())
        }
    }

    fn coordinator() -> (PairingCoordinator, Arc<MemoryAllowList>) {
        let store = Arc::new(MemoryAllowList::default());
        (PairingCoordinator::new(store.clone()), store)
    }

    #[test]
    fn upsert_twice_returns_same_code() {
        let (pairing, _) = coordinator();
        let first = pairing.upsert_request("linq", "+15551234567", None);
        let second = pairing.upsert_request("linq", "+15551234567", None);

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.code, second.code);
        assert_eq!(first.code.len(), 4);
        assert!(first.code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn codes_unique_among_pending() {
        let (pairing, _) = coordinator();
        let mut codes = std::collections::HashSet::new();
        for i in 0..50 {
            let ticket = pairing.upsert_request("linq", &format!("+1555000{i:04}"), None);
            assert!(codes.insert(ticket.code), "duplicate pending code");
        }
    }

    #[test]
    fn expired_request_is_absent() {
        let store = Arc::new(MemoryAllowList::default());
        let pairing = PairingCoordinator::with_ttl(store, Duration::from_millis(0));

        let first = pairing.upsert_request("linq", "+15551234567", None);
        let second = pairing.upsert_request("linq", "+15551234567", None);

        // TTL of zero expires immediately: the second call mints fresh,
        // and the count purge drops that one too.
        assert!(first.created);
        assert!(second.created);
        assert_eq!(pairing.pending_count(), 0);
    }

    #[test]
    fn reply_embeds_identity_and_code() {
        let reply = PairingCoordinator::build_pairing_reply("From: +15551234567", "7431");
        assert!(reply.contains("From: +15551234567"));
        assert!(reply.contains("Pairing code: 7431"));
    }

    #[tokio::test]
    async fn approve_appends_and_notifies() {
        let (pairing, store) = coordinator();
        let provider = RecordingProvider::default();
        pairing.upsert_request("linq", "+15551234567", None);

        let created = pairing
            .approve(&provider, "linq", "default", "+15551234567")
            .await
            .expect("approve");

        assert!(created);
        assert_eq!(store.entries.lock().as_slice(), ["+15551234567"]);
        let sent = provider.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, PAIRING_APPROVED_MESSAGE);
        assert_eq!(pairing.pending_count(), 0);
    }

    #[tokio::test]
    async fn approve_is_idempotent() {
        let (pairing, store) = coordinator();
        let provider = RecordingProvider::default();

        let first = pairing
            .approve(&provider, "linq", "default", "+15551234567")
            .await
            .expect("approve");
        let second = pairing
            .approve(&provider, "linq", "default", "+15551234567")
            .await
            .expect("approve again");

        assert!(first);
        assert!(!second, "second approval is a no-op");
        assert_eq!(store.entries.lock().len(), 1);
        assert_eq!(provider.sent.lock().len(), 1, "no duplicate notification");
    }

    #[tokio::test]
    async fn approve_by_code_resolves_sender() {
        let (pairing, _) = coordinator();
        let provider = RecordingProvider::default();
        let ticket = pairing.upsert_request("linq", "+15551234567", Some("Sam"));
        assert_eq!(
            pairing.sender_display("linq", "+15551234567").as_deref(),
            Some("Sam")
        );

        let sender = pairing
            .approve_code(&provider, "linq", "default", &ticket.code)
            .await
            .expect("approve by code");
        assert_eq!(sender, "+15551234567");

        let err = pairing
            .approve_code(&provider, "linq", "default", "0000")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Pairing(_)));
    }
}
