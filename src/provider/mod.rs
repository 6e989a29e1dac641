//! Partner API boundary.
//!
//! The bridge core never talks HTTP directly; it goes through
//! [`ProviderClient`], which the Linq implementation in [`linq`] satisfies
//! and tests replace with mocks.

pub mod linq;

pub use linq::{verify_webhook_signature, LinqClient};

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Kind of conversation a provider event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatKind {
    Direct,
    Group,
    Channel,
    Thread,
}

impl ChatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Channel => "channel",
            Self::Thread => "thread",
        }
    }
}

/// Reference to a media attachment carried by an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    pub mime_type: Option<String>,
}

/// A raw inbound event after provider-shape parsing, before routing.
///
/// Field names follow the provider's vocabulary; the inbound router turns
/// this into a canonical envelope.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    /// Provider message id, used for at-least-once dedup.
    pub message_id: String,
    /// Raw sender handle as the provider reported it.
    pub sender: String,
    /// Provider conversation id, preferred reply target when present.
    pub chat_id: Option<String>,
    pub chat_kind: ChatKind,
    pub body: String,
    pub media: Vec<MediaRef>,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

/// Receipt for one accepted outbound unit.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Channel tag, always "linq" for the real client.
    pub channel: &'static str,
    /// Provider-assigned message id, when the API returned one.
    pub message_id: Option<String>,
    /// Conversation the unit landed in.
    pub chat_id: Option<String>,
}

/// Everything the bridge needs from the partner API.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Cheap credential/connectivity check. Must not retry internally.
    async fn connect(&self) -> Result<()>;

    /// Ensure the inbound event source is provisioned (webhook subscription).
    /// Returns once provisioned; delivery itself arrives via the host's
    /// webhook route and [`crate::adapter::LinqAdapter::ingest_webhook`].
    async fn open_event_source(&self, cancel: &CancellationToken) -> Result<()>;

    /// Send one text unit to a target (chat id or E.164 number).
    async fn send_text(
        &self,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SendReceipt>;

    /// Send a media attachment with an optional caption.
    async fn send_media(
        &self,
        target: &str,
        caption: &str,
        media_url: &str,
    ) -> Result<SendReceipt>;

    /// List phone numbers provisioned for this token (standing check).
    async fn list_phone_numbers(&self) -> Result<Vec<String>>;

    /// Revoke this token's provider-side session. Callers treat failure as
    /// "still logged in".
    async fn logout(&self) -> Result<()>;

    /// Best-effort typing indicator; failures are logged, never surfaced.
    async fn start_typing(&self, _target: &str) {}
    async fn stop_typing(&self, _target: &str) {}
}
