//! Linq Partner V3 API client.
//!
//! Webhook mode (push-based): inbound events arrive at the host's webhook
//! route and are handed to [`parse_webhook_event`]; this client covers the
//! outbound half plus credential/webhook provisioning.

use super::{ChatKind, MediaRef, ProviderClient, ProviderEvent, SendReceipt};
use crate::config::LinqAccountConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

const LINQ_API_BASE: &str = "https://api.linqapp.com/api/partner/v3";

/// Webhook timestamps older than this are rejected as replays.
const SIGNATURE_MAX_AGE_SECS: i64 = 300;

pub struct LinqClient {
    api_token: String,
    from_phone: String,
    webhook_url: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl LinqClient {
    pub fn new(account: &LinqAccountConfig) -> Self {
        Self {
            api_token: account.api_token.clone(),
            from_phone: account.from_phone.clone(),
            webhook_url: account.webhook_url.clone(),
            base_url: LINQ_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at a different API root (tests, staging).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn phone_number(&self) -> &str {
        &self.from_phone
    }

    fn message_body(text: &str, media_url: Option<&str>, reply_to: Option<&str>) -> serde_json::Value {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(serde_json::json!({ "type": "text", "value": text }));
        }
        if let Some(url) = media_url {
            parts.push(serde_json::json!({ "type": "media", "url": url }));
        }

        let mut message = serde_json::json!({ "parts": parts });
        if let Some(id) = reply_to {
            message["reply_to_message_id"] = serde_json::Value::String(id.to_string());
        }
        serde_json::json!({ "message": message })
    }

    fn receipt_from_response(value: &serde_json::Value) -> SendReceipt {
        let message_id = value
            .pointer("/data/message/id")
            .or_else(|| value.pointer("/data/message_id"))
            .or_else(|| value.pointer("/message/id"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string);
        let chat_id = value
            .pointer("/data/chat/id")
            .or_else(|| value.pointer("/data/chat_id"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string);
        SendReceipt {
            channel: "linq",
            message_id,
            chat_id,
        }
    }

    async fn post_message(
        &self,
        url: String,
        body: &serde_json::Value,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(&url)
            .bearer_auth(&self.api_token)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
    }
}

#[async_trait]
impl ProviderClient for LinqClient {
    async fn connect(&self) -> Result<()> {
        let url = format!("{}/phonenumbers", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| BridgeError::Connectivity(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            Err(BridgeError::config(
                &self.from_phone,
                "Linq API rejected the token (401)",
            ))
        } else {
            Err(BridgeError::Connectivity(format!(
                "Linq API error: {}",
                resp.status()
            )))
        }
    }

    async fn open_event_source(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let Some(webhook_url) = self.webhook_url.as_deref() else {
            // Nothing to provision; the operator registered the webhook in
            // the Linq dashboard.
            tracing::debug!("linq: no webhook_url configured, skipping subscription");
            return Ok(());
        };

        let body = serde_json::json!({
            "url": webhook_url,
            "events": ["message.received"],
        });
        let resp = self
            .post_message(format!("{}/webhooks", self.base_url), &body)
            .await
            .map_err(|e| BridgeError::Connectivity(e.to_string()))?;

        if resp.status().is_success() || resp.status() == reqwest::StatusCode::CONFLICT {
            // 409 means the subscription already exists.
            Ok(())
        } else {
            Err(BridgeError::Connectivity(format!(
                "webhook subscription failed: {}",
                resp.status()
            )))
        }
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SendReceipt> {
        let body = Self::message_body(text, None, reply_to);

        // Try the chat-scoped endpoint first (target is usually a chat id).
        let url = format!("{}/chats/{}/messages", self.base_url, target);
        let resp = self
            .post_message(url, &body)
            .await
            .map_err(|e| BridgeError::Connectivity(e.to_string()))?;

        if resp.status().is_success() {
            let value: serde_json::Value = resp.json().await.unwrap_or_default();
            return Ok(Self::receipt_from_response(&value));
        }

        // 404: no such chat — create one keyed by the recipient number.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            let mut create = body;
            create["from"] = serde_json::Value::String(self.from_phone.clone());
            create["to"] = serde_json::json!([target]);

            let create_resp = self
                .post_message(format!("{}/chats", self.base_url), &create)
                .await
                .map_err(|e| BridgeError::Connectivity(e.to_string()))?;

            if !create_resp.status().is_success() {
                let status = create_resp.status();
                tracing::error!("linq create chat failed: {status}");
                return Err(BridgeError::Delivery(format!("Linq API error: {status}")));
            }

            let value: serde_json::Value = create_resp.json().await.unwrap_or_default();
            return Ok(Self::receipt_from_response(&value));
        }

        let status = resp.status();
        tracing::error!("linq send failed: {status}");
        Err(BridgeError::Delivery(format!("Linq API error: {status}")))
    }

    async fn send_media(
        &self,
        target: &str,
        caption: &str,
        media_url: &str,
    ) -> Result<SendReceipt> {
        let body = Self::message_body(caption, Some(media_url), None);
        let url = format!("{}/chats/{}/messages", self.base_url, target);
        let resp = self
            .post_message(url, &body)
            .await
            .map_err(|e| BridgeError::Connectivity(e.to_string()))?;

        if resp.status().is_success() {
            let value: serde_json::Value = resp.json().await.unwrap_or_default();
            Ok(Self::receipt_from_response(&value))
        } else {
            let status = resp.status();
            tracing::error!("linq media send failed: {status}");
            Err(BridgeError::Delivery(format!("Linq API error: {status}")))
        }
    }

    async fn list_phone_numbers(&self) -> Result<Vec<String>> {
        let url = format!("{}/phonenumbers", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| BridgeError::Connectivity(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(BridgeError::Connectivity(format!(
                "Linq API error: {}",
                resp.status()
            )));
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::Connectivity(e.to_string()))?;
        let numbers = value
            .pointer("/data/phonenumbers")
            .or_else(|| value.get("phonenumbers"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|entry| {
                        entry
                            .as_str()
                            .or_else(|| entry.get("phone_number").and_then(|p| p.as_str()))
                            .map(ToString::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(numbers)
    }

    async fn logout(&self) -> Result<()> {
        let url = format!("{}/sessions/current", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| BridgeError::Connectivity(e.to_string()))?;

        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(BridgeError::Connectivity(format!(
                "Linq logout failed: {}",
                resp.status()
            )))
        }
    }

    async fn start_typing(&self, target: &str) {
        let url = format!("{}/chats/{}/typing", self.base_url, target);
        match self.client.post(&url).bearer_auth(&self.api_token).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::debug!("linq start_typing failed: {}", resp.status());
            }
            Err(e) => tracing::debug!("linq start_typing failed: {e}"),
            _ => {}
        }
    }

    async fn stop_typing(&self, target: &str) {
        let url = format!("{}/chats/{}/typing", self.base_url, target);
        match self
            .client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                tracing::debug!("linq stop_typing failed: {}", resp.status());
            }
            Err(e) => tracing::debug!("linq stop_typing failed: {e}"),
            _ => {}
        }
    }
}

/// Parse one Linq webhook payload into a [`ProviderEvent`].
///
/// Supports both payload generations:
/// - legacy: `data.from`, `data.chat_id`, `data.message.parts`
/// - current v3: `data.sender_handle.handle`, `data.chat.id`, `data.parts`
///
/// Returns `None` for non-message events, self-echoes, and payloads with no
/// usable content. Authorization and dedup are the router's job, not ours.
pub fn parse_webhook_event(payload: &serde_json::Value) -> Option<ProviderEvent> {
    let event_type = payload
        .get("event_type")
        .and_then(|e| e.as_str())
        .unwrap_or("");
    if event_type != "message.received" {
        tracing::debug!("linq: skipping non-message event: {event_type}");
        return None;
    }

    let data = payload.get("data")?;

    // Skip messages sent by the account itself. Linq expresses this as
    // legacy `is_from_me`, v3 `sender_handle.is_me`, or a direction marker.
    let is_echo = data
        .get("is_from_me")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
        || data
            .pointer("/sender_handle/is_me")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        || matches!(
            data.get("direction").and_then(|v| v.as_str()),
            Some("outbound")
        );
    if is_echo {
        tracing::debug!("linq: skipping self-echo");
        return None;
    }

    let sender = data
        .get("from")
        .and_then(|f| f.as_str())
        .or_else(|| data.get("sender").and_then(|f| f.as_str()))
        .or_else(|| data.pointer("/sender_handle/handle").and_then(|h| h.as_str()))?
        .to_string();

    let chat_id = data
        .get("chat_id")
        .and_then(|c| c.as_str())
        .or_else(|| data.pointer("/chat/id").and_then(|id| id.as_str()))
        .filter(|id| !id.is_empty())
        .map(ToString::to_string);

    // Group chats carry more than one non-self participant.
    let participant_count = data
        .pointer("/chat/participants")
        .and_then(|p| p.as_array())
        .map_or(0, Vec::len);
    let chat_kind = if participant_count > 2 || data.get("group").is_some() {
        ChatKind::Group
    } else {
        ChatKind::Direct
    };

    let parts = data
        .pointer("/message/parts")
        .and_then(|p| p.as_array())
        .or_else(|| data.get("parts").and_then(|p| p.as_array()))?;

    let mut text_parts: Vec<String> = Vec::new();
    let mut media: Vec<MediaRef> = Vec::new();
    for part in parts {
        let Some(part_type) = part.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        match part_type {
            "text" => {
                if let Some(value) = part.get("value").and_then(|v| v.as_str()) {
                    if !value.is_empty() {
                        text_parts.push(value.to_string());
                    }
                }
            }
            "media" | "image" => {
                let source = part
                    .get("url")
                    .or_else(|| part.get("value"))
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|v| !v.is_empty());
                let mime_type = part
                    .get("mime_type")
                    .and_then(|v| v.as_str())
                    .map(|m| m.trim().to_ascii_lowercase());

                match source {
                    Some(url)
                        if mime_type
                            .as_deref()
                            .is_none_or(|m| m.starts_with("image/")) =>
                    {
                        media.push(MediaRef {
                            url: url.to_string(),
                            mime_type,
                        });
                    }
                    _ => tracing::debug!("linq: skipping unsupported {part_type} part"),
                }
            }
            other => tracing::debug!("linq: skipping {other} part"),
        }
    }

    let body = text_parts.join("\n").trim().to_string();
    if body.is_empty() && media.is_empty() {
        return None;
    }

    // Provider message id; fall back to the event id so dedup still works.
    let message_id = data
        .pointer("/message/id")
        .or_else(|| data.get("message_id"))
        .and_then(|v| v.as_str())
        .or_else(|| payload.get("event_id").and_then(|v| v.as_str()))?
        .to_string();

    let timestamp = payload
        .get("created_at")
        .and_then(|t| t.as_str())
        .and_then(|t| {
            chrono::DateTime::parse_from_rfc3339(t)
                .ok()
                .map(|dt| dt.timestamp().unsigned_abs())
        })
        .unwrap_or_else(|| chrono::Utc::now().timestamp().unsigned_abs());

    Some(ProviderEvent {
        message_id,
        sender,
        chat_id,
        chat_kind,
        body,
        media,
        timestamp,
    })
}

/// Verify a Linq webhook signature.
///
/// Linq signs webhooks with HMAC-SHA256 over `"{timestamp}.{body}"`. The
/// signature arrives hex-encoded (optionally `sha256=`-prefixed) in
/// `X-Webhook-Signature`, the timestamp in `X-Webhook-Timestamp`.
/// Timestamps older than 300 s are rejected.
pub fn verify_webhook_signature(
    secret: &str,
    body: &str,
    timestamp: &str,
    signature: &str,
) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let Ok(ts) = timestamp.parse::<i64>() else {
        tracing::warn!("linq: invalid webhook timestamp: {timestamp}");
        return false;
    };
    let now = chrono::Utc::now().timestamp();
    if (now - ts).unsigned_abs() > SIGNATURE_MAX_AGE_SECS.unsigned_abs() {
        tracing::warn!("linq: rejecting stale webhook timestamp ({ts}, now={now})");
        return false;
    }

    let message = format!("{timestamp}.{body}");
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message.as_bytes());

    let signature_hex = signature
        .trim()
        .strip_prefix("sha256=")
        .unwrap_or(signature);
    let Ok(provided) = hex::decode(signature_hex.trim().to_ascii_lowercase()) else {
        tracing::warn!("linq: invalid webhook signature format");
        return false;
    };

    // Constant-time comparison via HMAC verify.
    mac.verify_slice(&provided).is_ok()
}
