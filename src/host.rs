//! Capability contracts the host implements.
//!
//! One trait per capability group instead of a single object of optional
//! callbacks, and everything is handed to the core explicitly through
//! [`HostContext`] — there is no process-wide runtime singleton.

use crate::config::LinqChannelConfig;
use crate::error::Result;
use crate::inbound::InboundEnvelope;
use crate::provider::ChatKind;
use async_trait::async_trait;
use std::sync::Arc;

/// Remote conversation participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId {
    pub kind: ChatKind,
    /// Canonical identity: E.164 number for direct chats, provider chat id
    /// for groups.
    pub id: String,
}

/// Mapping from (account, peer) to a host conversation session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRoute {
    pub session_key: String,
    pub account_id: String,
    pub peer: PeerId,
    pub agent_id: Option<String>,
}

/// Resolves host session routing. Must be a pure function of its inputs:
/// the same (account, peer) always yields the same session key, so sessions
/// survive restarts.
pub trait SessionRouter: Send + Sync {
    fn resolve_route(&self, account_id: &str, peer: &PeerId) -> SessionRoute;
}

/// Default keying scheme: `linq:<account>:<kind>:<peer>`.
pub struct StaticSessionRouter;

impl SessionRouter for StaticSessionRouter {
    fn resolve_route(&self, account_id: &str, peer: &PeerId) -> SessionRoute {
        SessionRoute {
            session_key: format!("linq:{account_id}:{}:{}", peer.kind.as_str(), peer.id),
            account_id: account_id.to_string(),
            peer: peer.clone(),
            agent_id: None,
        }
    }
}

/// Persisted set of senders approved to message an account.
#[async_trait]
pub trait AllowListStore: Send + Sync {
    async fn read(&self, account_id: &str) -> Result<Vec<String>>;
    /// Idempotent append.
    async fn upsert(&self, account_id: &str, entry: &str) -> Result<()>;
}

/// Where updated configuration values go. The registry transforms are pure;
/// persisting the returned value atomically is the host's single writer.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn persist(&self, cfg: &LinqChannelConfig) -> Result<()>;
}

/// Inbound delivery callback, invoked exactly once per authorized,
/// deduplicated message.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn deliver(&self, envelope: InboundEnvelope, route: SessionRoute) -> Result<()>;
}

/// Host collaborators handed into every core operation.
#[derive(Clone)]
pub struct HostContext {
    pub sessions: Arc<dyn SessionRouter>,
    pub allow_list: Arc<dyn AllowListStore>,
    pub inbound: Arc<dyn InboundSink>,
    pub config_store: Arc<dyn ConfigStore>,
}
