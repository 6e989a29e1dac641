//! Typed error taxonomy shared by every bridge operation.
//!
//! Callers branch on the variant: configuration problems fail fast,
//! connectivity problems are retryable, delivery and pairing problems are
//! reported per operation, invalid targets are rejected before any network
//! traffic.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Account id not present in the configuration.
    #[error("unknown account: {0}")]
    NotFound(String),

    /// Invalid or incomplete configuration. Never retried.
    #[error("configuration error for account {account_id}: {reason}")]
    Config { account_id: String, reason: String },

    /// Transport or provider availability failure. Retryable.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The provider refused or failed an outbound unit.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Pairing handshake failure (unknown code, rejected signature).
    #[error("pairing error: {0}")]
    Pairing(String),

    /// Target identity that does not normalize; rejected locally.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The operation's cancellation token fired before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn config(account_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            account_id: account_id.into(),
            reason: reason.into(),
        }
    }
}
