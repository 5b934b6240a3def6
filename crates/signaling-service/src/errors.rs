//! Signaling service error types.
//!
//! Every error that reaches a client is rendered through
//! [`SignalingError::client_message`], which is the single place where
//! user-visible rejection text is produced. Engine internals are logged
//! server-side but never echoed to clients.

use crate::engine::EngineError;
use thiserror::Error;

/// Identity registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// The requested display name is blank.
    #[error("empty user name")]
    EmptyName,

    /// The requested display name is held by another live session.
    #[error("user '{0}' already registered")]
    NameTaken(String),

    /// The connection already owns a registered session.
    #[error("connection already registered")]
    AlreadyRegistered,
}

/// Signaling service error type.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Registration was rejected.
    #[error("Registration rejected: {0}")]
    Register(#[from] RegisterError),

    /// The connection has no registered session.
    #[error("Connection is not registered")]
    NotRegistered,

    /// Call target does not exist.
    #[error("Unknown call target: {0}")]
    UnknownTarget(String),

    /// A session tried to call itself.
    #[error("Self call rejected")]
    SelfCall,

    /// The requested peer is already paired or ringing.
    #[error("Peer busy: {0}")]
    PeerBusy(String),

    /// The callee declined.
    #[error("Call declined by {0}")]
    CallDeclined(String),

    /// No call from the named caller is pending for this session.
    #[error("No pending call from {0}")]
    NoPendingCall(String),

    /// The requested pairing strategy is not enabled on this instance.
    #[error("Pairing strategy disabled")]
    StrategyDisabled,

    /// Media negotiation engine failure.
    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    /// The establishment deadline elapsed.
    #[error("Establishment timed out")]
    EstablishmentTimeout,

    /// The attempt was torn down while it was still being established.
    #[error("Establishment cancelled")]
    Cancelled,

    /// The outbound channel of a connection is gone.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The outbound mailbox of a connection has no free slot.
    #[error("Mailbox full: {0}")]
    MailboxFull(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Returns a client-safe rejection reason (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::Register(e) => e.to_string(),
            SignalingError::NotRegistered => "connection is not registered".to_string(),
            SignalingError::UnknownTarget(name) => format!("user '{name}' is not registered"),
            SignalingError::SelfCall => "cannot call yourself".to_string(),
            SignalingError::PeerBusy(name) => format!("user '{name}' is busy"),
            SignalingError::CallDeclined(name) => format!("user '{name}' declined the call"),
            SignalingError::NoPendingCall(name) => format!("no pending call from '{name}'"),
            SignalingError::StrategyDisabled => "explicit calls are disabled".to_string(),
            SignalingError::Engine(_) | SignalingError::Cancelled => {
                "media negotiation failed".to_string()
            }
            SignalingError::EstablishmentTimeout => "media negotiation timed out".to_string(),
            SignalingError::ConnectionClosed(_)
            | SignalingError::MailboxFull(_)
            | SignalingError::Internal(_) => {
                "an internal error occurred".to_string()
            }
        }
    }

    /// Bounded label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SignalingError::Register(_) => "register",
            SignalingError::NotRegistered => "not_registered",
            SignalingError::UnknownTarget(_) => "unknown_target",
            SignalingError::SelfCall => "self_call",
            SignalingError::PeerBusy(_) => "peer_busy",
            SignalingError::CallDeclined(_) => "declined",
            SignalingError::NoPendingCall(_) => "no_pending_call",
            SignalingError::StrategyDisabled => "strategy_disabled",
            SignalingError::Engine(_) => "engine",
            SignalingError::EstablishmentTimeout => "timeout",
            SignalingError::Cancelled => "cancelled",
            SignalingError::ConnectionClosed(_) => "connection_closed",
            SignalingError::MailboxFull(_) => "mailbox_full",
            SignalingError::Internal(_) => "internal",
        }
    }
}
