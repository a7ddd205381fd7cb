use std::fmt;

use frame_channel::ChannelError;
use thiserror::Error;

/// Why a session's outstanding work was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    Disconnected,
    SourceChanged,
    ReconnectStopped,
    Refreshed,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::Disconnected => "disconnected",
            InvalidationReason::SourceChanged => "source-changed",
            InvalidationReason::ReconnectStopped => "reconnect-stopped",
            InvalidationReason::Refreshed => "refreshed",
        }
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("peer channel unavailable")]
    ChannelUnavailable,
    #[error("{kind} timed out after {elapsed_ms}ms")]
    Timeout { kind: String, elapsed_ms: u64 },
    #[error("{0}")]
    PeerRejected(String),
    #[error("legacy transport cannot perform {method}: {detail}")]
    UnsupportedLegacyOperation { method: String, detail: String },
    #[error("cannot resolve tab for {method}: {detail}")]
    TabUnresolved { method: String, detail: String },
    #[error("session invalidated: {0}")]
    SessionInvalidated(InvalidationReason),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("frame host error: {0}")]
    Channel(String),
}

impl BridgeError {
    pub fn timeout(kind: impl Into<String>, elapsed_ms: u64) -> Self {
        BridgeError::Timeout {
            kind: kind.into(),
            elapsed_ms,
        }
    }

    pub fn unsupported(method: impl Into<String>, detail: impl Into<String>) -> Self {
        BridgeError::UnsupportedLegacyOperation {
            method: method.into(),
            detail: detail.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}

impl From<ChannelError> for BridgeError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Unavailable => BridgeError::ChannelUnavailable,
            other => BridgeError::Channel(other.to_string()),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
