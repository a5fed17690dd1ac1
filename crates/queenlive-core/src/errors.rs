use std::time::Duration;

/// Error taxonomy for session, media and signaling operations.
/// Classifies errors as retryable (transient network trouble) or final.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("device acquisition failed: {0}")]
    Device(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,

    #[error("another join or leave is in progress")]
    Busy,
    #[error("not joined")]
    NotJoined,
    #[error("action requires the host role")]
    HostOnly,
    #[error("rejected: {0}")]
    Rejected(String),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Device(_) => "device",
            Self::Network(_) => "network",
            Self::Protocol(_) => "protocol",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Busy => "busy",
            Self::NotJoined => "not_joined",
            Self::HostOnly => "host_only",
            Self::Rejected(_) => "rejected",
        }
    }

    /// Classify a non-success HTTP status from the control plane.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Auth(body),
            500..=599 => Self::Network(format!("server returned {status}: {body}")),
            _ => Self::Protocol(format!("unexpected status {status}: {body}")),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Protocol(e.to_string())
    }
}
