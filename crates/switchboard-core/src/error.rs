use thiserror::Error;

/// Failures surfaced by the relay. Only the dispatch-side variants ever reach a
/// controller; `MalformedEvent` stays local to the event router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("agent not connected: {0}")]
    AgentNotConnected(String),
    #[error("no reply before timeout")]
    Timeout,
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("invalid reply: {0}")]
    InvalidReply(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Stable reason code reported in `requestResult.reason`.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::AgentNotConnected(_) => "agent_not_connected",
            RelayError::Timeout => "timeout",
            RelayError::MalformedEvent(_) => "malformed_event",
            RelayError::InvalidReply(_) => "invalid_reply",
            RelayError::Transport(_) => "transport",
        }
    }

    /// Whether another attempt of the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Timeout | RelayError::InvalidReply(_) | RelayError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RelayError::Timeout.code(), "timeout");
        assert_eq!(
            RelayError::AgentNotConnected("ghost".into()).code(),
            "agent_not_connected"
        );
        assert_eq!(RelayError::InvalidRequest("x".into()).code(), "invalid_request");
    }

    #[test]
    fn only_reply_path_failures_retry() {
        assert!(RelayError::Timeout.is_retryable());
        assert!(RelayError::InvalidReply("no coordinates".into()).is_retryable());
        assert!(!RelayError::AgentNotConnected("a".into()).is_retryable());
        assert!(!RelayError::InvalidRequest("a".into()).is_retryable());
    }
}
