use std::time::Duration;

use thiserror::Error;

/// Failure of an outbound gateway call.
///
/// Cheap to clone: a single failure is handed to every caller that joined the
/// same in-flight request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("upstream responded with status {status}")]
    Status {
        status: u16,
        body: serde_json::Value,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("too many requests, retry in {reset_in:?}")]
    RateLimited { reset_in: Duration },

    #[error("request aborted: {0}")]
    Aborted(String),

    #[error("failed to decode response body: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Whether a later attempt could reasonably succeed: timeouts, connection
    /// failures and upstream `5xx` answers. Client errors, malformed requests,
    /// aborts and local rate-limit rejections are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidRequest(_)
            | Self::RateLimited { .. }
            | Self::Aborted(_)
            | Self::Decode(_) => false,
        }
    }

    /// HTTP status of an upstream error answer, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_retry() {
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(GatewayError::Transport("refused".into()).is_retryable());
        assert!(
            GatewayError::Status {
                status: 503,
                body: serde_json::Value::Null
            }
            .is_retryable()
        );
        assert!(
            !GatewayError::Status {
                status: 404,
                body: serde_json::Value::Null
            }
            .is_retryable()
        );
        assert!(!GatewayError::InvalidRequest("bad url".into()).is_retryable());
        assert!(
            !GatewayError::RateLimited {
                reset_in: Duration::from_secs(1)
            }
            .is_retryable()
        );
    }
}
