//! Transport error types.

/// Errors from the trading API transport.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unauthorized (HTTP {0})")]
    Unauthorized(u16),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid API settings: {0}")]
    InvalidSettings(String),

    #[error("client closed")]
    Closed,
}

impl TransportError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout | Self::RateLimited => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the service must stop rather than skip the cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Classify an HTTP status that was not a success.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(status),
            429 => Self::RateLimited,
            _ => Self::Status {
                status,
                body: body.chars().take(256).collect(),
            },
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16(), "")
        } else {
            Self::Connect(e.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::RateLimited.is_transient());
        assert!(TransportError::from_status(503, "").is_transient());
        assert!(!TransportError::from_status(404, "").is_transient());
        assert!(!TransportError::Decode("x".into()).is_transient());

        assert_eq!(TransportError::from_status(401, ""), TransportError::Unauthorized(401));
        assert!(TransportError::from_status(403, "").is_fatal());
        assert!(!TransportError::from_status(500, "").is_fatal());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        match TransportError::from_status(500, &body) {
            TransportError::Status { body, .. } => assert_eq!(body.len(), 256),
            other => panic!("unexpected {other:?}"),
        }
    }
}
