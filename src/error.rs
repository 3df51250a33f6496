use thiserror::Error;

/// Errors that can occur during publish/subscribe operations.
///
/// Structural errors (`Config`, `Connection`, `Closed`) are returned
/// synchronously to the caller. Per-message failures (`Serialization`,
/// `Backend` while publishing) are logged and swallowed by the worker or
/// receive loop that hit them and never abort a `publish`/`subscribe` call.
#[derive(Error, Debug)]
pub enum Error {
    /// A required connection parameter is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend unreachable or liveness probe failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// `publish`/`subscribe` called after the broker was closed.
    #[error("pubsub is closed")]
    Closed,

    /// The subscription mailbox is closed and fully drained.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// Payload encode/decode failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `pop` waited its full duration without a message.
    #[error("timed out waiting for message")]
    Timeout,

    /// The cancellation token fired during a blocking wait.
    #[error("operation cancelled")]
    Cancelled,

    /// A backend call (publish, ack, nack, unsubscribe) failed.
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    ///
    /// Only connection failures are transient; everything else is either
    /// permanent for this call or a per-message failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

/// Result type alias for publish/subscribe operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn closed_errors_render_stable_text() {
        assert_eq!(Error::Closed.to_string(), "pubsub is closed");
        assert_eq!(Error::SubscriptionClosed.to_string(), "subscription closed");
        assert_eq!(Error::Timeout.to_string(), "timed out waiting for message");
    }

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(Error::Connection("refused".into()).is_retryable());
        assert!(!Error::Config("missing".into()).is_retryable());
        assert!(!Error::Closed.is_retryable());
        assert!(!Error::Backend("boom".into()).is_retryable());
    }
}
