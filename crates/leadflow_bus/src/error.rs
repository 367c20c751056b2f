use thiserror::Error;

/// Errors raised by a [`crate::MessageBus`] implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// The transport could not be reached.
    #[error("failed to connect to bus at {url}: {reason}")]
    Connect { url: String, reason: String },

    /// A publish call was rejected by the transport.
    #[error("failed to publish on `{subject}`: {reason}")]
    Publish { subject: String, reason: String },

    #[error("failed to subscribe to `{subject}`: {reason}")]
    Subscribe { subject: String, reason: String },

    /// Payload could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> BusError {
        BusError::Json(err.to_string())
    }
}
