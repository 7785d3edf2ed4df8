use thiserror::Error;

/// Failures surfaced by the realtime voice session.
///
/// `Issuance` and `Negotiation` during the initial connect are returned from
/// `start()`. `Transport` while live is absorbed by one transparent reconnect
/// before it becomes visible. `ProtocolDecode` never leaves the protocol
/// channel; it exists so decode failures can be logged with a uniform type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("credential issuance failed: {0}")]
    Issuance(String),

    #[error("SDP negotiation failed: {0}")]
    Negotiation(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("audio source unavailable: {0}")]
    Media(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("session stopped before it went live")]
    Cancelled,
}

/// Why an inbound data-channel message was dropped.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no `type` discriminator")]
    MissingType,

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("payload exceeds {limit} bytes")]
    Oversized { limit: usize },
}

impl From<DecodeError> for SessionError {
    fn from(err: DecodeError) -> Self {
        Self::ProtocolDecode(err.to_string())
    }
}
