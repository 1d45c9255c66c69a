use thiserror::Error;

#[derive(Error, Debug)]
pub enum PiCameraError {
    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Already connected; terminate() before connecting again")]
    AlreadyConnected,

    #[error("Camera has been terminated")]
    Terminated,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// Violations of the data channel wire format. Always recoverable: the
/// offending message is dropped and the channel stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    EmptyMessage,

    #[error("Unknown message tag {tag}")]
    UnknownTag { tag: u8 },

    #[error("Invalid transfer header: {reason}")]
    InvalidHeader { reason: String },

    #[error("Transfer of {total} bytes exceeds limit of {limit} bytes")]
    TransferTooLarge { total: usize, limit: usize },

    #[error("Fragment overflows transfer: {received} + {fragment} > {total}")]
    Overflow {
        received: usize,
        fragment: usize,
        total: usize,
    },

    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Peer connection is closed")]
    Closed,

    #[error("Negotiation failed: {reason}")]
    NegotiationFailed { reason: String },

    #[error("Invalid session description: {reason}")]
    InvalidDescription { reason: String },

    #[error("Invalid ICE candidate: {reason}")]
    InvalidCandidate { reason: String },

    #[error("Data channel {label} error: {reason}")]
    DataChannel { label: String, reason: String },

    #[error("Media unavailable: {reason}")]
    MediaUnavailable { reason: String },

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Invalid signaling message: {reason}")]
    InvalidMessage { reason: String },

    #[error("Invalid endpoint: {0}")]
    InvalidUrl(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
