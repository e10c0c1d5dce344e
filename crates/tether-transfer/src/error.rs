use thiserror::Error;

/// Failures surfaced to the host application.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("peer link is not connected")]
    NotConnected,

    #[error("receiver rejected the transfer: {0}")]
    ConsentRejected(String),

    #[error("a transfer is already in progress")]
    TransferInProgress,

    #[error("file name must not be empty")]
    EmptyFileName,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Transport-level failures reported by a peer link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link is not open")]
    NotOpen,

    #[error("link closed by remote peer")]
    Closed,

    #[error("link could not be created: {0}")]
    Create(String),

    #[error("link transport error: {0}")]
    Transport(String),
}

/// Negotiation payloads that could not be applied. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signal arrived while no session is active")]
    NoSession,

    #[error("signal from {0} who is not the current remote peer")]
    UnknownSender(String),

    #[error("candidate applied before any remote description")]
    CandidateBeforeDescription,

    #[error("{0} is not valid for this link's role")]
    UnexpectedSignal(&'static str),

    #[error("malformed signal: {0}")]
    Malformed(String),
}

/// Data-channel frames that break the transfer protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("chunk received with no active transfer")]
    ChunkWithoutMetadata,

    #[error("abort received with no active transfer")]
    AbortWithoutTransfer,

    #[error("metadata for {incoming:?} replaced unfinished transfer of {previous:?}")]
    MetadataMidTransfer { previous: String, incoming: String },

    #[error("received {received} bytes but metadata announced {expected}")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("metadata carries an empty file name")]
    EmptyFileName,

    #[error("malformed frame: {0}")]
    Malformed(String),
}
