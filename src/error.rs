use thiserror::Error;

/// Registry-lifecycle failures raised by the channel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("node id {0} is already registered")]
    DuplicateId(u32),
}

/// Failures reported back to the command sink. None of these terminate the
/// node; they describe a single rejected command line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid node id: {0:?}")]
    BadNodeId(String),
    #[error("cannot send a message to self")]
    SelfSend,
    #[error("unknown command: {0:?}")]
    UnknownVerb(String),
    #[error("unknown log level: {0:?} (expected error, warn, info or debug)")]
    BadLogLevel(String),
}

/// Frame codec failures. A malformed frame is dropped and logged; the
/// receiving node keeps running.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame shorter than the {expected}-byte header ({got} bytes)")]
    Truncated { expected: usize, got: usize },
    #[error("unrecognized frame type {0:?}")]
    UnknownKind(String),
    #[error("frame type is not ascii")]
    BadType,
    #[error("metadata length {0} exceeds the remaining frame")]
    BadMetadataLength(usize),
    #[error("malformed metadata: {0}")]
    BadMetadata(#[source] serde_json::Error),
    #[error("malformed control payload: {0}")]
    BadControlPayload(#[source] serde_json::Error),
    #[error("malformed position record: {0:?}")]
    BadPositionRecord(String),
    #[error("timestamp {0} is outside the representable range")]
    BadTimestamp(i64),
}

/// Session-persistence failures. Either way the caller ends up with no
/// simulator state and is told so.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("snapshot restore: {0}")]
    Restore(#[from] ChannelError),
}
