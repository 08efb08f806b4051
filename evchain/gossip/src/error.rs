use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unexpected end of frame")]
    UnexpectedEnd,
    #[error("mtu too small")]
    MtuTooSmall,
    #[error("max frame count exceeded")]
    MaxFrameCountExceeded,
    #[error("mixed compression")]
    MixedCompression,
    #[error("frame stream id mismatch: expected {expected}, got {actual}")]
    StreamIdMismatch {
        expected: uuid::Uuid,
        actual: uuid::Uuid,
    },
    #[error("frame stream not terminated")]
    NotTerminated,
    #[error("no frames received")]
    NoFrames,
    #[error("frame source is not valid utf-8")]
    SourceNotUtf8,
    #[error("compression error: {0}")]
    Compression(String),
}

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("target {0} not found in cluster")]
    TargetNotFound(String),
    #[error("cluster is empty")]
    ClusterEmpty,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("packet encryption failure")]
    Encryption,
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("message produced no frames")]
    EmptyMessage,
}
