//! Error type shared by the HYPER engine.

use thiserror::Error;

/// Errors raised by the codec, connections and sessions.
///
/// Anything surfacing from a connection task is fatal for that connection
/// only; sessions and other connections keep running.
#[derive(Debug, Error)]
pub enum HyperError {
    #[error("frame of {len} bytes exceeds the {max} byte limit for kind {kind}")]
    FrameTooLarge { kind: u8, len: usize, max: usize },

    #[error("segment payload of {len} bytes exceeds pooled buffer size {max}")]
    SegmentTooLarge { len: usize, max: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("malformed {kind} message: {reason}")]
    Malformed {
        kind: &'static str,
        reason: &'static str,
    },

    #[error("invalid UTF-8 in request path")]
    InvalidPath(#[from] std::string::FromUtf8Error),

    #[error("unexpected {0} message on this connection")]
    UnexpectedMessage(&'static str),

    #[error("no session for {0}")]
    NoSession(String),

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, HyperError>;

impl HyperError {
    pub(crate) fn malformed(kind: &'static str, reason: &'static str) -> Self {
        HyperError::Malformed { kind, reason }
    }
}
