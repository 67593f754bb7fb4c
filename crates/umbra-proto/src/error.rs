//! Wire-format errors.

use thiserror::Error;

/// Error parsing or building DNS wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("unexpected end of message at offset {0}")]
    UnexpectedEof(usize),

    #[error("label exceeds 63 bytes")]
    LabelTooLong,

    #[error("name exceeds 255 bytes")]
    NameTooLong,

    #[error("empty label")]
    EmptyLabel,

    #[error("compression pointer loop")]
    PointerLoop,

    #[error("invalid compression pointer to offset {0}")]
    BadPointer(usize),

    #[error("message too short for header")]
    ShortHeader,

    #[error("more than one OPT record")]
    MultipleOpt,

    #[error("malformed {0} rdata")]
    BadRdata(&'static str),
}

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
