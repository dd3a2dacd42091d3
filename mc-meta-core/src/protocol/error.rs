use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};

/// Why a key failed the client-side precondition check (spec invariant I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidKeyReason {
    /// `key.len() == 0`.
    TooShort,
    /// `key.len() > 250`.
    TooLong,
    /// Key contains a space, tab, CR or LF and the base64-key flag was not set.
    ContainsWhitespace,
}

impl Display for InvalidKeyReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "key must be at least 1 byte"),
            Self::TooLong => write!(f, "key must be at most 250 bytes"),
            Self::ContainsWhitespace => {
                write!(f, "key contains whitespace and is not base64-flagged")
            }
        }
    }
}

/// Errors produced by the wire codec. See spec §4.1/§7 for the connection
/// disposition each kind implies; [`CodecError::must_close`] answers that
/// question directly so the connection engine and pool never have to
/// re-derive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Server replied `CLIENT_ERROR <msg>`. Protocol state is considered
    /// corrupted; the connection must be closed.
    ClientError(String),
    /// Server replied `SERVER_ERROR <msg>`. The connection remains usable.
    ServerError(String),
    /// Server replied the bare `ERROR` line.
    GenericError,
    /// The client could not make sense of a response line or data block.
    ParseError(String),
    /// A request's key failed validation before any bytes were written.
    InvalidKey(InvalidKeyReason),
}

impl CodecError {
    /// Whether the connection that produced this error is safe to return to
    /// the pool. Mirrors the "Connection state" column in spec §4.1.
    pub fn must_close(&self) -> bool {
        match self {
            Self::ClientError(_) | Self::GenericError | Self::ParseError(_) => true,
            Self::ServerError(_) => false,
            Self::InvalidKey(_) => false,
        }
    }
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientError(msg) => write!(f, "CLIENT_ERROR {}", msg),
            Self::ServerError(msg) => write!(f, "SERVER_ERROR {}", msg),
            Self::GenericError => write!(f, "ERROR"),
            Self::ParseError(msg) => write!(f, "parse error: {}", msg),
            Self::InvalidKey(reason) => write!(f, "invalid key: {}", reason),
        }
    }
}

impl StdError for CodecError {}
