use std::fmt;
use thiserror::Error;

/// Classification of a decoding failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input is not well-formed bencode.
    Invalid,
    /// The input looks like bencode but exceeds a resource limit of the decoder.
    Unsupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Invalid => write!(f, "invalid"),
            ErrorKind::Unsupported => write!(f, "unsupported"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} bencode at offset {offset}: {reason}")]
pub struct Error {
    kind: ErrorKind,
    offset: usize,
    reason: &'static str,
}

impl Error {
    pub(crate) fn invalid(offset: usize, reason: &'static str) -> Self {
        Self {
            kind: ErrorKind::Invalid,
            offset,
            reason,
        }
    }

    pub(crate) fn unsupported(offset: usize, reason: &'static str) -> Self {
        Self {
            kind: ErrorKind::Unsupported,
            offset,
            reason,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Byte offset into the input at which the problem was detected.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}
