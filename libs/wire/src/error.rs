//! Error types for header decoding and tag parsing.

use std::io;

use thiserror::Error;

/// Errors produced while reading or decoding a [`WireHeader`](crate::WireHeader).
#[derive(Debug, Error)]
pub enum HeaderError {
    /// The peer closed the stream before a full header arrived.
    #[error("short header read: received {received} of {expected} bytes")]
    ShortRead { received: usize, expected: usize },

    /// The protocol tag contains bytes outside printable ASCII.
    #[error("malformed protocol tag: {0:02x?}")]
    MalformedTag([u8; 4]),

    /// Underlying transport error while reading the header.
    #[error("io error reading header: {0}")]
    Io(#[from] io::Error),
}

impl HeaderError {
    /// Stable reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            HeaderError::ShortRead { .. } => "short_read",
            HeaderError::MalformedTag(_) => "malformed_tag",
            HeaderError::Io(_) => "io_error",
        }
    }
}

/// Errors produced when building a [`ProtoTag`](crate::ProtoTag) from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("protocol tag must be exactly 4 bytes, got {0}")]
    Length(usize),

    #[error("protocol tag must be printable ASCII: {0:?}")]
    NotAscii(String),
}
