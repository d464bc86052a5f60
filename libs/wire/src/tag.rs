use std::fmt;
use std::str::FromStr;

use crate::error::{HeaderError, TagError};

/// Four-byte ASCII protocol tag carried at the start of every stream header.
///
/// Tags are compared byte-exact. `"SSH "` (with the trailing space) and
/// `"SSH"` are different tags, and the latter is not a valid tag at all.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtoTag([u8; 4]);

impl ProtoTag {
    /// Tag length on the wire.
    pub const LEN: usize = 4;

    /// HTTP backend.
    pub const HTTP: ProtoTag = ProtoTag(*b"HTTP");

    /// SSH backend.
    pub const SSH: ProtoTag = ProtoTag(*b"SSH ");

    /// Build a tag from raw header bytes.
    ///
    /// Every byte must be printable ASCII (0x20..=0x7e).
    pub fn from_bytes(bytes: [u8; 4]) -> Result<Self, HeaderError> {
        if bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
            Ok(Self(bytes))
        } else {
            Err(HeaderError::MalformedTag(bytes))
        }
    }

    /// Raw tag bytes.
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Tag as text. Tags are always ASCII, so this never loses data.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for ProtoTag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| TagError::Length(s.len()))?;

        Self::from_bytes(bytes).map_err(|_| TagError::NotAscii(s.to_string()))
    }
}

impl fmt::Display for ProtoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ProtoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtoTag({:?})", self.as_str())
    }
}
