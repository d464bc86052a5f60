//! Stream header codec for the sluice relay.
//!
//! Every multiplexed stream opened between a sluice client and server starts
//! with a fixed 22-byte header naming the backend protocol the stream carries:
//!
//! ```text
//! +----------------+-------------------------------+-------------+
//! | proto (4, ASCII) | addr (16, IPv6 / v4-mapped) | port (2, BE) |
//! +----------------+-------------------------------+-------------+
//! ```
//!
//! No length prefix follows; the tunneled payload is a raw byte stream until
//! either side closes.

mod error;
mod header;
mod tag;

pub use error::{HeaderError, TagError};
pub use header::{WireHeader, HEADER_LEN};
pub use tag::ProtoTag;
