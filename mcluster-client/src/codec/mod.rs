//! # Wire Codec
//!
//! Purpose: Encode requests and decode response frames for both memcached
//! framings behind one small surface.
//!
//! ## Design Principles
//! 1. **One Request Model**: `Request` describes what to send; each framing
//!    decides how to lay it out.
//! 2. **Length-Driven Reads**: Values are read by their declared byte count,
//!    never by scanning for a delimiter, so payloads are binary-safe.
//! 3. **Caller Caps**: A `limit` rejects oversize values before their body is
//!    read; the connection is then unusable and must be closed.
//! 4. **Errors Are Frames**: Server error replies decode to
//!    `Frame::ServerError` so the socket stays in a known state.
//!
//! ## Frame Flow
//!
//! ```text
//! multi-get (text):   get k1 k2 k3\r\n
//!                     ◀ VALUE k1 ..  ◀ VALUE k3 ..  ◀ END
//! multi-get (binary): GETKQ k1 | GETKQ k2 | GETKQ k3 | NOOP
//!                     ◀ GETKQ k1     ◀ GETKQ k3     ◀ NOOP (terminal)
//! ```

pub mod binary;
pub mod text;

use std::io::BufRead;

use bytes::BytesMut;

use mcluster_common::{Item, McError, McResult, ProtocolVariant, StoreMode, Ttl};

/// Largest value length a frame may declare (memcached's 1 GiB item ceiling).
pub const MAX_DECLARED_LENGTH: usize = 1 << 30;

/// A request ready to be framed. Keys are wire keys (prefix applied).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    /// Retrieve one or more keys; `cas` asks for CAS tokens in text framing.
    Get { keys: &'a [Vec<u8>], cas: bool },
    /// Storage command of any flavour.
    Store {
        mode: StoreMode,
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        ttl: Ttl,
    },
    Delete { key: &'a [u8] },
    /// Reset an item's expiration.
    Touch { key: &'a [u8], ttl: Ttl },
    /// Increment (`incr = true`) or decrement a numeric value.
    Arith { key: &'a [u8], delta: u64, incr: bool },
    /// Invalidate every item, optionally after a delay.
    Flush { delay: Ttl },
    Version,
    Stats,
}

/// One decoded response unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Retrieved item; the key is the wire key.
    Value(Item),
    /// Terminal marker of a multi-frame response.
    End,
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
    /// Counter value after incr/decr.
    Number(u64),
    Stat { name: String, value: String },
    Version(String),
    /// Explicit error reply; the connection remains usable.
    ServerError { message: String, temporary: bool },
}

/// Appends the framed request to `out`.
///
/// Only binary framing can fail, when a length overflows its header field.
pub fn encode(variant: ProtocolVariant, request: &Request<'_>, out: &mut BytesMut) -> McResult<()> {
    match variant {
        ProtocolVariant::Text => {
            text::encode(request, out);
            Ok(())
        }
        ProtocolVariant::Binary => binary::encode(request, out),
    }
}

/// Reads one frame from `reader`.
///
/// `scratch` is a reusable line/body buffer; `limit` caps value lengths.
pub fn read_frame<R: BufRead>(
    variant: ProtocolVariant,
    reader: &mut R,
    scratch: &mut Vec<u8>,
    limit: Option<usize>,
) -> McResult<Frame> {
    match variant {
        ProtocolVariant::Text => text::read_frame(reader, scratch, limit),
        ProtocolVariant::Binary => binary::read_frame(reader, scratch, limit),
    }
}

/// Checks a declared value length against the hard ceiling and the caller cap.
pub(crate) fn check_length(declared: usize, limit: Option<usize>) -> McResult<()> {
    if declared > MAX_DECLARED_LENGTH {
        return Err(McError::protocol(format!(
            "declared length {declared} exceeds protocol maximum"
        )));
    }
    match limit {
        Some(limit) if declared > limit => Err(McError::Oversize { declared, limit }),
        _ => Ok(()),
    }
}

/// Returns true when a server error message describes a passing condition.
pub(crate) fn is_temporary_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("out of memory") || lower.contains("busy") || lower.contains("temporar")
}
