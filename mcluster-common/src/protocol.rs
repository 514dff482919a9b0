//! # Protocol Structures
//!
//! Purpose: Define the memcached wire constants shared by the text and binary
//! codecs: framing variant, binary opcodes, status codes, and the fixed
//! 24-byte binary header.
//!
//! ## Design Principles
//!
//! 1. **Wire Fidelity**: Layouts match the memcached binary protocol so
//!    unmodified servers interoperate.
//! 2. **Big-Endian Everywhere**: All multi-byte header fields are network order.
//! 3. **Closed Enums**: Unknown opcodes/statuses decode to `None`/`Other` rather
//!    than panicking.
//!
//! ## Memory Layout Example
//!
//! ```text
//! Request header (24 bytes total):
//! +-------+--------+---------+--------+----------+-----------+
//! | magic | opcode | key_len | ext_len| datatype | vbucket   |
//! +-------+--------+---------+--------+----------+-----------+
//! | 1B    | 1B     | 2B      | 1B     | 1B       | 2B        |
//! +-------+--------+---------+--------+----------+-----------+
//! | total_body:4B  | opaque:4B        | cas:8B               |
//! +----------------+------------------+----------------------+
//!
//! Response header (24 bytes total):
//! identical, except `vbucket` carries the 2B status code.
//!
//! Body (total_body bytes):
//! +-------------+---------+-----------+
//! | extras      | key     | value     |
//! +-------------+---------+-----------+
//! ```

use serde::Deserialize;

use crate::error::{McError, McResult};

/// Request magic byte.
pub const MAGIC_REQUEST: u8 = 0x80;

/// Response magic byte.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Size of the binary protocol header.
pub const HEADER_LEN: usize = 24;

/// Raw data type (the only one defined).
pub const DATATYPE_RAW: u8 = 0x00;

/// Largest body a binary packet can declare.
pub const MAX_BODY_LEN: usize = u32::MAX as usize;

/// Wire framing used to talk to the servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    /// Line-oriented ASCII protocol.
    #[default]
    Text,
    /// Fixed-header binary protocol.
    Binary,
}

pub const OP_GET: u8 = 0x00;
pub const OP_SET: u8 = 0x01;
pub const OP_ADD: u8 = 0x02;
pub const OP_REPLACE: u8 = 0x03;
pub const OP_DELETE: u8 = 0x04;
pub const OP_INCREMENT: u8 = 0x05;
pub const OP_DECREMENT: u8 = 0x06;
pub const OP_FLUSH: u8 = 0x08;
pub const OP_NOOP: u8 = 0x0a;
pub const OP_VERSION: u8 = 0x0b;
pub const OP_GETK: u8 = 0x0c;
pub const OP_GETKQ: u8 = 0x0d;
pub const OP_APPEND: u8 = 0x0e;
pub const OP_PREPEND: u8 = 0x0f;
pub const OP_STAT: u8 = 0x10;
pub const OP_TOUCH: u8 = 0x1c;

/// Binary protocol opcodes used by the client.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Get = OP_GET,
    Set = OP_SET,
    Add = OP_ADD,
    Replace = OP_REPLACE,
    Delete = OP_DELETE,
    Increment = OP_INCREMENT,
    Decrement = OP_DECREMENT,
    Flush = OP_FLUSH,
    Noop = OP_NOOP,
    Version = OP_VERSION,
    /// Get that echoes the key back.
    GetK = OP_GETK,
    /// Quiet GetK: misses produce no response.
    GetKQ = OP_GETKQ,
    Append = OP_APPEND,
    Prepend = OP_PREPEND,
    Stat = OP_STAT,
    Touch = OP_TOUCH,
}

impl Opcode {
    /// Convert opcode to its wire byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to create an opcode from its wire byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            OP_GET => Some(Self::Get),
            OP_SET => Some(Self::Set),
            OP_ADD => Some(Self::Add),
            OP_REPLACE => Some(Self::Replace),
            OP_DELETE => Some(Self::Delete),
            OP_INCREMENT => Some(Self::Increment),
            OP_DECREMENT => Some(Self::Decrement),
            OP_FLUSH => Some(Self::Flush),
            OP_NOOP => Some(Self::Noop),
            OP_VERSION => Some(Self::Version),
            OP_GETK => Some(Self::GetK),
            OP_GETKQ => Some(Self::GetKQ),
            OP_APPEND => Some(Self::Append),
            OP_PREPEND => Some(Self::Prepend),
            OP_STAT => Some(Self::Stat),
            OP_TOUCH => Some(Self::Touch),
            _ => None,
        }
    }

    /// Get human-readable opcode name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Set => "SET",
            Self::Add => "ADD",
            Self::Replace => "REPLACE",
            Self::Delete => "DELETE",
            Self::Increment => "INCREMENT",
            Self::Decrement => "DECREMENT",
            Self::Flush => "FLUSH",
            Self::Noop => "NOOP",
            Self::Version => "VERSION",
            Self::GetK => "GETK",
            Self::GetKQ => "GETKQ",
            Self::Append => "APPEND",
            Self::Prepend => "PREPEND",
            Self::Stat => "STAT",
            Self::Touch => "TOUCH",
        }
    }

    /// Check if the opcode carries a value in its response.
    pub const fn is_retrieval(self) -> bool {
        matches!(self, Self::Get | Self::GetK | Self::GetKQ)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Binary response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    NonNumeric,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    /// Any code this client does not know.
    Other(u16),
}

impl Status {
    /// Decode a wire status code.
    pub const fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => Self::NoError,
            0x0001 => Self::KeyNotFound,
            0x0002 => Self::KeyExists,
            0x0003 => Self::ValueTooLarge,
            0x0004 => Self::InvalidArguments,
            0x0005 => Self::ItemNotStored,
            0x0006 => Self::NonNumeric,
            0x0081 => Self::UnknownCommand,
            0x0082 => Self::OutOfMemory,
            0x0083 => Self::NotSupported,
            0x0084 => Self::InternalError,
            0x0085 => Self::Busy,
            0x0086 => Self::TemporaryFailure,
            other => Self::Other(other),
        }
    }

    /// Returns true for statuses that clear up on their own.
    pub const fn is_temporary(self) -> bool {
        matches!(self, Self::OutOfMemory | Self::Busy | Self::TemporaryFailure)
    }
}

/// Binary protocol header (request or response).
///
/// `status_or_vbucket` is the vbucket id on requests and the status code on
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub status_or_vbucket: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Builds a request header for `opcode` with the given body parts.
    ///
    /// Fails with `Oversize` when the body does not fit the 32-bit length
    /// field, and with `Protocol` for keys or extras beyond their fields.
    pub fn request(
        opcode: Opcode,
        key_len: usize,
        extras_len: usize,
        value_len: usize,
    ) -> McResult<Self> {
        let key = u16::try_from(key_len)
            .map_err(|_| McError::protocol(format!("key length {key_len} exceeds header field")))?;
        let extras = u8::try_from(extras_len).map_err(|_| {
            McError::protocol(format!("extras length {extras_len} exceeds header field"))
        })?;
        let limit = MAX_BODY_LEN - key_len - extras_len;
        if value_len > limit {
            return Err(McError::Oversize {
                declared: value_len,
                limit,
            });
        }

        Ok(Header {
            magic: MAGIC_REQUEST,
            opcode: opcode.as_u8(),
            key_len: key,
            extras_len: extras,
            data_type: DATATYPE_RAW,
            status_or_vbucket: 0,
            body_len: (key_len + extras_len + value_len) as u32,
            opaque: 0,
            cas: 0,
        })
    }

    /// Serializes the header in network byte order.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.magic;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.key_len.to_be_bytes());
        buf[4] = self.extras_len;
        buf[5] = self.data_type;
        buf[6..8].copy_from_slice(&self.status_or_vbucket.to_be_bytes());
        buf[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
        buf
    }

    /// Parses a header from network byte order.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Header {
            magic: buf[0],
            opcode: buf[1],
            key_len: u16::from_be_bytes([buf[2], buf[3]]),
            extras_len: buf[4],
            data_type: buf[5],
            status_or_vbucket: u16::from_be_bytes([buf[6], buf[7]]),
            body_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        }
    }

    /// Response status (meaningful on responses only).
    pub fn status(&self) -> Status {
        Status::from_u16(self.status_or_vbucket)
    }

    /// Length of the value section implied by the header.
    ///
    /// Returns `None` when key + extras claim more than the whole body.
    pub fn value_len(&self) -> Option<usize> {
        (self.body_len as usize).checked_sub(self.key_len as usize + self.extras_len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        let opcodes = [
            Opcode::Get,
            Opcode::Set,
            Opcode::Add,
            Opcode::Replace,
            Opcode::Delete,
            Opcode::Increment,
            Opcode::Decrement,
            Opcode::Flush,
            Opcode::Noop,
            Opcode::Version,
            Opcode::GetK,
            Opcode::GetKQ,
            Opcode::Append,
            Opcode::Prepend,
            Opcode::Stat,
            Opcode::Touch,
        ];

        for op in opcodes {
            assert_eq!(Opcode::from_u8(op.as_u8()), Some(op));
        }
        assert_eq!(Opcode::from_u8(0xff), None);
    }

    #[test]
    fn test_touch_request_header_bytes() {
        // TOUCH with 4B extras and a 3B key.
        let header = Header::request(Opcode::Touch, 3, 4, 0).unwrap();
        let bytes = header.encode();
        assert_eq!(bytes[0], MAGIC_REQUEST);
        assert_eq!(bytes[1], 0x1c);
        assert_eq!(&bytes[2..4], &[0, 3]);
        assert_eq!(bytes[4], 4);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_request_rejects_lengths_beyond_header_fields() {
        let result = Header::request(Opcode::Set, 3, 8, MAX_BODY_LEN - 10);
        assert!(matches!(
            result,
            Err(McError::Oversize { declared, limit })
                if declared == MAX_BODY_LEN - 10 && limit == MAX_BODY_LEN - 11
        ));
        assert!(Header::request(Opcode::Set, 3, 8, MAX_BODY_LEN - 11).is_ok());

        assert!(matches!(
            Header::request(Opcode::Get, 70_000, 0, 0),
            Err(McError::Protocol(_))
        ));
        assert!(matches!(
            Header::request(Opcode::Get, 3, 300, 0),
            Err(McError::Protocol(_))
        ));
    }

    #[test]
    fn test_header_decode() {
        let mut raw = Header::request(Opcode::GetK, 5, 4, 10).unwrap().encode();
        raw[0] = MAGIC_RESPONSE;
        raw[7] = 0x01;
        let header = Header::decode(&raw);
        assert_eq!(header.status(), Status::KeyNotFound);
        assert_eq!(header.value_len(), Some(10));
    }

    #[test]
    fn test_value_len_rejects_inconsistent_body() {
        let header = Header {
            key_len: 10,
            extras_len: 4,
            body_len: 8,
            ..Header::default()
        };
        assert_eq!(header.value_len(), None);
    }

    #[test]
    fn test_status_classification() {
        assert!(Status::from_u16(0x0085).is_temporary());
        assert!(Status::from_u16(0x0086).is_temporary());
        assert!(Status::from_u16(0x0082).is_temporary());
        assert!(!Status::from_u16(0x0084).is_temporary());
        assert_eq!(Status::from_u16(0x7777), Status::Other(0x7777));
    }
}
