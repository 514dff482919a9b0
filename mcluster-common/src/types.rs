//! # Key/Item Type Definitions
//!
//! Core data types for cache entries as they travel between the caller and
//! the cluster.
//!
//! ## Design Principles
//!
//! 1. **Protocol Key Limits**: Keys are capped at 250 bytes (the memcached
//!    limit, prefix included) and validated before any socket work happens.
//!
//! 2. **Owned Values**: Items own their bytes once read off the wire, so no
//!    buffer is aliased between requests.
//!
//! 3. **Flags Travel With Data**: The 32-bit flags word and CAS token are part
//!    of the item, not side channels.
//!
//! 4. **Relative vs Absolute Expiry**: TTLs longer than 30 days are sent as
//!    absolute unix timestamps, matching server semantics.
//!
//! ## Wire Mapping Example
//!
//! ```text
//! text:   VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\n
//! binary: header:24B | extras(flags):4B | key | data
//! ```

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{McError, McResult};
use crate::protocol::ProtocolVariant;

/// Maximum key size in bytes, prefix included.
pub const MAX_KEY_LENGTH: usize = 250;

/// Largest relative expiration the server accepts (30 days).
pub const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

/// Validates a wire key for the given framing.
///
/// # Errors
/// - `McError::InvalidKey` for empty keys, or keys with whitespace/control
///   bytes under text framing.
/// - `McError::KeyTooLong` if the key exceeds `MAX_KEY_LENGTH`.
///
/// # Examples
/// ```rust
/// use mcluster_common::{validate_key, McError, ProtocolVariant};
///
/// assert!(validate_key(b"alpha", ProtocolVariant::Text).is_ok());
/// assert!(matches!(validate_key(b"a b", ProtocolVariant::Text), Err(McError::InvalidKey)));
/// assert!(validate_key(b"a b", ProtocolVariant::Binary).is_ok());
/// ```
pub fn validate_key(key: &[u8], variant: ProtocolVariant) -> McResult<()> {
    if key.is_empty() {
        return Err(McError::InvalidKey);
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(McError::KeyTooLong);
    }
    if variant == ProtocolVariant::Text && key.iter().any(|&b| b <= b' ' || b == 0x7f) {
        return Err(McError::InvalidKey);
    }
    Ok(())
}

/// One cache entry as returned by a retrieval.
#[derive(Clone, PartialEq, Eq)]
pub struct Item {
    /// Key as the caller addressed it (prefix stripped).
    pub key: Vec<u8>,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Client-defined flags word stored alongside the value.
    pub flags: u32,
    /// CAS token, 0 when the server did not send one.
    pub cas: u64,
}

impl Item {
    /// Creates an item without a CAS token.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, flags: u32) -> Self {
        Item {
            key: key.into(),
            value: value.into(),
            flags,
            cas: 0,
        }
    }

    /// Returns the value length.
    #[inline]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Returns true if the value is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = String::from_utf8_lossy(&self.key);
        if self.value.len() <= 32 {
            write!(
                f,
                "Item({key:?} => {:?}, flags={}, cas={})",
                String::from_utf8_lossy(&self.value),
                self.flags,
                self.cas
            )
        } else {
            write!(f, "Item({key:?} => {}B, flags={}, cas={})", self.value.len(), self.flags, self.cas)
        }
    }
}

/// Expiration time sent with storage and touch commands.
///
/// Stored as whole seconds. `Ttl::NEVER` (0) means the item does not expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ttl(pub u64);

impl Ttl {
    /// No expiration.
    pub const NEVER: Ttl = Ttl(0);

    /// Creates a TTL from whole seconds.
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Ttl(secs)
    }

    /// Creates a TTL from a duration, truncating sub-second precision.
    #[inline]
    pub fn from_duration(duration: Duration) -> Self {
        Ttl(duration.as_secs())
    }

    /// Returns the TTL in seconds.
    #[inline]
    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Returns the 32-bit exptime the server expects.
    ///
    /// Values beyond 30 days are converted to an absolute unix timestamp.
    pub fn to_wire(&self) -> u32 {
        if self.0 <= MAX_RELATIVE_EXPIRATION {
            return self.0 as u32;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        now.saturating_add(self.0).min(u32::MAX as u64) as u32
    }
}

/// Storage command flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMode {
    /// Store unconditionally.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
    /// Append data to an existing value.
    Append,
    /// Prepend data to an existing value.
    Prepend,
    /// Store only if the CAS token still matches.
    Cas(u64),
}

impl StoreMode {
    /// Text protocol verb for this mode.
    pub const fn verb(self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
            StoreMode::Cas(_) => "cas",
        }
    }
}

/// Outcome of a storage command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// Value stored.
    Stored,
    /// Add/replace/append precondition failed.
    NotStored,
    /// CAS token mismatch.
    Exists,
    /// CAS target is missing.
    NotFound,
}

impl StoreStatus {
    /// Returns true when the value was written.
    pub fn is_stored(self) -> bool {
        self == StoreStatus::Stored
    }
}

/// Outcome of a touch command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchStatus {
    /// Expiration updated.
    Touched,
    /// Key does not exist.
    NotFound,
}
