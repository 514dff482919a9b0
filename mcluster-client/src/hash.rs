//! # Key Hashing
//!
//! Purpose: Map a key to a 32-bit point for node selection, using the same
//! functions other memcached clients use so mixed fleets agree on ownership.

use md5::{Digest, Md5};
use serde::Deserialize;

/// Hash function applied to keys before distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// Bob Jenkins' one-at-a-time hash.
    #[default]
    OneAtATime,
    /// Low 32 bits (little-endian) of the MD5 digest.
    Md5,
    /// 32-bit FNV-1a.
    Fnv1a32,
    /// 64-bit FNV-1a truncated to 32 bits.
    Fnv1a64,
}

impl HashAlgorithm {
    /// Hashes `key` to a 32-bit point.
    pub fn hash(self, key: &[u8]) -> u32 {
        match self {
            HashAlgorithm::OneAtATime => one_at_a_time(key),
            HashAlgorithm::Md5 => {
                let digest = Md5::digest(key);
                u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
            }
            HashAlgorithm::Fnv1a32 => fnv1a_32(key),
            HashAlgorithm::Fnv1a64 => fnv1a_64(key) as u32,
        }
    }
}

fn one_at_a_time(key: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for &b in key {
        value = value.wrapping_add(b as u32);
        value = value.wrapping_add(value << 10);
        value ^= value >> 6;
    }
    value = value.wrapping_add(value << 3);
    value ^= value >> 11;
    value.wrapping_add(value << 15)
}

fn fnv1a_32(key: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    key.iter()
        .fold(OFFSET, |hash, &b| (hash ^ b as u32).wrapping_mul(PRIME))
}

fn fnv1a_64(key: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    key.iter()
        .fold(OFFSET, |hash, &b| (hash ^ b as u64).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(HashAlgorithm::OneAtATime.hash(b"a"), 0xca2e_9442);
        assert_eq!(HashAlgorithm::OneAtATime.hash(b"hello"), 0xc8fd_181b);
        assert_eq!(HashAlgorithm::Fnv1a32.hash(b"a"), 0xe40c_292c);
        assert_eq!(HashAlgorithm::Fnv1a32.hash(b"hello"), 0x4f9f_2cab);
        assert_eq!(HashAlgorithm::Fnv1a64.hash(b"a"), 0x8601_ec8c);
        assert_eq!(HashAlgorithm::Md5.hash(b"a"), 0xb975_c10c);
        assert_eq!(HashAlgorithm::Md5.hash(b"hello"), 0x2a40_415d);
    }

    #[test]
    fn empty_key_hashes() {
        assert_eq!(HashAlgorithm::OneAtATime.hash(b""), 0);
        assert_eq!(HashAlgorithm::Fnv1a32.hash(b""), 0x811c_9dc5);
    }
}
