//! Session token derivation.
//!
//! A token is the first 32-bit word of SHA-1 over one 64-byte block: the
//! two 8-byte keys, a single `0x80` end-of-message byte, zero fill, and
//! `0x80` in the final byte. That block is exactly the standard SHA-1
//! padding of a 16-byte message, so a regular digest of the 16 key bytes
//! performs the single compression and yields the same state word.

use sha1::{Digest, Sha1};

use crate::types::SessionKey;

/// Derive the token of `key_a` as seen against `key_b`. Order matters.
pub fn derive_token(key_a: &SessionKey, key_b: &SessionKey) -> u32 {
    let mut hasher = Sha1::new();
    hasher.update(key_a.as_bytes());
    hasher.update(key_b.as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Both tokens of a session, once key exchange is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPair {
    /// Token a joining peer presents to reach this endpoint.
    pub local: u32,
    /// Token this endpoint presents when it joins the peer.
    pub remote: u32,
}

impl TokenPair {
    pub fn derive(local_key: &SessionKey, remote_key: &SessionKey) -> Self {
        Self {
            local: derive_token(local_key, remote_key),
            remote: derive_token(remote_key, local_key),
        }
    }
}
