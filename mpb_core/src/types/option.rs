use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

/// Length of the per-session key material in bytes.
pub const KEY_LEN: usize = 8;

/// Key material exchanged on the key-exchange carrier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub [u8; KEY_LEN]);

impl SessionKey {
    /// Fresh random key for a new session.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for SessionKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

// Key material stays out of logs.
impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Multipath handshake option carried in the transport's extension fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MpOption {
    /// Sent on the key-exchange carrier.
    Key(SessionKey),
    /// Sent on joining subflows: the token of the session joined plus a
    /// per-subflow nonce.
    Join { token: u32, nonce: u32 },
}

impl MpOption {
    pub fn join(token: u32) -> Self {
        MpOption::Join {
            token,
            nonce: OsRng.next_u32(),
        }
    }
}
