pub mod packet;
pub mod option;

pub use packet::{Packet, PacketType};
pub use option::{MpOption, SessionKey, KEY_LEN};

use serde::{Deserialize, Serialize};

/// Which side of the multipath session this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Dials subflows out.
    Initiator,
    /// Listens and accepts subflows in.
    Responder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
