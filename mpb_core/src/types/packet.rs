use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Packet types seen on a subflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    Request,
    Response,
    Data,
    Ack,
    DataAck,
    CloseReq,
    Close,
    Reset,
    Sync,
    SyncAck,
}

impl PacketType {
    /// Data-bearing packet types.
    pub fn carries_data(&self) -> bool {
        matches!(self, PacketType::Data | PacketType::DataAck)
    }

    /// Peer-initiated close of the subflow.
    pub fn is_close(&self) -> bool {
        matches!(self, PacketType::Close | PacketType::CloseReq)
    }
}

/// One datagram pulled from, or pushed onto, a subflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::new(PacketType::Data, payload)
    }

    pub fn control(kind: PacketType) -> Self {
        Self::new(kind, Bytes::new())
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
