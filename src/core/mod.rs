//! Domain atoms shared by the reactor and consensus subsystems.
//!
//! Identity newtypes, client packets, pipeline messages, and reason codes.
//! Everything here is plain data; behavior lives in `reactor` and
//! `consensus`.

mod identity;
mod message;
mod reason;

pub use identity::{ChannelId, ChannelKey, ChannelType, ConnId, DeviceId, NodeId, Uid};
pub use message::{
    AppendResult, ChannelInfo, Framer, PendingMessage, SendPacket, SendackPacket, StoredMessage,
};
pub use reason::{Reason, ReasonCode};
