//! Client packets and pipeline message records.

use bytes::Bytes;

use super::{ChannelId, ChannelType, ConnId, DeviceId, NodeId, ReasonCode, Uid};

/// Framer flags carried by every client packet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Framer {
    pub red_dot: bool,
    pub sync_once: bool,
    pub no_persist: bool,
}

/// A publish packet as decoded by the client protocol layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendPacket {
    pub framer: Framer,
    pub client_seq: u64,
    pub client_msg_no: String,
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
    pub expire: u32,
    pub payload: Bytes,
}

/// One inbound message inside a channel's pipeline.
///
/// `index` is assigned by the owning channel when the message enters its
/// receive queue and is strictly monotonic per channel. `message_id` is
/// assigned by the ingest layer before the reactor sees the message;
/// `message_seq` stays zero until the storage stage copies the store-assigned
/// sequence back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMessage {
    pub message_id: i64,
    pub message_seq: u32,
    pub index: u64,
    pub from_uid: Uid,
    pub from_device_id: DeviceId,
    pub from_node_id: NodeId,
    pub from_conn_id: ConnId,
    pub is_encrypt: bool,
    pub packet: SendPacket,
}

/// Acknowledgement returned to the publisher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendackPacket {
    pub framer: Framer,
    pub message_id: i64,
    pub message_seq: u32,
    pub client_seq: u64,
    pub client_msg_no: String,
    pub reason_code: ReasonCode,
}

/// Channel descriptor as held by the store.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub ban: bool,
    pub disband: bool,
}

/// The record handed to the durable log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub framer: Framer,
    pub message_id: i64,
    pub client_msg_no: String,
    pub client_seq: u64,
    pub from_uid: Uid,
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
    pub expire: u32,
    pub timestamp: i64,
    pub payload: Bytes,
}

/// Per-message result of a durable append.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AppendResult {
    pub log_id: i64,
    pub log_index: u32,
}
