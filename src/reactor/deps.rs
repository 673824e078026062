//! Collaborator seams.
//!
//! The reactor core sequences work across these services but owns none of
//! them: cluster routing and RPC, the durable message log, the connection
//! registry, the tag manager, and delivery fan-out. Implementations must be
//! internally thread-safe; they are shared across all shards and workers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{
    AppendResult, ChannelId, ChannelInfo, ChannelType, ConnId, NodeId, PendingMessage,
    SendackPacket, StoredMessage, Uid,
};

use super::tag::{ReceiverTag, TagKey};

/// Inter-node RPC path for forwarding a message batch to the channel leader.
/// The typo is load-bearing: it is the wire path peers dispatch on.
pub const PATH_CHANNEL_FORWARD: &str = "/wk/channelFoward";
/// Inter-node RPC path for returning sendacks to the nodes holding the
/// publishers' connections.
pub const PATH_FORWARD_SENDACK: &str = "/wk/forwardSendack";

/// RPC status values interpreted by the core. Everything else is opaque.
pub const STATUS_OK: u32 = 1;
pub const STATUS_NOT_CHANNEL_LEADER: u32 = 1002;

#[derive(Clone, Debug)]
pub struct RpcResponse {
    pub status: u32,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
    #[error("node {0} unreachable")]
    Unreachable(NodeId),
    #[error("remote error: {0}")]
    Remote(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
    #[error("store io: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection {conn_id} of {uid} not found")]
    NotFound { uid: Uid, conn_id: ConnId },
    #[error("decrypt failed: {0}")]
    Decrypt(String),
    #[error("write failed: {0}")]
    Write(String),
}

#[derive(Debug, Error)]
pub enum TagError {
    #[error("tag build failed: {0}")]
    Build(String),
}

/// Slot/leader resolution and uniform inter-node RPC.
pub trait Router: Send + Sync {
    /// Authoritative leader lookup; may round-trip inside the cluster.
    fn leader_of_channel(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        timeout: Duration,
    ) -> Result<NodeId, RpcError>;

    /// Fast leader lookup from the local view.
    fn leader_id_of_channel(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        timeout: Duration,
    ) -> Result<NodeId, RpcError>;

    /// Local membership view; no round-trip.
    fn node_is_online(&self, node_id: NodeId) -> bool;

    /// Slot leader for a uid's personal channel; used for tag validation.
    fn slot_leader_id_of_channel(
        &self,
        uid: &Uid,
        channel_type: ChannelType,
    ) -> Result<NodeId, RpcError>;

    fn request(
        &self,
        node_id: NodeId,
        path: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<RpcResponse, RpcError>;
}

/// Durable message log plus the permission lookups backed by the same store.
pub trait MessageStore: Send + Sync {
    fn channel_info(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
    ) -> Result<ChannelInfo, StoreError>;

    /// Appends in input order. Returns one result per appended record; the
    /// store echoes the caller-assigned `message_id` as `log_id`.
    fn append_messages(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        messages: Vec<StoredMessage>,
        timeout: Duration,
    ) -> Result<Vec<AppendResult>, StoreError>;

    fn exist_denylist(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        uid: &Uid,
    ) -> Result<bool, StoreError>;

    fn exist_subscriber(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        uid: &Uid,
    ) -> Result<bool, StoreError>;

    fn has_allowlist(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
    ) -> Result<bool, StoreError>;

    fn exist_allowlist(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        uid: &Uid,
    ) -> Result<bool, StoreError>;
}

/// Client connections held by this node.
pub trait ConnectionRegistry: Send + Sync {
    /// Decrypts a packet payload with the session key bound to the given
    /// connection. `ConnError::NotFound` means the connection is gone;
    /// the caller leaves the message encrypted.
    fn decrypt_payload(
        &self,
        uid: &Uid,
        conn_id: ConnId,
        payload: &Bytes,
    ) -> Result<Bytes, ConnError>;

    /// Writes a sendack directly to a locally-held connection.
    fn write_sendack(
        &self,
        uid: &Uid,
        conn_id: ConnId,
        packet: SendackPacket,
    ) -> Result<(), ConnError>;
}

/// Builds and caches receiver tags.
pub trait TagManager: Send + Sync {
    fn make_receiver_tag(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
    ) -> Result<ReceiverTag, TagError>;

    fn receiver_tag(&self, key: &TagKey) -> Option<ReceiverTag>;
}

/// Fan-out delivery request handed off after storage + sendack.
#[derive(Clone)]
pub struct DeliverRequest {
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
    pub tag_key: Option<TagKey>,
    pub messages: Vec<PendingMessage>,
}

/// Subscriber session fan-out. Best-effort: delivery never fails the
/// pipeline.
pub trait DeliverManager: Send + Sync {
    fn deliver(&self, req: DeliverRequest);
}

/// Bundle of collaborator handles shared by every worker.
#[derive(Clone)]
pub struct Deps {
    pub router: Arc<dyn Router>,
    pub store: Arc<dyn MessageStore>,
    pub conns: Arc<dyn ConnectionRegistry>,
    pub tags: Arc<dyn TagManager>,
    pub deliver: Arc<dyn DeliverManager>,
}
