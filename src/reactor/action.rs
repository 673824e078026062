//! Actions flowing between shards, channels, and stage workers.
//!
//! Two directions:
//! - [`ChannelAction`] travels *into* a channel through its shard's action
//!   queue: inbound messages, stage responses, leader changes.
//! - [`Outbound`] is what `Channel::ready` stages *out*: one typed request
//!   per stage, plus the channel snapshot the worker needs to do its work
//!   and to route the response back by key hash.

use std::sync::Arc;

use uuid::Uuid;

use crate::core::{
    ChannelId, ChannelInfo, ChannelKey, ChannelType, NodeId, PendingMessage, Reason, ReasonCode,
    Uid,
};

use super::tag::{TagKey, TagSlot};

/// Cheap snapshot of a channel handed to stage workers.
///
/// Workers never hold references into shard state; they carry this snapshot
/// and resolve the owning shard by hashing `key` when responding.
#[derive(Clone)]
pub struct ChannelRef {
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
    pub key: ChannelKey,
    pub unique_no: Uuid,
    pub info: ChannelInfo,
    pub tag: Arc<TagSlot>,
}

/// A staged stage request together with its channel snapshot.
#[derive(Clone)]
pub struct Outbound {
    pub ch: ChannelRef,
    pub request: StageRequest,
}

/// One request per pipeline stage.
#[derive(Clone)]
pub enum StageRequest {
    Init,
    Decrypt {
        messages: Vec<PendingMessage>,
    },
    Forward {
        leader_id: NodeId,
        messages: Vec<PendingMessage>,
    },
    Permission {
        from_uid: Uid,
        messages: Vec<PendingMessage>,
    },
    Storage {
        messages: Vec<PendingMessage>,
    },
    Sendack {
        reason_code: ReasonCode,
        messages: Vec<PendingMessage>,
    },
    Deliver {
        tag_key: Option<TagKey>,
        messages: Vec<PendingMessage>,
    },
    CheckTag,
    Close,
}

impl StageRequest {
    pub fn stage_name(&self) -> &'static str {
        match self {
            StageRequest::Init => "init",
            StageRequest::Decrypt { .. } => "decrypt",
            StageRequest::Forward { .. } => "forward",
            StageRequest::Permission { .. } => "permission",
            StageRequest::Storage { .. } => "storage",
            StageRequest::Sendack { .. } => "sendack",
            StageRequest::Deliver { .. } => "deliver",
            StageRequest::CheckTag => "check_tag",
            StageRequest::Close => "close",
        }
    }
}

/// An action injected into a channel via its shard.
///
/// `unique_no` is `None` for ingress actions (they apply to whatever
/// incarnation currently owns the key) and `Some` for stage responses, which
/// are dropped when the incarnation has changed.
#[derive(Clone, Debug)]
pub struct ChannelAction {
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
    pub unique_no: Option<Uuid>,
    pub kind: ActionKind,
}

impl ChannelAction {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(&self.channel_id, self.channel_type)
    }
}

#[derive(Clone, Debug)]
pub enum ActionKind {
    /// New messages entering the channel: local publishes or messages
    /// forwarded from a non-leader node. `index` fields are assigned by the
    /// channel on acceptance.
    Inbound { messages: Vec<PendingMessage> },
    InitResp {
        reason: Reason,
        leader_id: Option<NodeId>,
        info: Option<ChannelInfo>,
    },
    DecryptResp {
        reason: Reason,
        index: u64,
        messages: Vec<PendingMessage>,
    },
    ForwardResp {
        reason: Reason,
        index: u64,
    },
    PermissionResp {
        reason: Reason,
        index: u64,
        reason_code: ReasonCode,
    },
    StorageResp {
        reason: Reason,
        index: u64,
        messages: Vec<PendingMessage>,
    },
    SendackResp {
        reason: Reason,
        index: u64,
    },
    DeliverResp {
        reason: Reason,
        index: u64,
    },
    LeaderChange { leader_id: NodeId },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Inbound { .. } => "inbound",
            ActionKind::InitResp { .. } => "init_resp",
            ActionKind::DecryptResp { .. } => "decrypt_resp",
            ActionKind::ForwardResp { .. } => "forward_resp",
            ActionKind::PermissionResp { .. } => "permission_resp",
            ActionKind::StorageResp { .. } => "storage_resp",
            ActionKind::SendackResp { .. } => "sendack_resp",
            ActionKind::DeliverResp { .. } => "deliver_resp",
            ActionKind::LeaderChange { .. } => "leader_change",
        }
    }
}
