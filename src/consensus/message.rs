//! Config consensus message set.

use bytes::Bytes;

use crate::core::NodeId;

/// Event kinds stepped into a [`super::ConfigNode`] or staged in its outbox.
///
/// `Propose`, `Hup`, and `Beat` are local events; the rest travel between
/// replicas. `Sync` and `Apply` are consumed by the host: `Sync` asks the
/// leader for newer config, `Apply` tells the host to persist a newly
/// committed version.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Propose,
    Hup,
    Beat,
    AppendConfig,
    AppendConfigResp,
    VoteRequest,
    VoteResponse,
    Sync,
    Apply,
    Heartbeat,
    HeartbeatResp,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Propose => "propose",
            MessageKind::Hup => "hup",
            MessageKind::Beat => "beat",
            MessageKind::AppendConfig => "append_config",
            MessageKind::AppendConfigResp => "append_config_resp",
            MessageKind::VoteRequest => "vote_request",
            MessageKind::VoteResponse => "vote_response",
            MessageKind::Sync => "sync",
            MessageKind::Apply => "apply",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::HeartbeatResp => "heartbeat_resp",
        }
    }
}

/// One consensus message. `term` 0 marks local events exempt from the
/// stale-term check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub from: NodeId,
    pub to: NodeId,
    pub term: u32,
    pub config_version: u64,
    pub config_data: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            from: NodeId::NONE,
            to: NodeId::NONE,
            term: 0,
            config_version: 0,
            config_data: Bytes::new(),
        }
    }
}

/// Snapshot of outbound work for the host: transport messages plus any
/// `Sync`/`Apply` the node wants acted on.
#[derive(Clone, Debug, Default)]
pub struct Ready {
    pub messages: Vec<Message>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
