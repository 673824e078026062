//! Per-channel pipeline state machine.
//!
//! A channel shepherds inbound messages through decrypt, leader forwarding or
//! permission checking, storage, acknowledgement, and delivery. The machine
//! is pure: `ready()` stages typed requests, `step()` applies response
//! actions, `tick()` advances timers. All I/O happens in the stage workers.

use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use crate::core::{
    ChannelId, ChannelInfo, ChannelKey, ChannelType, PendingMessage, NodeId, Reason, ReasonCode,
    Uid,
};

use super::ReactorOptions;
use super::action::{ActionKind, ChannelAction, ChannelRef, Outbound, StageRequest};
use super::tag::TagSlot;
use crate::metrics;

/// Channel lifecycle status. Advances monotonically; only removal resets it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    Uninitialized,
    Initializing,
    Initialized,
}

/// Pipeline stage of the in-flight batch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stage {
    Decrypt,
    Forward,
    Permission,
    Storage,
    Sendack,
    Deliver,
}

/// One batch moving through the pipeline. At most one exists per channel,
/// and at most one stage request of it is outstanding at any time.
struct Batch {
    messages: Vec<PendingMessage>,
    stage: Stage,
    inflight: bool,
    // set on stage error; the next tick re-arms the batch
    await_tick: bool,
    retries: u32,
    verdict: ReasonCode,
}

impl Batch {
    fn new(messages: Vec<PendingMessage>) -> Self {
        Self {
            messages,
            stage: Stage::Decrypt,
            inflight: false,
            await_tick: false,
            retries: 0,
            verdict: ReasonCode::Success,
        }
    }

    fn end_index(&self) -> u64 {
        self.messages.last().map(|m| m.index).unwrap_or(0)
    }
}

pub struct Channel {
    channel_id: ChannelId,
    channel_type: ChannelType,
    key: ChannelKey,
    unique_no: Uuid,
    status: ChannelStatus,
    info: ChannelInfo,
    leader_id: NodeId,
    tag: Arc<TagSlot>,
    pending: VecDeque<PendingMessage>,
    next_index: u64,
    batch: Option<Batch>,
    init_fails: u32,
    init_backoff_ticks: u32,
    check_tag_elapsed: u32,
    idle_elapsed: u32,
    check_tag_staged: bool,
    close_staged: bool,
    opts: Arc<ReactorOptions>,
}

impl Channel {
    pub fn new(
        channel_id: ChannelId,
        channel_type: ChannelType,
        opts: Arc<ReactorOptions>,
    ) -> Self {
        let key = ChannelKey::new(&channel_id, channel_type);
        Self {
            channel_id,
            channel_type,
            key,
            unique_no: Uuid::new_v4(),
            status: ChannelStatus::Uninitialized,
            info: ChannelInfo::default(),
            leader_id: NodeId::NONE,
            tag: Arc::new(TagSlot::new()),
            pending: VecDeque::new(),
            next_index: 0,
            batch: None,
            init_fails: 0,
            init_backoff_ticks: 0,
            check_tag_elapsed: 0,
            idle_elapsed: 0,
            check_tag_staged: false,
            close_staged: false,
            opts,
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn unique_no(&self) -> Uuid {
        self.unique_no
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn leader_id(&self) -> NodeId {
        self.leader_id
    }

    fn make_ref(&self) -> ChannelRef {
        ChannelRef {
            channel_id: self.channel_id.clone(),
            channel_type: self.channel_type,
            key: self.key.clone(),
            unique_no: self.unique_no,
            info: self.info,
            tag: Arc::clone(&self.tag),
        }
    }

    fn is_leader(&self) -> bool {
        self.leader_id == self.opts.node_id
    }

    pub fn has_ready(&self) -> bool {
        if self.close_staged {
            return true;
        }
        match self.status {
            ChannelStatus::Uninitialized => {
                self.init_backoff_ticks == 0
                    && (!self.pending.is_empty() || self.batch.is_some() || self.init_fails == 0)
            }
            ChannelStatus::Initializing => false,
            ChannelStatus::Initialized => {
                if self.check_tag_staged {
                    return true;
                }
                match &self.batch {
                    Some(batch) => !batch.inflight && !batch.await_tick,
                    None => !self.pending.is_empty(),
                }
            }
        }
    }

    pub fn ready(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        if self.close_staged {
            self.close_staged = false;
            out.push(Outbound {
                ch: self.make_ref(),
                request: StageRequest::Close,
            });
            return out;
        }
        match self.status {
            ChannelStatus::Uninitialized => {
                if self.init_backoff_ticks == 0 {
                    self.status = ChannelStatus::Initializing;
                    out.push(Outbound {
                        ch: self.make_ref(),
                        request: StageRequest::Init,
                    });
                }
            }
            ChannelStatus::Initializing => {}
            ChannelStatus::Initialized => {
                if self.check_tag_staged {
                    self.check_tag_staged = false;
                    out.push(Outbound {
                        ch: self.make_ref(),
                        request: StageRequest::CheckTag,
                    });
                }
                self.promote_pending();
                if let Some(request) = self.next_stage_request() {
                    out.push(Outbound {
                        ch: self.make_ref(),
                        request,
                    });
                }
            }
        }
        out
    }

    /// Starts a new batch when none is in flight: the longest prefix of the
    /// receive queue from a single sender, so one permission verdict covers
    /// the whole batch.
    fn promote_pending(&mut self) {
        if self.batch.is_some() || self.pending.is_empty() {
            return;
        }
        let first_uid = self.pending[0].from_uid.clone();
        let mut messages = Vec::new();
        while let Some(front) = self.pending.front() {
            if front.from_uid != first_uid {
                break;
            }
            messages.push(self.pending.pop_front().expect("front checked"));
        }
        self.batch = Some(Batch::new(messages));
    }

    fn next_stage_request(&mut self) -> Option<StageRequest> {
        let leader_is_local = self.is_leader();
        let leader_id = self.leader_id;
        let tag_key = self.tag.load();
        let batch = self.batch.as_mut()?;
        if batch.inflight || batch.await_tick {
            return None;
        }
        // a leader change may have landed since the fork was taken
        if batch.stage == Stage::Forward && leader_is_local {
            batch.stage = Stage::Permission;
        }
        let request = match batch.stage {
            Stage::Decrypt => StageRequest::Decrypt {
                messages: batch.messages.clone(),
            },
            Stage::Forward => StageRequest::Forward {
                leader_id,
                messages: batch.messages.clone(),
            },
            Stage::Permission => StageRequest::Permission {
                from_uid: batch
                    .messages
                    .first()
                    .map(|m| m.from_uid.clone())
                    .unwrap_or_default(),
                messages: batch.messages.clone(),
            },
            Stage::Storage => StageRequest::Storage {
                messages: batch.messages.clone(),
            },
            Stage::Sendack => StageRequest::Sendack {
                reason_code: batch.verdict,
                messages: batch.messages.clone(),
            },
            Stage::Deliver => StageRequest::Deliver {
                tag_key,
                messages: batch.messages.clone(),
            },
        };
        batch.inflight = true;
        Some(request)
    }

    pub fn step(&mut self, action: ChannelAction) {
        match action.kind {
            ActionKind::Inbound { messages } => self.accept(messages),
            ActionKind::InitResp {
                reason,
                leader_id,
                info,
            } => self.on_init_resp(reason, leader_id, info),
            ActionKind::DecryptResp {
                reason,
                index,
                messages,
            } => {
                if reason.is_success() {
                    self.advance(Stage::Decrypt, index, Some(messages), None);
                } else {
                    self.fail_stage(Stage::Decrypt, index);
                }
            }
            ActionKind::ForwardResp { reason, index } => {
                if reason.is_success() {
                    self.advance(Stage::Forward, index, None, None);
                } else {
                    self.fail_stage(Stage::Forward, index);
                }
            }
            ActionKind::PermissionResp {
                reason,
                index,
                reason_code,
            } => {
                if reason.is_success() {
                    self.advance(Stage::Permission, index, None, Some(reason_code));
                } else {
                    self.fail_stage(Stage::Permission, index);
                }
            }
            ActionKind::StorageResp {
                reason,
                index,
                messages,
            } => {
                if reason.is_success() {
                    self.advance(Stage::Storage, index, Some(messages), None);
                } else {
                    self.fail_stage(Stage::Storage, index);
                }
            }
            ActionKind::SendackResp { reason, index } => {
                if reason.is_success() {
                    self.advance(Stage::Sendack, index, None, None);
                } else {
                    self.fail_stage(Stage::Sendack, index);
                }
            }
            ActionKind::DeliverResp { reason: _, index } => {
                // delivery is best-effort and never fails the pipeline
                self.advance(Stage::Deliver, index, None, None);
            }
            ActionKind::LeaderChange { leader_id } => {
                tracing::info!(
                    channel = %self.key,
                    old = %self.leader_id,
                    new = %leader_id,
                    "channel leader change"
                );
                self.leader_id = leader_id;
            }
        }
    }

    fn accept(&mut self, messages: Vec<PendingMessage>) {
        let in_batch = self.batch.as_ref().map(|b| b.messages.len()).unwrap_or(0);
        for mut msg in messages {
            if self.pending.len() + in_batch >= self.opts.max_pending_messages {
                metrics::channel_msg_dropped(self.key.as_str());
                tracing::warn!(
                    channel = %self.key,
                    cap = self.opts.max_pending_messages,
                    "receive queue full, dropping message"
                );
                continue;
            }
            self.next_index += 1;
            msg.index = self.next_index;
            self.pending.push_back(msg);
        }
        self.idle_elapsed = 0;
        self.close_staged = false;
    }

    fn on_init_resp(
        &mut self,
        reason: Reason,
        leader_id: Option<NodeId>,
        info: Option<ChannelInfo>,
    ) {
        if self.status != ChannelStatus::Initializing {
            tracing::debug!(channel = %self.key, "init resp outside initializing, ignored");
            return;
        }
        if let Some(leader_id) = leader_id {
            self.leader_id = leader_id;
        }
        if let Some(info) = info {
            self.info = info;
        }
        if reason.is_success() && leader_id.is_some() {
            self.status = ChannelStatus::Initialized;
            self.init_fails = 0;
            self.init_backoff_ticks = 0;
        } else {
            self.status = ChannelStatus::Uninitialized;
            self.init_fails += 1;
            self.init_backoff_ticks = 1u32 << self.init_fails.min(5);
            tracing::warn!(
                channel = %self.key,
                fails = self.init_fails,
                backoff_ticks = self.init_backoff_ticks,
                "channel init failed"
            );
        }
    }

    fn advance(
        &mut self,
        stage: Stage,
        index: u64,
        messages: Option<Vec<PendingMessage>>,
        verdict: Option<ReasonCode>,
    ) {
        let leader_is_local = self.is_leader();
        let Some(batch) = self.batch.as_mut() else {
            tracing::debug!(channel = %self.key, ?stage, "stage resp without batch, ignored");
            return;
        };
        if batch.stage != stage || !batch.inflight || batch.end_index() != index {
            tracing::debug!(
                channel = %self.key,
                ?stage,
                index,
                "mismatched stage resp, ignored"
            );
            return;
        }
        batch.inflight = false;
        batch.retries = 0;
        if let Some(messages) = messages {
            batch.messages = messages;
        }
        if let Some(verdict) = verdict {
            batch.verdict = verdict;
        }
        let next = match stage {
            Stage::Decrypt => Some(if leader_is_local {
                Stage::Permission
            } else {
                Stage::Forward
            }),
            // the leader stores, acks, and delivers; forwarding ends the
            // batch on this node
            Stage::Forward => None,
            Stage::Permission => Some(if batch.verdict.is_success() {
                Stage::Storage
            } else {
                Stage::Sendack
            }),
            Stage::Storage => Some(Stage::Sendack),
            Stage::Sendack => {
                if batch.verdict.is_success() {
                    Some(Stage::Deliver)
                } else {
                    None
                }
            }
            Stage::Deliver => None,
        };
        match next {
            Some(next) => batch.stage = next,
            None => self.complete_batch(),
        }
    }

    fn fail_stage(&mut self, stage: Stage, index: u64) {
        let max_retries = self.opts.max_stage_retries;
        let key = self.key.clone();
        let Some(batch) = self.batch.as_mut() else {
            return;
        };
        if batch.stage != stage || !batch.inflight || batch.end_index() != index {
            return;
        }
        batch.inflight = false;
        batch.retries += 1;
        if batch.retries > max_retries {
            metrics::channel_batch_abandoned(key.as_str(), stage_name(stage));
            tracing::warn!(
                channel = %key,
                stage = stage_name(stage),
                retries = batch.retries,
                "stage retries exhausted, abandoning batch"
            );
            if stage == Stage::Sendack {
                // cannot even tell the client; drop the batch outright
                self.complete_batch();
            } else {
                batch.verdict = ReasonCode::SystemError;
                batch.stage = Stage::Sendack;
                batch.retries = 0;
                batch.await_tick = true;
            }
        } else {
            batch.await_tick = true;
        }
    }

    fn complete_batch(&mut self) {
        self.batch = None;
        self.idle_elapsed = 0;
    }

    pub fn tick(&mut self) {
        if self.init_backoff_ticks > 0 {
            self.init_backoff_ticks -= 1;
        }
        if let Some(batch) = self.batch.as_mut() {
            batch.await_tick = false;
        }
        if self.status == ChannelStatus::Initialized {
            self.check_tag_elapsed += 1;
            if self.check_tag_elapsed >= self.opts.check_tag_interval_ticks {
                self.check_tag_elapsed = 0;
                self.check_tag_staged = true;
            }
        }
        if self.batch.is_none() && self.pending.is_empty() {
            self.idle_elapsed += 1;
            if self.idle_elapsed >= self.opts.idle_timeout_ticks {
                self.idle_elapsed = 0;
                self.close_staged = true;
            }
        }
    }
}

fn stage_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Decrypt => "decrypt",
        Stage::Forward => "forward",
        Stage::Permission => "permission",
        Stage::Storage => "storage",
        Stage::Sendack => "sendack",
        Stage::Deliver => "deliver",
    }
}
