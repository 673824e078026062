//! Shard event loop.
//!
//! A shard owns a disjoint partition of channels and is the only thread that
//! mutates them. The loop interleaves three sources: staged channel actions
//! (`ready`), the shard's inbound action queue, and a jittered ticker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use rand::Rng;

use crate::core::ChannelKey;
use crate::metrics;

use super::ReactorShared;
use super::action::{ActionKind, ChannelAction, StageRequest};
use super::channel::Channel;
use super::queue::ActionQueue;

/// Consecutive ready rounds a shard may run before yielding to its ticker.
const MAX_CONSECUTIVE_READY: u32 = 100;

/// Shared handle to a shard: the only way other threads reach it.
#[derive(Clone)]
pub(crate) struct ShardHandle {
    pub(crate) index: usize,
    queue: ActionQueue,
    advance_tx: Sender<()>,
}

impl ShardHandle {
    pub(crate) fn new(index: usize, capacity: usize) -> (Self, Receiver<()>) {
        let (advance_tx, advance_rx) = crossbeam::channel::bounded(1);
        (
            Self {
                index,
                queue: ActionQueue::new(capacity),
                advance_tx,
            },
            advance_rx,
        )
    }

    /// Enqueues an action for the shard loop. Drops with a warning on
    /// overflow; never blocks.
    pub(crate) fn send(&self, action: ChannelAction) -> bool {
        let added = self.queue.add(action.clone());
        if added {
            self.advance();
        } else {
            metrics::action_dropped(action.kind.name());
            tracing::warn!(
                shard = self.index,
                channel = %action.channel_id,
                channel_type = %action.channel_type,
                action = action.kind.name(),
                "drop action, queue is full"
            );
        }
        added
    }

    fn advance(&self) {
        let _ = self.advance_tx.try_send(());
    }

    pub(crate) fn advance_sender(&self) -> Sender<()> {
        self.advance_tx.clone()
    }

    pub(crate) fn queue(&self) -> ActionQueue {
        self.queue.clone()
    }
}

pub(crate) struct ShardState {
    index: usize,
    channels: HashMap<ChannelKey, Channel>,
    queue: ActionQueue,
    contin_read_event_count: u32,
    scratch_keys: Vec<ChannelKey>,
    scratch_actions: Vec<ChannelAction>,
    shared: Arc<ReactorShared>,
}

impl ShardState {
    pub(crate) fn new(index: usize, queue: ActionQueue, shared: Arc<ReactorShared>) -> Self {
        Self {
            index,
            channels: HashMap::new(),
            queue,
            contin_read_event_count: 0,
            scratch_keys: Vec::new(),
            scratch_actions: Vec::new(),
            shared,
        }
    }

    fn read_events(&mut self) -> bool {
        let mut has_event = self.handle_events();
        if self.handle_received_actions() {
            has_event = true;
        }
        has_event
    }

    fn handle_events(&mut self) -> bool {
        let mut any = false;
        let mut progressed = true;
        while progressed {
            progressed = false;
            self.scratch_keys.clear();
            self.scratch_keys.extend(self.channels.keys().cloned());
            for key in std::mem::take(&mut self.scratch_keys) {
                if self.handle_event(&key) {
                    progressed = true;
                    any = true;
                }
            }
        }
        any
    }

    fn handle_event(&mut self, key: &ChannelKey) -> bool {
        let Some(channel) = self.channels.get_mut(key) else {
            return false;
        };
        if !channel.has_ready() {
            return false;
        }
        let actions = channel.ready();
        if actions.is_empty() {
            return false;
        }
        for out in &actions {
            if matches!(out.request, StageRequest::Close) {
                self.channels.remove(key);
            }
        }
        for out in actions {
            self.shared.dispatch(out);
        }
        true
    }

    fn handle_received_actions(&mut self) -> bool {
        self.scratch_actions.clear();
        let mut actions = std::mem::take(&mut self.scratch_actions);
        self.queue.drain_into(&mut actions);
        if actions.is_empty() {
            self.scratch_actions = actions;
            return false;
        }
        for action in actions.drain(..) {
            let key = action.key();
            let channel = match self.channels.get_mut(&key) {
                Some(channel) => channel,
                None => {
                    // only ingress may create a channel; stale responses for
                    // removed channels fall through here and die
                    if !matches!(action.kind, ActionKind::Inbound { .. }) {
                        continue;
                    }
                    let channel = Channel::new(
                        action.channel_id.clone(),
                        action.channel_type,
                        Arc::clone(&self.shared.opts),
                    );
                    metrics::channel_created();
                    self.channels.entry(key).or_insert(channel)
                }
            };
            if let Some(no) = action.unique_no {
                if no != channel.unique_no() {
                    tracing::debug!(
                        shard = self.index,
                        channel = %action.channel_id,
                        "stale action for previous incarnation, dropped"
                    );
                    continue;
                }
            }
            channel.step(action);
        }
        self.scratch_actions = actions;
        true
    }

    fn tick(&mut self) {
        self.scratch_keys.clear();
        self.scratch_keys.extend(self.channels.keys().cloned());
        let keys = std::mem::take(&mut self.scratch_keys);
        for key in &keys {
            if let Some(channel) = self.channels.get_mut(key) {
                channel.tick();
            }
        }
        self.scratch_keys = keys;
    }

    #[cfg(test)]
    fn channel(&self, key: &ChannelKey) -> Option<&Channel> {
        self.channels.get(key)
    }
}

pub(crate) fn run_shard_loop(
    mut state: ShardState,
    advance_tx: Sender<()>,
    advance_rx: Receiver<()>,
    stop_rx: Receiver<()>,
) {
    let tick_interval = state.shared.opts.tick_interval;
    // independent per-shard jitter so the fleet never ticks in lockstep
    let jitter_ms = {
        let half = (tick_interval / 2).as_millis() as u64;
        if half == 0 {
            0
        } else {
            rand::rng().random_range(0..half)
        }
    };
    let ticker = crossbeam::channel::tick(tick_interval + Duration::from_millis(jitter_ms));

    loop {
        if state.contin_read_event_count < MAX_CONSECUTIVE_READY {
            if state.read_events() {
                state.contin_read_event_count += 1;
                let _ = advance_tx.try_send(());
            }
        } else {
            state.contin_read_event_count = 0;
            tracing::warn!(shard = state.index, "too many consecutive ready rounds");
        }

        crossbeam::select! {
            recv(advance_rx) -> _ => {}
            recv(ticker) -> _ => {
                state.contin_read_event_count = 0;
                state.tick();
            }
            recv(stop_rx) -> _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelId, ChannelType, ConnId, DeviceId, Framer, NodeId, SendPacket, Uid};
    use crate::core::PendingMessage;
    use crate::reactor::action::ActionKind;
    use crate::reactor::workers::stage_channels;
    use crate::reactor::{ReactorOptions, ReactorShared};
    use crate::test_harness::Harness;
    use bytes::Bytes;
    use uuid::Uuid;

    fn inbound_message() -> PendingMessage {
        PendingMessage {
            message_id: 1,
            message_seq: 0,
            index: 0,
            from_uid: Uid::new("u1"),
            from_device_id: DeviceId::new("d1"),
            from_node_id: NodeId::new(1),
            from_conn_id: ConnId::new(0),
            is_encrypt: false,
            packet: SendPacket {
                framer: Framer::default(),
                client_seq: 1,
                client_msg_no: "n1".into(),
                channel_id: ChannelId::new("room"),
                channel_type: ChannelType::Group,
                expire: 0,
                payload: Bytes::from_static(b"hi"),
            },
        }
    }

    struct Fixture {
        state: ShardState,
        handle: ShardHandle,
        // receivers and stop sender must outlive the state or every send
        // sees a disconnected channel
        _stage_rx: crate::reactor::workers::StageReceivers,
        _stop_tx: Sender<()>,
    }

    fn fixture() -> Fixture {
        let harness = Harness::new();
        let (senders, receivers) = stage_channels(16);
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(0);
        let (handle, _advance_rx) = ShardHandle::new(0, 64);
        let shared = Arc::new(ReactorShared {
            opts: Arc::new(ReactorOptions::new(NodeId::new(1))),
            deps: harness.deps(),
            shards: vec![handle.clone()],
            workers: senders,
            stop_rx,
        });
        let state = ShardState::new(0, handle.queue(), shared);
        Fixture {
            state,
            handle,
            _stage_rx: receivers,
            _stop_tx: stop_tx,
        }
    }

    fn key() -> ChannelKey {
        ChannelKey::new(&ChannelId::new("room"), ChannelType::Group)
    }

    #[test]
    fn ingress_creates_the_channel() {
        let mut fx = fixture();
        fx.handle.send(ChannelAction {
            channel_id: ChannelId::new("room"),
            channel_type: ChannelType::Group,
            unique_no: None,
            kind: ActionKind::Inbound {
                messages: vec![inbound_message()],
            },
        });
        assert!(fx.state.handle_received_actions());
        assert!(fx.state.channel(&key()).is_some());
    }

    #[test]
    fn stale_unique_no_never_mutates_channel_state() {
        let mut fx = fixture();
        fx.handle.send(ChannelAction {
            channel_id: ChannelId::new("room"),
            channel_type: ChannelType::Group,
            unique_no: None,
            kind: ActionKind::Inbound {
                messages: vec![inbound_message()],
            },
        });
        fx.state.handle_received_actions();
        let current = fx.state.channel(&key()).expect("channel").unique_no();
        let before = fx.state.channel(&key()).expect("channel").leader_id();

        // previous incarnation's response must be dropped
        fx.handle.send(ChannelAction {
            channel_id: ChannelId::new("room"),
            channel_type: ChannelType::Group,
            unique_no: Some(Uuid::new_v4()),
            kind: ActionKind::LeaderChange {
                leader_id: NodeId::new(42),
            },
        });
        fx.state.handle_received_actions();
        assert_eq!(fx.state.channel(&key()).expect("channel").leader_id(), before);

        // the live incarnation's action applies
        fx.handle.send(ChannelAction {
            channel_id: ChannelId::new("room"),
            channel_type: ChannelType::Group,
            unique_no: Some(current),
            kind: ActionKind::LeaderChange {
                leader_id: NodeId::new(42),
            },
        });
        fx.state.handle_received_actions();
        assert_eq!(
            fx.state.channel(&key()).expect("channel").leader_id(),
            NodeId::new(42)
        );
    }

    #[test]
    fn responses_for_unknown_channels_are_dropped() {
        let mut fx = fixture();
        fx.handle.send(ChannelAction {
            channel_id: ChannelId::new("ghost"),
            channel_type: ChannelType::Group,
            unique_no: Some(Uuid::new_v4()),
            kind: ActionKind::LeaderChange {
                leader_id: NodeId::new(2),
            },
        });
        assert!(fx.state.handle_received_actions());
        assert!(
            fx.state
                .channel(&ChannelKey::new(&ChannelId::new("ghost"), ChannelType::Group))
                .is_none()
        );
    }
}
