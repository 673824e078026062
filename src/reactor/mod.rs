//! Channel reactor.
//!
//! Shards own disjoint channel partitions and drive their state machines on
//! single-threaded event loops; stage workers perform the I/O and feed
//! response actions back through the owning shard. See `channel` for the
//! per-channel pipeline and `workers` for stage semantics.

mod action;
mod channel;
mod queue;
mod shard;
mod workers;

pub mod deps;
pub mod proto;
pub mod tag;

pub use action::{ActionKind, ChannelAction, ChannelRef, Outbound, StageRequest};
pub use channel::{Channel, ChannelStatus};
pub use deps::{DeliverRequest, Deps};

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use crate::config::ReactorConfig;
use crate::core::{ChannelId, ChannelKey, ChannelType, NodeId, PendingMessage, Uid};

use shard::{ShardHandle, ShardState, run_shard_loop};
use workers::{
    CheckTagReq, CloseReq, DecryptReq, DeliverReq, ForwardReq, InitReq, PermissionReq,
    SendackReq, StageSenders, StorageReq, stage_channels,
};

/// Runtime options for one reactor instance.
#[derive(Clone, Debug)]
pub struct ReactorOptions {
    pub node_id: NodeId,
    pub shard_count: usize,
    pub tick_interval: Duration,
    pub action_queue_capacity: usize,
    pub worker_queue_capacity: usize,
    pub max_pending_messages: usize,
    pub max_stage_retries: u32,
    pub check_tag_interval_ticks: u32,
    pub idle_timeout_ticks: u32,
    pub whitelist_off_of_person: bool,
    pub system_uid: Uid,
}

impl ReactorOptions {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            shard_count: 16,
            tick_interval: Duration::from_millis(100),
            action_queue_capacity: 1024,
            worker_queue_capacity: 1024,
            max_pending_messages: 1024,
            max_stage_retries: 5,
            check_tag_interval_ticks: 100,
            idle_timeout_ticks: 6000,
            whitelist_off_of_person: false,
            system_uid: Uid::new("____system"),
        }
    }

    pub fn from_config(node_id: NodeId, config: &ReactorConfig) -> Self {
        Self {
            node_id,
            shard_count: config.shard_count,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            action_queue_capacity: config.action_queue_capacity,
            worker_queue_capacity: config.worker_queue_capacity,
            max_pending_messages: config.max_pending_messages,
            max_stage_retries: config.max_stage_retries,
            check_tag_interval_ticks: config.check_tag_interval_ticks,
            idle_timeout_ticks: config.idle_timeout_ticks,
            whitelist_off_of_person: config.whitelist_off_of_person,
            system_uid: Uid::new(config.system_uid.clone()),
        }
    }
}

/// State shared by shards and workers: options, collaborators, shard
/// handles, and the stage request senders.
pub(crate) struct ReactorShared {
    pub(crate) opts: Arc<ReactorOptions>,
    pub(crate) deps: Deps,
    pub(crate) shards: Vec<ShardHandle>,
    pub(crate) workers: StageSenders,
    pub(crate) stop_rx: Receiver<()>,
}

impl ReactorShared {
    fn shard_for(&self, key: &ChannelKey) -> &ShardHandle {
        let slot = (key.route_hash() % self.shards.len() as u64) as usize;
        &self.shards[slot]
    }

    /// Routes an action to the shard owning the channel key. Returns false
    /// when the shard's queue is full.
    pub(crate) fn step(&self, action: ChannelAction) -> bool {
        self.shard_for(&action.key()).send(action)
    }

    /// Hands a staged stage request to its worker. Blocks until the worker
    /// queue accepts it or the reactor stops; decrypt additionally gives up
    /// after its enqueue deadline.
    pub(crate) fn dispatch(&self, out: Outbound) {
        let Outbound { ch, request } = out;
        match request {
            StageRequest::Init => self.send_to(&self.workers.init, InitReq { ch }),
            StageRequest::Decrypt { messages } => {
                let tx = self.workers.decrypt.clone();
                let req = DecryptReq { ch, messages };
                crossbeam::select! {
                    send(tx, req) -> _ => {}
                    recv(self.stop_rx) -> _ => {}
                    default(workers::RPC_DEADLINE) => {
                        tracing::error!("decrypt enqueue timed out");
                    }
                }
            }
            StageRequest::Forward { leader_id, messages } => self.send_to(
                &self.workers.forward,
                ForwardReq {
                    ch,
                    leader_id,
                    messages,
                },
            ),
            StageRequest::Permission { from_uid, messages } => self.send_to(
                &self.workers.permission,
                PermissionReq {
                    ch,
                    from_uid,
                    messages,
                },
            ),
            StageRequest::Storage { messages } => {
                self.send_to(&self.workers.storage, StorageReq { ch, messages })
            }
            StageRequest::Sendack {
                reason_code,
                messages,
            } => self.send_to(
                &self.workers.sendack,
                SendackReq {
                    ch,
                    reason_code,
                    messages,
                },
            ),
            StageRequest::Deliver { tag_key, messages } => self.send_to(
                &self.workers.deliver,
                DeliverReq {
                    ch,
                    tag_key,
                    messages,
                },
            ),
            StageRequest::CheckTag => {
                self.send_to(&self.workers.check_tag, CheckTagReq { ch })
            }
            StageRequest::Close => self.send_to(&self.workers.close, CloseReq { ch }),
        }
    }

    fn send_to<T>(&self, tx: &Sender<T>, req: T) {
        crossbeam::select! {
            send(tx, req) -> _ => {}
            recv(self.stop_rx) -> _ => {}
        }
    }
}

/// The reactor: shard loops plus stage worker threads.
///
/// Dropping (or calling [`Reactor::shutdown`]) stops every loop
/// cooperatively and joins the threads.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    stop_tx: Option<Sender<()>>,
    joins: Vec<JoinHandle<()>>,
}

impl Reactor {
    pub fn start(opts: ReactorOptions, deps: Deps) -> Self {
        let opts = Arc::new(opts);
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(0);
        let (senders, receivers) = stage_channels(opts.worker_queue_capacity);

        let shard_count = opts.shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        let mut shard_wakeups = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let (handle, advance_rx) = ShardHandle::new(index, opts.action_queue_capacity);
            shard_wakeups.push((handle.advance_sender(), advance_rx, handle.queue()));
            shards.push(handle);
        }

        let shared = Arc::new(ReactorShared {
            opts: Arc::clone(&opts),
            deps,
            shards,
            workers: senders,
            stop_rx: stop_rx.clone(),
        });

        let mut joins = Vec::new();
        for (index, (advance_tx, advance_rx, queue)) in shard_wakeups.into_iter().enumerate() {
            let state = ShardState::new(index, queue, Arc::clone(&shared));
            let stop = stop_rx.clone();
            joins.push(thread::spawn(move || {
                run_shard_loop(state, advance_tx, advance_rx, stop)
            }));
        }

        macro_rules! spawn_worker {
            ($loop_fn:path, $rx:expr) => {{
                let shared = Arc::clone(&shared);
                let rx = $rx;
                let stop = stop_rx.clone();
                joins.push(thread::spawn(move || $loop_fn(shared, rx, stop)));
            }};
        }
        spawn_worker!(workers::run_init_loop, receivers.init);
        spawn_worker!(workers::run_decrypt_loop, receivers.decrypt);
        spawn_worker!(workers::run_forward_loop, receivers.forward);
        spawn_worker!(workers::run_permission_loop, receivers.permission);
        spawn_worker!(workers::run_storage_loop, receivers.storage);
        spawn_worker!(workers::run_sendack_loop, receivers.sendack);
        spawn_worker!(workers::run_deliver_loop, receivers.deliver);
        spawn_worker!(workers::run_check_tag_loop, receivers.check_tag);
        spawn_worker!(workers::run_close_loop, receivers.close);

        Self {
            shared,
            stop_tx: Some(stop_tx),
            joins,
        }
    }

    /// Hands one locally-published message to its channel. Returns false
    /// when the owning shard's queue rejected it.
    pub fn publish(&self, message: PendingMessage) -> bool {
        let channel_id = message.packet.channel_id.clone();
        let channel_type = message.packet.channel_type;
        self.append_inbound(channel_id, channel_type, vec![message])
    }

    /// Entry point for message batches forwarded by a non-leader peer.
    pub fn append_forwarded(
        &self,
        channel_id: ChannelId,
        channel_type: ChannelType,
        messages: Vec<PendingMessage>,
    ) -> bool {
        self.append_inbound(channel_id, channel_type, messages)
    }

    fn append_inbound(
        &self,
        channel_id: ChannelId,
        channel_type: ChannelType,
        messages: Vec<PendingMessage>,
    ) -> bool {
        self.shared.step(ChannelAction {
            channel_id,
            channel_type,
            unique_no: None,
            kind: ActionKind::Inbound { messages },
        })
    }

    /// Injects a raw action; used by cluster glue (e.g. leader change
    /// notifications) and tests.
    pub fn step(&self, action: ChannelAction) -> bool {
        self.shared.step(action)
    }

    pub fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            drop(stop_tx);
            for join in self.joins.drain(..) {
                let _ = join.join();
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
