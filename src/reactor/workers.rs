//! Stage worker loops.
//!
//! One loop per pipeline stage. Each blocks on its bounded request channel,
//! optionally drains and coalesces whatever else is queued, performs the
//! stage's I/O under a deadline, and re-injects the outcome as a response
//! action through the owning shard. Workers never return errors across
//! threads; every failure becomes a `Reason::Error` response.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Receiver, Sender};

use crate::core::{
    ChannelType, NodeId, PendingMessage, Reason, ReasonCode, SendackPacket, StoredMessage, Uid,
};
use crate::metrics;

use super::ReactorShared;
use super::action::{ActionKind, ChannelAction, ChannelRef};
use super::deps::{
    ConnError, PATH_CHANNEL_FORWARD, PATH_FORWARD_SENDACK, RpcError, STATUS_NOT_CHANNEL_LEADER,
    STATUS_OK, DeliverRequest,
};
use super::proto::{ChannelForwardReq, ForwardSendack, ForwardSendackPacketSet};
use super::tag::TagKey;

pub(crate) const RPC_DEADLINE: Duration = Duration::from_secs(5);
pub(crate) const FAST_RECHECK_DEADLINE: Duration = Duration::from_secs(1);

pub(crate) struct InitReq {
    pub ch: ChannelRef,
}

pub(crate) struct DecryptReq {
    pub ch: ChannelRef,
    pub messages: Vec<PendingMessage>,
}

pub(crate) struct ForwardReq {
    pub ch: ChannelRef,
    pub leader_id: NodeId,
    pub messages: Vec<PendingMessage>,
}

pub(crate) struct PermissionReq {
    pub ch: ChannelRef,
    pub from_uid: Uid,
    pub messages: Vec<PendingMessage>,
}

pub(crate) struct StorageReq {
    pub ch: ChannelRef,
    pub messages: Vec<PendingMessage>,
}

pub(crate) struct SendackReq {
    pub ch: ChannelRef,
    pub reason_code: ReasonCode,
    pub messages: Vec<PendingMessage>,
}

pub(crate) struct DeliverReq {
    pub ch: ChannelRef,
    pub tag_key: Option<TagKey>,
    pub messages: Vec<PendingMessage>,
}

pub(crate) struct CheckTagReq {
    pub ch: ChannelRef,
}

pub(crate) struct CloseReq {
    pub ch: ChannelRef,
}

pub(crate) struct StageSenders {
    pub init: Sender<InitReq>,
    pub decrypt: Sender<DecryptReq>,
    pub forward: Sender<ForwardReq>,
    pub permission: Sender<PermissionReq>,
    pub storage: Sender<StorageReq>,
    pub sendack: Sender<SendackReq>,
    pub deliver: Sender<DeliverReq>,
    pub check_tag: Sender<CheckTagReq>,
    pub close: Sender<CloseReq>,
}

pub(crate) struct StageReceivers {
    pub init: Receiver<InitReq>,
    pub decrypt: Receiver<DecryptReq>,
    pub forward: Receiver<ForwardReq>,
    pub permission: Receiver<PermissionReq>,
    pub storage: Receiver<StorageReq>,
    pub sendack: Receiver<SendackReq>,
    pub deliver: Receiver<DeliverReq>,
    pub check_tag: Receiver<CheckTagReq>,
    pub close: Receiver<CloseReq>,
}

pub(crate) fn stage_channels(capacity: usize) -> (StageSenders, StageReceivers) {
    let (init_tx, init_rx) = crossbeam::channel::bounded(capacity);
    let (decrypt_tx, decrypt_rx) = crossbeam::channel::bounded(capacity);
    let (forward_tx, forward_rx) = crossbeam::channel::bounded(capacity);
    let (permission_tx, permission_rx) = crossbeam::channel::bounded(capacity);
    let (storage_tx, storage_rx) = crossbeam::channel::bounded(capacity);
    let (sendack_tx, sendack_rx) = crossbeam::channel::bounded(capacity);
    let (deliver_tx, deliver_rx) = crossbeam::channel::bounded(capacity);
    let (check_tag_tx, check_tag_rx) = crossbeam::channel::bounded(capacity);
    let (close_tx, close_rx) = crossbeam::channel::bounded(capacity);
    (
        StageSenders {
            init: init_tx,
            decrypt: decrypt_tx,
            forward: forward_tx,
            permission: permission_tx,
            storage: storage_tx,
            sendack: sendack_tx,
            deliver: deliver_tx,
            check_tag: check_tag_tx,
            close: close_tx,
        },
        StageReceivers {
            init: init_rx,
            decrypt: decrypt_rx,
            forward: forward_rx,
            permission: permission_rx,
            storage: storage_rx,
            sendack: sendack_rx,
            deliver: deliver_rx,
            check_tag: check_tag_rx,
            close: close_rx,
        },
    )
}

fn last_index(messages: &[PendingMessage]) -> u64 {
    messages.last().map(|m| m.index).unwrap_or(0)
}

fn respond(shared: &ReactorShared, ch: &ChannelRef, kind: ActionKind) {
    shared.step(ChannelAction {
        channel_id: ch.channel_id.clone(),
        channel_type: ch.channel_type,
        unique_no: Some(ch.unique_no),
        kind,
    });
}

/// Non-blocking drain that merges queued requests into `reqs`.
fn drain_merge<T>(
    rx: &Receiver<T>,
    reqs: &mut Vec<T>,
    same: impl Fn(&T, &T) -> bool,
    merge: impl Fn(&mut T, T),
) {
    while let Ok(req) = rx.try_recv() {
        match reqs.iter().position(|existing| same(existing, &req)) {
            Some(slot) => merge(&mut reqs[slot], req),
            None => reqs.push(req),
        }
    }
}

// =============================== init ===============================

pub(crate) fn run_init_loop(
    shared: Arc<ReactorShared>,
    rx: Receiver<InitReq>,
    stop: Receiver<()>,
) {
    loop {
        crossbeam::select! {
            recv(rx) -> req => {
                let Ok(req) = req else { return };
                process_init(&shared, req);
            }
            recv(stop) -> _ => return,
        }
    }
}

fn process_init(shared: &ReactorShared, req: InitReq) {
    let ch = &req.ch;
    let leader_id = match shared.deps.router.leader_of_channel(
        &ch.channel_id,
        ch.channel_type,
        RPC_DEADLINE,
    ) {
        Ok(leader_id) => leader_id,
        Err(err) => {
            tracing::error!(channel = %ch.key, "channel init failed: {err}");
            respond(
                shared,
                ch,
                ActionKind::InitResp {
                    reason: Reason::Error,
                    leader_id: None,
                    info: None,
                },
            );
            return;
        }
    };
    let info = match shared
        .deps
        .store
        .channel_info(&ch.channel_id, ch.channel_type)
    {
        Ok(info) => info,
        Err(err) => {
            tracing::error!(channel = %ch.key, "channel info load failed: {err}");
            respond(
                shared,
                ch,
                ActionKind::InitResp {
                    reason: Reason::Error,
                    leader_id: Some(leader_id),
                    info: None,
                },
            );
            return;
        }
    };
    if let Err(err) = make_receiver_tag(shared, ch) {
        tracing::error!(channel = %ch.key, "make receiver tag failed: {err}");
        respond(
            shared,
            ch,
            ActionKind::InitResp {
                reason: Reason::Error,
                leader_id: Some(leader_id),
                info: Some(info),
            },
        );
        return;
    }
    respond(
        shared,
        ch,
        ActionKind::InitResp {
            reason: Reason::Success,
            leader_id: Some(leader_id),
            info: Some(info),
        },
    );
}

fn make_receiver_tag(
    shared: &ReactorShared,
    ch: &ChannelRef,
) -> Result<(), super::deps::TagError> {
    let tag = shared
        .deps
        .tags
        .make_receiver_tag(&ch.channel_id, ch.channel_type)?;
    ch.tag.store(tag.key);
    Ok(())
}

// ============================== decrypt ==============================

pub(crate) fn run_decrypt_loop(
    shared: Arc<ReactorShared>,
    rx: Receiver<DecryptReq>,
    stop: Receiver<()>,
) {
    loop {
        crossbeam::select! {
            recv(rx) -> req => {
                let Ok(req) = req else { return };
                process_decrypt(&shared, req);
            }
            recv(stop) -> _ => return,
        }
    }
}

fn process_decrypt(shared: &ReactorShared, mut req: DecryptReq) {
    for msg in req.messages.iter_mut() {
        if !msg.is_encrypt || msg.from_conn_id.is_none() {
            // plaintext already, or no connection to decrypt against
            continue;
        }
        match shared
            .deps
            .conns
            .decrypt_payload(&msg.from_uid, msg.from_conn_id, &msg.packet.payload)
        {
            Ok(plain) => {
                msg.packet.payload = plain;
                msg.is_encrypt = false;
            }
            Err(ConnError::NotFound { .. }) => {
                tracing::debug!(
                    uid = %msg.from_uid,
                    conn_id = %msg.from_conn_id,
                    "connection gone, leaving payload encrypted"
                );
            }
            Err(err) => {
                tracing::warn!(
                    uid = %msg.from_uid,
                    device_id = %msg.from_device_id,
                    conn_id = %msg.from_conn_id,
                    "decrypt payload error: {err}"
                );
            }
        }
    }
    let index = last_index(&req.messages);
    respond(
        shared,
        &req.ch,
        ActionKind::DecryptResp {
            reason: Reason::Success,
            index,
            messages: req.messages,
        },
    );
}

// ============================== forward ==============================

pub(crate) fn run_forward_loop(
    shared: Arc<ReactorShared>,
    rx: Receiver<ForwardReq>,
    stop: Receiver<()>,
) {
    let mut reqs: Vec<ForwardReq> = Vec::with_capacity(64);
    loop {
        crossbeam::select! {
            recv(rx) -> req => {
                let Ok(req) = req else { return };
                reqs.push(req);
                drain_merge(
                    &rx,
                    &mut reqs,
                    |a, b| a.ch.key == b.ch.key,
                    |a, b| a.messages.extend(b.messages),
                );
                for req in reqs.drain(..) {
                    process_forward(&shared, req);
                }
            }
            recv(stop) -> _ => return,
        }
    }
}

fn process_forward(shared: &ReactorShared, req: ForwardReq) {
    let ch = &req.ch;
    let mut new_leader = NodeId::NONE;
    let mut ok = true;

    if !shared.deps.router.node_is_online(req.leader_id) {
        // fast recheck so the next retry is not held up by a long deadline
        ok = false;
        match shared.deps.router.leader_id_of_channel(
            &ch.channel_id,
            ch.channel_type,
            FAST_RECHECK_DEADLINE,
        ) {
            Ok(leader_id) => new_leader = leader_id,
            Err(err) => {
                tracing::warn!(channel = %ch.key, "leader recheck failed: {err}");
            }
        }
    } else {
        match handle_forward(shared, &req) {
            Ok(ForwardOutcome::Accepted) => {}
            Ok(ForwardOutcome::WrongLeader(leader_id)) => {
                // the peer rejected the batch; retry against whatever the
                // authoritative lookup said, even if it names the same node
                ok = false;
                new_leader = leader_id;
            }
            Err(err) => {
                ok = false;
                tracing::warn!(channel = %ch.key, "forward failed: {err}");
            }
        }
    }

    if !new_leader.is_none() && new_leader != req.leader_id {
        tracing::info!(
            channel = %ch.key,
            old_leader = %req.leader_id,
            new_leader = %new_leader,
            "leader change"
        );
        respond(shared, ch, ActionKind::LeaderChange { leader_id: new_leader });
    }
    let reason = if ok { Reason::Success } else { Reason::Error };
    if reason == Reason::Success {
        metrics::forward_ok(req.messages.len());
    } else {
        metrics::forward_err();
    }
    respond(
        shared,
        ch,
        ActionKind::ForwardResp {
            reason,
            index: last_index(&req.messages),
        },
    );
}

enum ForwardOutcome {
    Accepted,
    WrongLeader(NodeId),
}

fn handle_forward(shared: &ReactorShared, req: &ForwardReq) -> Result<ForwardOutcome, RpcError> {
    if req.messages.is_empty() {
        return Ok(ForwardOutcome::Accepted);
    }
    if req.leader_id.is_none() {
        return Err(RpcError::Remote("leader id is unresolved".into()));
    }
    let body = ChannelForwardReq {
        channel_id: req.ch.channel_id.clone(),
        channel_type: req.ch.channel_type,
        messages: req.messages.clone(),
    }
    .encode();
    let resp = shared
        .deps
        .router
        .request(req.leader_id, PATH_CHANNEL_FORWARD, body, RPC_DEADLINE)?;
    if resp.status == STATUS_NOT_CHANNEL_LEADER {
        // the peer moved on; resolve the current leader authoritatively
        let leader_id = shared.deps.router.leader_of_channel(
            &req.ch.channel_id,
            req.ch.channel_type,
            RPC_DEADLINE,
        )?;
        return Ok(ForwardOutcome::WrongLeader(leader_id));
    }
    if resp.status != STATUS_OK {
        let detail = if resp.body.is_empty() {
            format!("forward status {}", resp.status)
        } else {
            String::from_utf8_lossy(&resp.body).into_owned()
        };
        return Err(RpcError::Remote(detail));
    }
    Ok(ForwardOutcome::Accepted)
}

// ============================= permission =============================

pub(crate) fn run_permission_loop(
    shared: Arc<ReactorShared>,
    rx: Receiver<PermissionReq>,
    stop: Receiver<()>,
) {
    loop {
        crossbeam::select! {
            recv(rx) -> req => {
                let Ok(req) = req else { return };
                process_permission(&shared, req);
            }
            recv(stop) -> _ => return,
        }
    }
}

fn process_permission(shared: &ReactorShared, req: PermissionReq) {
    let index = last_index(&req.messages);
    match has_permission(shared, &req) {
        Ok(reason_code) => respond(
            shared,
            &req.ch,
            ActionKind::PermissionResp {
                reason: Reason::Success,
                index,
                reason_code,
            },
        ),
        Err(err) => {
            tracing::error!(channel = %req.ch.key, uid = %req.from_uid, "permission check error: {err}");
            respond(
                shared,
                &req.ch,
                ActionKind::PermissionResp {
                    reason: Reason::Error,
                    index,
                    reason_code: ReasonCode::SystemError,
                },
            );
        }
    }
}

fn has_permission(
    shared: &ReactorShared,
    req: &PermissionReq,
) -> Result<ReasonCode, super::deps::StoreError> {
    let ch = &req.ch;
    let uid = &req.from_uid;

    if matches!(ch.channel_type, ChannelType::Info | ChannelType::Person) {
        return Ok(ReasonCode::Success);
    }
    if uid == &shared.opts.system_uid {
        return Ok(ReasonCode::Success);
    }
    if ch.info.ban {
        return Ok(ReasonCode::Ban);
    }
    if ch.info.disband {
        return Ok(ReasonCode::Disband);
    }

    let store = &shared.deps.store;
    if store.exist_denylist(&ch.channel_id, ch.channel_type, uid)? {
        return Ok(ReasonCode::InBlacklist);
    }
    if !store.exist_subscriber(&ch.channel_id, ch.channel_type, uid)? {
        return Ok(ReasonCode::SubscriberNotExist);
    }
    let allowlist_applies =
        !(shared.opts.whitelist_off_of_person && ch.channel_type == ChannelType::Person);
    if allowlist_applies
        && store.has_allowlist(&ch.channel_id, ch.channel_type)?
        && !store.exist_allowlist(&ch.channel_id, ch.channel_type, uid)?
    {
        return Ok(ReasonCode::NotInWhitelist);
    }
    Ok(ReasonCode::Success)
}

// ============================== storage ==============================

pub(crate) fn run_storage_loop(
    shared: Arc<ReactorShared>,
    rx: Receiver<StorageReq>,
    stop: Receiver<()>,
) {
    let mut reqs: Vec<StorageReq> = Vec::with_capacity(64);
    loop {
        crossbeam::select! {
            recv(rx) -> req => {
                let Ok(req) = req else { return };
                reqs.push(req);
                drain_merge(
                    &rx,
                    &mut reqs,
                    |a, b| a.ch.key == b.ch.key,
                    |a, b| a.messages.extend(b.messages),
                );
                for req in reqs.drain(..) {
                    process_storage(&shared, req);
                }
            }
            recv(stop) -> _ => return,
        }
    }
}

fn process_storage(shared: &ReactorShared, mut req: StorageReq) {
    let ch = req.ch.clone();
    let mut records = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        if msg.is_encrypt {
            tracing::warn!(
                message_id = msg.message_id,
                channel = %ch.key,
                "message still encrypted, not storing"
            );
            continue;
        }
        records.push(StoredMessage {
            framer: msg.packet.framer,
            message_id: msg.message_id,
            client_msg_no: msg.packet.client_msg_no.clone(),
            client_seq: msg.packet.client_seq,
            from_uid: msg.from_uid.clone(),
            channel_id: ch.channel_id.clone(),
            channel_type: msg.packet.channel_type,
            expire: msg.packet.expire,
            timestamp: unix_timestamp(),
            payload: msg.packet.payload.clone(),
        });
    }

    let appended = shared.deps.store.append_messages(
        &ch.channel_id,
        ch.channel_type,
        records,
        RPC_DEADLINE,
    );
    let reason = match &appended {
        Ok(results) => {
            for result in results {
                let matched = req
                    .messages
                    .iter_mut()
                    .find(|msg| msg.message_id == result.log_id);
                match matched {
                    Some(msg) => msg.message_seq = result.log_index,
                    None => tracing::warn!(
                        log_id = result.log_id,
                        channel = %ch.key,
                        "append result matches no pending message"
                    ),
                }
            }
            metrics::storage_append_ok(results.len());
            Reason::Success
        }
        Err(err) => {
            metrics::storage_append_err();
            tracing::error!(channel = %ch.key, "append messages error: {err}");
            Reason::Error
        }
    };
    let index = last_index(&req.messages);
    respond(
        shared,
        &ch,
        ActionKind::StorageResp {
            reason,
            index,
            messages: req.messages,
        },
    );
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================== sendack ==============================

pub(crate) fn run_sendack_loop(
    shared: Arc<ReactorShared>,
    rx: Receiver<SendackReq>,
    stop: Receiver<()>,
) {
    let mut reqs: Vec<SendackReq> = Vec::with_capacity(64);
    loop {
        crossbeam::select! {
            recv(rx) -> req => {
                let Ok(req) = req else { return };
                reqs.push(req);
                while let Ok(req) = rx.try_recv() {
                    reqs.push(req);
                }
                process_sendack(&shared, &mut reqs);
                reqs.clear();
            }
            recv(stop) -> _ => return,
        }
    }
}

fn process_sendack(shared: &ReactorShared, reqs: &mut Vec<SendackReq>) {
    let mut by_node: Vec<(NodeId, Vec<ForwardSendack>)> = Vec::new();
    for req in reqs.iter() {
        for msg in &req.messages {
            if msg.from_uid == shared.opts.system_uid {
                continue;
            }
            let sendack = SendackPacket {
                framer: msg.packet.framer,
                message_id: msg.message_id,
                message_seq: msg.message_seq,
                client_seq: msg.packet.client_seq,
                client_msg_no: msg.packet.client_msg_no.clone(),
                reason_code: req.reason_code,
            };
            if msg.from_node_id == shared.opts.node_id {
                if let Err(err) = shared.deps.conns.write_sendack(
                    &msg.from_uid,
                    msg.from_conn_id,
                    sendack,
                ) {
                    tracing::error!(
                        uid = %msg.from_uid,
                        conn_id = %msg.from_conn_id,
                        "write sendack error: {err}"
                    );
                }
            } else {
                let slot = match by_node.iter().position(|(n, _)| *n == msg.from_node_id) {
                    Some(slot) => slot,
                    None => {
                        by_node.push((msg.from_node_id, Vec::new()));
                        by_node.len() - 1
                    }
                };
                by_node[slot].1.push(ForwardSendack {
                    uid: msg.from_uid.clone(),
                    device_id: msg.from_device_id.clone(),
                    sendack,
                });
            }
        }
        respond(
            shared,
            &req.ch,
            ActionKind::SendackResp {
                reason: Reason::Success,
                index: last_index(&req.messages),
            },
        );
    }

    for (node_id, packets) in by_node {
        let count = packets.len();
        if let Err(err) = request_forward_sendack(shared, node_id, packets) {
            tracing::error!(node = %node_id, "forward sendack error: {err}");
        } else {
            metrics::sendack_forwarded(count);
        }
    }
}

fn request_forward_sendack(
    shared: &ReactorShared,
    node_id: NodeId,
    packets: Vec<ForwardSendack>,
) -> Result<(), RpcError> {
    let body = ForwardSendackPacketSet { packets }.encode();
    let resp = shared
        .deps
        .router
        .request(node_id, PATH_FORWARD_SENDACK, body, RPC_DEADLINE)?;
    if resp.status != STATUS_OK {
        let detail = if resp.body.is_empty() {
            format!("forward sendack status {}", resp.status)
        } else {
            String::from_utf8_lossy(&resp.body).into_owned()
        };
        return Err(RpcError::Remote(detail));
    }
    Ok(())
}

// ============================== deliver ==============================

pub(crate) fn run_deliver_loop(
    shared: Arc<ReactorShared>,
    rx: Receiver<DeliverReq>,
    stop: Receiver<()>,
) {
    let mut reqs: Vec<DeliverReq> = Vec::with_capacity(64);
    loop {
        crossbeam::select! {
            recv(rx) -> req => {
                let Ok(req) = req else { return };
                reqs.push(req);
                drain_merge(
                    &rx,
                    &mut reqs,
                    |a, b| a.ch.key == b.ch.key,
                    |a, b| a.messages.extend(b.messages),
                );
                for req in reqs.drain(..) {
                    process_deliver(&shared, req);
                }
            }
            recv(stop) -> _ => return,
        }
    }
}

fn process_deliver(shared: &ReactorShared, req: DeliverReq) {
    let index = last_index(&req.messages);
    shared.deps.deliver.deliver(DeliverRequest {
        channel_id: req.ch.channel_id.clone(),
        channel_type: req.ch.channel_type,
        tag_key: req.tag_key,
        messages: req.messages,
    });
    respond(
        shared,
        &req.ch,
        ActionKind::DeliverResp {
            reason: Reason::Success,
            index,
        },
    );
}

// ============================= check tag =============================

pub(crate) fn run_check_tag_loop(
    shared: Arc<ReactorShared>,
    rx: Receiver<CheckTagReq>,
    stop: Receiver<()>,
) {
    loop {
        crossbeam::select! {
            recv(rx) -> req => {
                let Ok(req) = req else { return };
                process_check_tag(&shared, req);
            }
            recv(stop) -> _ => return,
        }
    }
}

fn process_check_tag(shared: &ReactorShared, req: CheckTagReq) {
    let ch = &req.ch;
    let Some(tag_key) = ch.tag.load() else {
        rebuild_tag(shared, ch);
        return;
    };
    let Some(tag) = shared.deps.tags.receiver_tag(&tag_key) else {
        tracing::info!(channel = %ch.key, tag = tag_key.as_str(), "receiver tag expired");
        rebuild_tag(shared, ch);
        return;
    };

    let mut drifted = false;
    'outer: for node_users in &tag.nodes {
        for uid in &node_users.uids {
            let leader_id = match shared
                .deps
                .router
                .slot_leader_id_of_channel(uid, ChannelType::Person)
            {
                Ok(leader_id) => leader_id,
                Err(err) => {
                    tracing::error!(channel = %ch.key, "slot leader lookup failed: {err}");
                    return;
                }
            };
            if leader_id != node_users.node_id {
                drifted = true;
                break 'outer;
            }
        }
    }
    if drifted {
        tracing::info!(channel = %ch.key, "cluster layout drift, rebuilding receiver tag");
        rebuild_tag(shared, ch);
    }
}

fn rebuild_tag(shared: &ReactorShared, ch: &ChannelRef) {
    if let Err(err) = make_receiver_tag(shared, ch) {
        tracing::error!(channel = %ch.key, "make receiver tag failed: {err}");
    }
}

// =============================== close ===============================

pub(crate) fn run_close_loop(
    _shared: Arc<ReactorShared>,
    rx: Receiver<CloseReq>,
    stop: Receiver<()>,
) {
    loop {
        crossbeam::select! {
            recv(rx) -> req => {
                let Ok(req) = req else { return };
                tracing::info!(channel = %req.ch.key, "channel closed");
                metrics::channel_closed();
            }
            recv(stop) -> _ => return,
        }
    }
}
