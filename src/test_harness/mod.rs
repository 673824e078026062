//! In-memory collaborators for exercising the reactor without a cluster.
//!
//! Every fake records what it was asked and exposes knobs for the failure
//! modes the pipeline must handle: offline leaders, moved leaders, denylists,
//! missing connections. Only test code should depend on this module.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::core::{
    AppendResult, ChannelId, ChannelInfo, ChannelKey, ChannelType, ConnId, NodeId, SendackPacket,
    StoredMessage, Uid,
};
use crate::reactor::deps::{
    ConnError, ConnectionRegistry, DeliverManager, DeliverRequest, Deps, MessageStore, Router,
    RpcError, RpcResponse, STATUS_OK, StoreError, TagError, TagManager,
};
use crate::reactor::tag::{NodeUsers, ReceiverTag, TagKey};

/// Polls `predicate` until it holds or the timeout expires.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub node_id: NodeId,
    pub path: String,
    pub body: Bytes,
}

#[derive(Default)]
struct RouterState {
    leaders: HashMap<String, NodeId>,
    offline: HashSet<NodeId>,
    slot_leaders: HashMap<Uid, NodeId>,
    default_slot_leader: NodeId,
    requests: Vec<RecordedRequest>,
    responses: HashMap<String, Vec<RpcResponse>>,
    leader_lookups: u64,
}

/// Scriptable in-memory `Router`.
#[derive(Clone, Default)]
pub struct MemRouter {
    state: Arc<Mutex<RouterState>>,
}

impl MemRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_leader(&self, channel_id: &ChannelId, channel_type: ChannelType, leader: NodeId) {
        let key = ChannelKey::new(channel_id, channel_type);
        self.lock().leaders.insert(key.as_str().to_string(), leader);
    }

    pub fn set_offline(&self, node_id: NodeId, offline: bool) {
        let mut state = self.lock();
        if offline {
            state.offline.insert(node_id);
        } else {
            state.offline.remove(&node_id);
        }
    }

    pub fn set_slot_leader(&self, uid: &Uid, leader: NodeId) {
        self.lock().slot_leaders.insert(uid.clone(), leader);
    }

    pub fn set_default_slot_leader(&self, leader: NodeId) {
        self.lock().default_slot_leader = leader;
    }

    /// Queues a canned response for the next request on `path`; afterwards
    /// requests on that path succeed with `STATUS_OK`.
    pub fn push_response(&self, path: &str, response: RpcResponse) {
        self.lock()
            .responses
            .entry(path.to_string())
            .or_default()
            .push(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn requests_on(&self, path: &str) -> Vec<RecordedRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn leader_lookups(&self) -> u64 {
        self.lock().leader_lookups
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterState> {
        self.state.lock().expect("router lock")
    }

    fn leader_for(&self, channel_id: &ChannelId, channel_type: ChannelType) -> Option<NodeId> {
        let key = ChannelKey::new(channel_id, channel_type);
        let mut state = self.lock();
        state.leader_lookups += 1;
        state.leaders.get(key.as_str()).copied()
    }
}

impl Router for MemRouter {
    fn leader_of_channel(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        _timeout: Duration,
    ) -> Result<NodeId, RpcError> {
        self.leader_for(channel_id, channel_type)
            .ok_or_else(|| RpcError::Remote("no leader configured".into()))
    }

    fn leader_id_of_channel(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        _timeout: Duration,
    ) -> Result<NodeId, RpcError> {
        self.leader_for(channel_id, channel_type)
            .ok_or_else(|| RpcError::Remote("no leader configured".into()))
    }

    fn node_is_online(&self, node_id: NodeId) -> bool {
        !self.lock().offline.contains(&node_id)
    }

    fn slot_leader_id_of_channel(
        &self,
        uid: &Uid,
        _channel_type: ChannelType,
    ) -> Result<NodeId, RpcError> {
        let state = self.lock();
        Ok(state
            .slot_leaders
            .get(uid)
            .copied()
            .unwrap_or(state.default_slot_leader))
    }

    fn request(
        &self,
        node_id: NodeId,
        path: &str,
        body: Bytes,
        _timeout: Duration,
    ) -> Result<RpcResponse, RpcError> {
        let mut state = self.lock();
        state.requests.push(RecordedRequest {
            node_id,
            path: path.to_string(),
            body,
        });
        let response = state
            .responses
            .get_mut(path)
            .and_then(|queued| {
                if queued.is_empty() {
                    None
                } else {
                    Some(queued.remove(0))
                }
            })
            .unwrap_or(RpcResponse {
                status: STATUS_OK,
                body: Bytes::new(),
            });
        Ok(response)
    }
}

#[derive(Default)]
struct StoreState {
    infos: HashMap<String, ChannelInfo>,
    denylist: HashSet<(String, Uid)>,
    subscribers: HashSet<(String, Uid)>,
    allowlist: HashSet<(String, Uid)>,
    appended: HashMap<String, Vec<StoredMessage>>,
    next_seq: HashMap<String, u32>,
    fail_appends: bool,
    permission_queries: u64,
}

/// In-memory `MessageStore` with permission knobs.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("store lock")
    }

    fn key(channel_id: &ChannelId, channel_type: ChannelType) -> String {
        ChannelKey::new(channel_id, channel_type).as_str().to_string()
    }

    pub fn set_info(&self, channel_id: &ChannelId, channel_type: ChannelType, info: ChannelInfo) {
        self.lock()
            .infos
            .insert(Self::key(channel_id, channel_type), info);
    }

    pub fn add_subscriber(&self, channel_id: &ChannelId, channel_type: ChannelType, uid: &Uid) {
        self.lock()
            .subscribers
            .insert((Self::key(channel_id, channel_type), uid.clone()));
    }

    pub fn add_denylist(&self, channel_id: &ChannelId, channel_type: ChannelType, uid: &Uid) {
        self.lock()
            .denylist
            .insert((Self::key(channel_id, channel_type), uid.clone()));
    }

    pub fn add_allowlist(&self, channel_id: &ChannelId, channel_type: ChannelType, uid: &Uid) {
        self.lock()
            .allowlist
            .insert((Self::key(channel_id, channel_type), uid.clone()));
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.lock().fail_appends = fail;
    }

    pub fn appended(&self, channel_id: &ChannelId, channel_type: ChannelType) -> Vec<StoredMessage> {
        self.lock()
            .appended
            .get(&Self::key(channel_id, channel_type))
            .cloned()
            .unwrap_or_default()
    }

    /// Store round-trips made by permission checks since construction.
    pub fn permission_queries(&self) -> u64 {
        self.lock().permission_queries
    }
}

impl MessageStore for MemStore {
    fn channel_info(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
    ) -> Result<ChannelInfo, StoreError> {
        Ok(self
            .lock()
            .infos
            .get(&Self::key(channel_id, channel_type))
            .copied()
            .unwrap_or_default())
    }

    fn append_messages(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        messages: Vec<StoredMessage>,
        _timeout: Duration,
    ) -> Result<Vec<AppendResult>, StoreError> {
        let mut state = self.lock();
        if state.fail_appends {
            return Err(StoreError::Io("append disabled".into()));
        }
        let key = Self::key(channel_id, channel_type);
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            let seq = state.next_seq.entry(key.clone()).or_insert(0);
            *seq += 1;
            results.push(AppendResult {
                log_id: message.message_id,
                log_index: *seq,
            });
            state.appended.entry(key.clone()).or_default().push(message);
        }
        Ok(results)
    }

    fn exist_denylist(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        uid: &Uid,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        state.permission_queries += 1;
        Ok(state
            .denylist
            .contains(&(Self::key(channel_id, channel_type), uid.clone())))
    }

    fn exist_subscriber(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        uid: &Uid,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        state.permission_queries += 1;
        Ok(state
            .subscribers
            .contains(&(Self::key(channel_id, channel_type), uid.clone())))
    }

    fn has_allowlist(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        state.permission_queries += 1;
        let key = Self::key(channel_id, channel_type);
        Ok(state.allowlist.iter().any(|(k, _)| *k == key))
    }

    fn exist_allowlist(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        uid: &Uid,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        state.permission_queries += 1;
        Ok(state
            .allowlist
            .contains(&(Self::key(channel_id, channel_type), uid.clone())))
    }
}

#[derive(Default)]
struct ConnState {
    sessions: HashSet<(Uid, ConnId)>,
    sendacks: Vec<(Uid, ConnId, SendackPacket)>,
}

/// In-memory `ConnectionRegistry`. "Decryption" strips the `enc:` prefix a
/// test put on the payload.
#[derive(Clone, Default)]
pub struct MemConns {
    state: Arc<Mutex<ConnState>>,
}

impl MemConns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_conn(&self, uid: &Uid, conn_id: ConnId) {
        self.lock().sessions.insert((uid.clone(), conn_id));
    }

    pub fn sendacks(&self) -> Vec<(Uid, ConnId, SendackPacket)> {
        self.lock().sendacks.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().expect("conn lock")
    }
}

impl ConnectionRegistry for MemConns {
    fn decrypt_payload(
        &self,
        uid: &Uid,
        conn_id: ConnId,
        payload: &Bytes,
    ) -> Result<Bytes, ConnError> {
        if !self.lock().sessions.contains(&(uid.clone(), conn_id)) {
            return Err(ConnError::NotFound {
                uid: uid.clone(),
                conn_id,
            });
        }
        match payload.strip_prefix(b"enc:") {
            Some(plain) => Ok(Bytes::copy_from_slice(plain)),
            None => Err(ConnError::Decrypt("payload not encrypted".into())),
        }
    }

    fn write_sendack(
        &self,
        uid: &Uid,
        conn_id: ConnId,
        packet: SendackPacket,
    ) -> Result<(), ConnError> {
        self.lock().sendacks.push((uid.clone(), conn_id, packet));
        Ok(())
    }
}

#[derive(Default)]
struct TagState {
    members: HashMap<String, Vec<(NodeId, Vec<Uid>)>>,
    tags: HashMap<TagKey, ReceiverTag>,
    builds: HashMap<String, u64>,
    fail_builds: bool,
}

/// In-memory `TagManager` counting rebuilds per channel.
#[derive(Clone)]
pub struct MemTags {
    state: Arc<Mutex<TagState>>,
    next_key: Arc<AtomicU64>,
}

impl Default for MemTags {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(TagState::default())),
            next_key: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl MemTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_members(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
        members: Vec<(NodeId, Vec<Uid>)>,
    ) {
        let key = ChannelKey::new(channel_id, channel_type);
        self.lock().members.insert(key.as_str().to_string(), members);
    }

    pub fn set_fail_builds(&self, fail: bool) {
        self.lock().fail_builds = fail;
    }

    pub fn builds(&self, channel_id: &ChannelId, channel_type: ChannelType) -> u64 {
        let key = ChannelKey::new(channel_id, channel_type);
        self.lock().builds.get(key.as_str()).copied().unwrap_or(0)
    }

    /// Drops a tag's contents to simulate cache expiry; the key stays handed
    /// out.
    pub fn expire(&self, key: &TagKey) {
        self.lock().tags.remove(key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TagState> {
        self.state.lock().expect("tag lock")
    }
}

impl TagManager for MemTags {
    fn make_receiver_tag(
        &self,
        channel_id: &ChannelId,
        channel_type: ChannelType,
    ) -> Result<ReceiverTag, TagError> {
        let mut state = self.lock();
        if state.fail_builds {
            return Err(TagError::Build("tag builds disabled".into()));
        }
        let channel_key = ChannelKey::new(channel_id, channel_type);
        let key = TagKey::new(format!(
            "tag-{}",
            self.next_key.fetch_add(1, Ordering::Relaxed)
        ));
        let nodes = state
            .members
            .get(channel_key.as_str())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|(node_id, uids)| NodeUsers { node_id, uids })
            .collect();
        let tag = ReceiverTag {
            key: key.clone(),
            nodes,
        };
        state.tags.insert(key, tag.clone());
        *state
            .builds
            .entry(channel_key.as_str().to_string())
            .or_insert(0) += 1;
        Ok(tag)
    }

    fn receiver_tag(&self, key: &TagKey) -> Option<ReceiverTag> {
        self.lock().tags.get(key).cloned()
    }
}

/// Recording `DeliverManager`.
#[derive(Clone, Default)]
pub struct MemDeliver {
    delivered: Arc<Mutex<Vec<DeliverRequest>>>,
}

impl MemDeliver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<DeliverRequest> {
        self.delivered.lock().expect("deliver lock").clone()
    }
}

impl DeliverManager for MemDeliver {
    fn deliver(&self, req: DeliverRequest) {
        self.delivered.lock().expect("deliver lock").push(req);
    }
}

/// The full fake bundle plus handles to each fake for scripting.
#[derive(Clone)]
pub struct Harness {
    pub router: MemRouter,
    pub store: MemStore,
    pub conns: MemConns,
    pub tags: MemTags,
    pub deliver: MemDeliver,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self {
            router: MemRouter::new(),
            store: MemStore::new(),
            conns: MemConns::new(),
            tags: MemTags::new(),
            deliver: MemDeliver::new(),
        }
    }

    pub fn deps(&self) -> Deps {
        Deps {
            router: Arc::new(self.router.clone()),
            store: Arc::new(self.store.clone()),
            conns: Arc::new(self.conns.clone()),
            tags: Arc::new(self.tags.clone()),
            deliver: Arc::new(self.deliver.clone()),
        }
    }
}
