//! Config consensus node.
//!
//! One instance per replica group agrees on a monotonically increasing
//! cluster-configuration version and propagates the associated blob. A
//! simplified leader-election protocol: no log, only the version counters
//! and an opaque payload. The node is driven externally: a ticker calls
//! `tick`, transport hands messages to `step`, and the host drains staged
//! output through `ready`/`accept_ready`.

use std::collections::HashMap;

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;

use crate::core::NodeId;
use crate::metrics;

use super::message::{Message, MessageKind, Ready};

#[derive(Clone, Debug)]
pub struct ConsensusOptions {
    pub node_id: NodeId,
    /// All replicas of the group, this node included.
    pub replicas: Vec<NodeId>,
    pub election_timeout_tick: u32,
    pub heartbeat_timeout_tick: u32,
    /// Version restored from the host's persisted state.
    pub config_version: u64,
    pub config_data: Bytes,
}

impl ConsensusOptions {
    pub fn new(node_id: NodeId, replicas: Vec<NodeId>) -> Self {
        Self {
            node_id,
            replicas,
            election_timeout_tick: 10,
            heartbeat_timeout_tick: 1,
            config_version: 0,
            config_data: Bytes::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Externally visible election state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct State {
    leader: NodeId,
    term: u32,
    vote_for: NodeId,
}

impl State {
    pub fn leader(&self) -> NodeId {
        self.leader
    }

    pub fn term(&self) -> u32 {
        self.term
    }

    pub fn vote_for(&self) -> NodeId {
        self.vote_for
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("message term {term} below current term {current}")]
    InvalidTerm { term: u32, current: u32 },
}

pub struct ConfigNode {
    opts: ConsensusOptions,
    state: State,
    role: Role,

    leader_config_version: u64,
    local_config_version: u64,
    committed_config_version: u64,
    applied_config_version: u64,
    config_data: Bytes,

    votes: HashMap<NodeId, bool>,
    election_elapsed: u32,
    heartbeat_elapsed: u32,
    randomized_election_timeout: u32,

    /// Leader's view of each replica's local config version.
    node_config_version_map: HashMap<NodeId, u64>,

    msgs: Vec<Message>,
}

impl ConfigNode {
    pub fn new(opts: ConsensusOptions) -> Self {
        let mut node = Self {
            state: State::default(),
            role: Role::Follower,
            leader_config_version: opts.config_version,
            local_config_version: opts.config_version,
            committed_config_version: opts.config_version,
            applied_config_version: opts.config_version,
            config_data: opts.config_data.clone(),
            votes: HashMap::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            node_config_version_map: HashMap::new(),
            msgs: Vec::new(),
            opts,
        };
        let term = node.state.term;
        node.become_follower(term, NodeId::NONE);
        node
    }

    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => self.tick_heartbeat(),
            Role::Follower | Role::Candidate => self.tick_election(),
        }
    }

    pub fn has_ready(&self) -> bool {
        if !self.msgs.is_empty() {
            return true;
        }
        if !self.is_leader()
            && self.has_leader()
            && self.leader_config_version != self.local_config_version
        {
            return true;
        }
        self.committed_config_version > self.applied_config_version
    }

    pub fn ready(&mut self) -> Ready {
        let mut messages = self.msgs.clone();
        if !self.is_leader()
            && self.has_leader()
            && self.leader_config_version != self.local_config_version
        {
            messages.push(self.new_sync());
        }
        if self.committed_config_version > self.applied_config_version {
            messages.push(self.new_apply());
        }
        Ready { messages }
    }

    /// The host has taken responsibility for transporting the messages and
    /// for persisting any `Apply` the ready carried.
    pub fn accept_ready(&mut self, rd: &Ready) {
        self.msgs.clear();
        for msg in &rd.messages {
            if msg.kind == MessageKind::Apply
                && msg.config_version > self.applied_config_version
            {
                self.applied_config_version = msg.config_version;
            }
        }
    }

    pub fn step(&mut self, m: Message) -> Result<(), StepError> {
        if m.term != 0 && m.term < self.state.term {
            return Err(StepError::InvalidTerm {
                term: m.term,
                current: self.state.term,
            });
        }
        if m.term > self.state.term {
            match m.kind {
                MessageKind::AppendConfig | MessageKind::Heartbeat => {
                    self.become_follower(m.term, m.from);
                }
                _ => self.become_follower(m.term, NodeId::NONE),
            }
        }
        match self.role {
            Role::Follower => self.step_follower(m),
            Role::Candidate => self.step_candidate(m),
            Role::Leader => self.step_leader(m),
        }
        Ok(())
    }

    pub fn propose_config_version(&mut self, version: u64) -> Result<(), StepError> {
        let data = self.config_data.clone();
        self.propose_config(version, data)
    }

    pub fn propose_config(&mut self, version: u64, data: Bytes) -> Result<(), StepError> {
        let mut m = Message::new(MessageKind::Propose);
        m.from = self.opts.node_id;
        m.term = self.state.term;
        m.config_version = version;
        m.config_data = data;
        self.step(m)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn has_leader(&self) -> bool {
        !self.state.leader.is_none()
    }

    pub fn config_data(&self) -> &Bytes {
        &self.config_data
    }

    pub fn local_config_version(&self) -> u64 {
        self.local_config_version
    }

    pub fn leader_config_version(&self) -> u64 {
        self.leader_config_version
    }

    pub fn committed_config_version(&self) -> u64 {
        self.committed_config_version
    }

    pub fn applied_config_version(&self) -> u64 {
        self.applied_config_version
    }

    // ------------------------- role steps -------------------------

    fn step_follower(&mut self, m: Message) {
        match m.kind {
            MessageKind::Hup => self.campaign(),
            MessageKind::AppendConfig => self.handle_append_config(m),
            MessageKind::Heartbeat => self.handle_heartbeat(m),
            MessageKind::VoteRequest => self.handle_vote_request(m),
            MessageKind::Propose => {
                tracing::warn!(node = %self.opts.node_id, "propose on non-leader, ignored");
            }
            _ => {}
        }
    }

    fn step_candidate(&mut self, m: Message) {
        match m.kind {
            MessageKind::Hup => self.campaign(),
            MessageKind::VoteResponse => {
                self.votes.insert(m.from, true);
                let granted = self.votes.values().filter(|granted| **granted).count();
                if granted >= self.quorum() {
                    self.become_leader();
                    self.broadcast_heartbeat();
                }
            }
            // an equal-term message from an established leader ends the
            // candidacy (higher terms were handled in step)
            MessageKind::AppendConfig => {
                self.become_follower(m.term, m.from);
                self.handle_append_config(m);
            }
            MessageKind::Heartbeat => {
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m);
            }
            MessageKind::VoteRequest => self.handle_vote_request(m),
            MessageKind::Propose => {
                tracing::warn!(node = %self.opts.node_id, "propose on non-leader, ignored");
            }
            _ => {}
        }
    }

    fn step_leader(&mut self, m: Message) {
        match m.kind {
            MessageKind::Beat => self.broadcast_heartbeat(),
            MessageKind::Propose => self.handle_propose(m),
            MessageKind::AppendConfigResp => {
                self.node_config_version_map.insert(m.from, m.config_version);
                self.maybe_commit();
            }
            MessageKind::HeartbeatResp => {
                self.node_config_version_map.insert(m.from, m.config_version);
                if m.config_version < self.local_config_version {
                    self.send_append_config(m.from);
                }
                self.maybe_commit();
            }
            MessageKind::Sync => {
                self.node_config_version_map.insert(m.from, m.config_version);
                if m.config_version != self.local_config_version {
                    self.send_append_config(m.from);
                }
                self.maybe_commit();
            }
            _ => {}
        }
    }

    // ----------------------- event handlers -----------------------

    fn campaign(&mut self) {
        self.become_candidate();
        if self.quorum() == 1 {
            self.become_leader();
            self.broadcast_heartbeat();
            return;
        }
        self.votes.insert(self.opts.node_id, true);
        metrics::election_started(self.state.term);
        for peer in self.peers() {
            let mut m = Message::new(MessageKind::VoteRequest);
            m.from = self.opts.node_id;
            m.to = peer;
            m.term = self.state.term;
            m.config_version = self.local_config_version;
            self.send(m);
        }
    }

    fn handle_vote_request(&mut self, m: Message) {
        let can_vote =
            self.state.vote_for.is_none() || self.state.vote_for == m.from;
        if can_vote && m.config_version >= self.local_config_version {
            self.state.vote_for = m.from;
            self.election_elapsed = 0;
            let mut resp = Message::new(MessageKind::VoteResponse);
            resp.from = self.opts.node_id;
            resp.to = m.from;
            resp.term = self.state.term;
            self.send(resp);
        }
    }

    fn handle_append_config(&mut self, m: Message) {
        self.election_elapsed = 0;
        self.state.leader = m.from;
        self.leader_config_version = m.config_version;
        if m.config_version >= self.local_config_version {
            self.local_config_version = m.config_version;
            self.config_data = m.config_data;
            // adopting the leader's version is this replica's ack toward the
            // quorum; the version never rolls back, so committing here is
            // safe
            if m.config_version > self.committed_config_version {
                self.committed_config_version = m.config_version;
            }
        }
        let mut resp = Message::new(MessageKind::AppendConfigResp);
        resp.from = self.opts.node_id;
        resp.to = m.from;
        resp.term = self.state.term;
        resp.config_version = self.local_config_version;
        self.send(resp);
    }

    fn handle_heartbeat(&mut self, m: Message) {
        self.election_elapsed = 0;
        self.state.leader = m.from;
        self.leader_config_version = m.config_version;
        let mut resp = Message::new(MessageKind::HeartbeatResp);
        resp.from = self.opts.node_id;
        resp.to = m.from;
        resp.term = self.state.term;
        resp.config_version = self.local_config_version;
        self.send(resp);
    }

    fn handle_propose(&mut self, m: Message) {
        if m.config_version <= self.local_config_version {
            tracing::warn!(
                node = %self.opts.node_id,
                proposed = m.config_version,
                local = self.local_config_version,
                "config version regression ignored"
            );
            return;
        }
        self.local_config_version = m.config_version;
        self.leader_config_version = m.config_version;
        self.config_data = m.config_data;
        self.node_config_version_map
            .insert(self.opts.node_id, m.config_version);
        for peer in self.peers() {
            self.send_append_config(peer);
        }
        self.maybe_commit();
    }

    fn send_append_config(&mut self, to: NodeId) {
        let mut m = Message::new(MessageKind::AppendConfig);
        m.from = self.opts.node_id;
        m.to = to;
        m.term = self.state.term;
        m.config_version = self.local_config_version;
        m.config_data = self.config_data.clone();
        self.send(m);
    }

    fn broadcast_heartbeat(&mut self) {
        for peer in self.peers() {
            let mut m = Message::new(MessageKind::Heartbeat);
            m.from = self.opts.node_id;
            m.to = peer;
            m.term = self.state.term;
            m.config_version = self.leader_config_version;
            self.send(m);
        }
    }

    fn maybe_commit(&mut self) {
        if self.local_config_version <= self.committed_config_version {
            return;
        }
        let acked = self
            .opts
            .replicas
            .iter()
            .filter(|replica| {
                self.node_config_version_map
                    .get(replica)
                    .is_some_and(|v| *v >= self.local_config_version)
            })
            .count();
        if acked >= self.quorum() {
            self.committed_config_version = self.local_config_version;
            metrics::config_committed(self.committed_config_version);
            tracing::info!(
                node = %self.opts.node_id,
                version = self.committed_config_version,
                "config version committed"
            );
        }
    }

    fn new_sync(&self) -> Message {
        let mut m = Message::new(MessageKind::Sync);
        m.from = self.opts.node_id;
        m.to = self.state.leader;
        m.term = self.state.term;
        m.config_version = self.local_config_version;
        m
    }

    fn new_apply(&self) -> Message {
        let mut m = Message::new(MessageKind::Apply);
        m.from = self.opts.node_id;
        m.to = self.opts.node_id;
        m.term = self.state.term;
        m.config_version = self.committed_config_version;
        m.config_data = self.config_data.clone();
        m
    }

    // ------------------------ transitions ------------------------

    fn become_follower(&mut self, term: u32, leader: NodeId) {
        self.reset(term);
        self.state.vote_for = leader;
        self.state.leader = leader;
        self.role = Role::Follower;
        tracing::info!(node = %self.opts.node_id, term, leader = %leader, "become follower");
    }

    fn become_candidate(&mut self) {
        if self.role == Role::Leader {
            panic!("invalid transition [leader -> candidate]");
        }
        let term = self.state.term + 1;
        self.reset(term);
        self.state.vote_for = self.opts.node_id;
        self.state.leader = NodeId::NONE;
        self.role = Role::Candidate;
        tracing::info!(node = %self.opts.node_id, term, "become candidate");
    }

    fn become_leader(&mut self) {
        if self.role == Role::Follower {
            panic!("invalid transition [follower -> leader]");
        }
        let term = self.state.term;
        self.reset(term);
        self.state.leader = self.opts.node_id;
        self.role = Role::Leader;
        self.leader_config_version = self.local_config_version;
        self.node_config_version_map
            .insert(self.opts.node_id, self.local_config_version);
        metrics::leader_elected(term);
        tracing::info!(node = %self.opts.node_id, term, "become leader");
    }

    fn reset(&mut self, term: u32) {
        self.state.term = term;
        self.state.vote_for = NodeId::NONE;
        self.votes.clear();
        self.election_elapsed = 0;
        self.reset_randomized_election_timeout();
    }

    // --------------------------- ticks ---------------------------

    fn tick_election(&mut self) {
        self.election_elapsed += 1;
        if self.past_election_timeout() {
            self.election_elapsed = 0;
            if let Err(err) = self.step(Message::new(MessageKind::Hup)) {
                tracing::debug!(node = %self.opts.node_id, "election tick: {err}");
            }
        }
    }

    fn tick_heartbeat(&mut self) {
        if !self.is_leader() {
            tracing::warn!(node = %self.opts.node_id, "heartbeat tick on non-leader");
            return;
        }
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;
        if self.election_elapsed >= self.opts.election_timeout_tick {
            self.election_elapsed = 0;
        }
        if self.heartbeat_elapsed >= self.opts.heartbeat_timeout_tick {
            self.heartbeat_elapsed = 0;
            let mut beat = Message::new(MessageKind::Beat);
            beat.from = self.opts.node_id;
            if let Err(err) = self.step(beat) {
                tracing::info!(node = %self.opts.node_id, "heartbeat tick: {err}");
            }
        }
    }

    // -------------------------- helpers --------------------------

    fn send(&mut self, m: Message) {
        self.msgs.push(m);
    }

    fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    fn quorum(&self) -> usize {
        self.opts.replicas.len() / 2 + 1
    }

    fn peers(&self) -> Vec<NodeId> {
        self.opts
            .replicas
            .iter()
            .copied()
            .filter(|replica| *replica != self.opts.node_id)
            .collect()
    }

    fn past_election_timeout(&self) -> bool {
        self.election_elapsed >= self.randomized_election_timeout
    }

    fn reset_randomized_election_timeout(&mut self) {
        // ThreadRng is a CSPRNG and thread-local, so concurrent resets across
        // groups never contend on a shared lock
        let timeout = self.opts.election_timeout_tick.max(1);
        self.randomized_election_timeout = timeout + rand::rng().random_range(0..timeout);
    }
}
