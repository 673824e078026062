//! Multi-replica consensus scenarios over an in-memory bus.

use std::collections::BTreeMap;

use bytes::Bytes;

use starling::consensus::{ConfigNode, ConsensusOptions, MessageKind, Role};
use starling::NodeId;

struct Cluster {
    nodes: BTreeMap<u64, ConfigNode>,
    /// Nodes currently cut off from the rest.
    partitioned: Vec<u64>,
}

impl Cluster {
    fn new(ids: &[u64]) -> Self {
        let replicas: Vec<NodeId> = ids.iter().map(|id| NodeId::new(*id)).collect();
        let nodes = ids
            .iter()
            .map(|id| {
                let node = ConfigNode::new(ConsensusOptions::new(
                    NodeId::new(*id),
                    replicas.clone(),
                ));
                (*id, node)
            })
            .collect();
        Self {
            nodes,
            partitioned: Vec::new(),
        }
    }

    fn node(&self, id: u64) -> &ConfigNode {
        &self.nodes[&id]
    }

    fn node_mut(&mut self, id: u64) -> &mut ConfigNode {
        self.nodes.get_mut(&id).expect("node exists")
    }

    fn partition(&mut self, id: u64) {
        self.partitioned.push(id);
    }

    /// Drains every node's ready messages and delivers them, repeating until
    /// the cluster quiesces. Partitioned nodes neither send nor receive.
    fn pump(&mut self) {
        for _ in 0..64 {
            let mut inflight = Vec::new();
            let ids: Vec<u64> = self.nodes.keys().copied().collect();
            for id in &ids {
                if self.partitioned.contains(id) {
                    continue;
                }
                let node = self.node_mut(*id);
                if !node.has_ready() {
                    continue;
                }
                let rd = node.ready();
                node.accept_ready(&rd);
                for msg in rd.messages {
                    // Apply is for the host, not the transport
                    if msg.kind == MessageKind::Apply {
                        continue;
                    }
                    if msg.to.is_none() || msg.to.get() == *id {
                        continue;
                    }
                    inflight.push(msg);
                }
            }
            if inflight.is_empty() {
                return;
            }
            for msg in inflight {
                let to = msg.to.get();
                if self.partitioned.contains(&to) {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(&to) {
                    // stale-term messages are reported and dropped
                    let _ = node.step(msg);
                }
            }
        }
    }

    fn tick_until_campaign(&mut self, id: u64) {
        for _ in 0..100 {
            self.node_mut(id).tick();
            self.pump();
            if self.node(id).role() != Role::Follower {
                return;
            }
        }
        panic!("replica {id} never campaigned");
    }

    fn leaders(&self) -> Vec<u64> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.role() == Role::Leader)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[test]
fn isolated_timeout_elects_a_single_leader() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.tick_until_campaign(1);
    cluster.pump();

    assert_eq!(cluster.leaders(), vec![1]);
    let term = cluster.node(1).state().term();
    for id in [2u64, 3] {
        assert_eq!(cluster.node(id).role(), Role::Follower);
        assert_eq!(cluster.node(id).state().term(), term);
        assert_eq!(cluster.node(id).state().leader(), NodeId::new(1));
    }
}

#[test]
fn propose_replicates_commits_and_applies() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.tick_until_campaign(1);
    cluster.pump();
    assert_eq!(cluster.leaders(), vec![1]);

    cluster
        .node_mut(1)
        .propose_config(7, Bytes::from_static(b"cfg-7"))
        .expect("propose");
    cluster.pump();

    let leader = cluster.node(1);
    assert_eq!(leader.local_config_version(), 7);
    assert_eq!(leader.committed_config_version(), 7);
    // pump() accepted the Ready carrying Apply, so the host has persisted it
    assert_eq!(leader.applied_config_version(), 7);

    for id in [2u64, 3] {
        let follower = cluster.node(id);
        assert_eq!(follower.local_config_version(), 7);
        assert_eq!(follower.config_data(), &Bytes::from_static(b"cfg-7"));
    }
}

#[test]
fn partitioned_majority_elects_new_leader_and_old_one_yields() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.tick_until_campaign(1);
    cluster.pump();
    assert_eq!(cluster.leaders(), vec![1]);
    let old_term = cluster.node(1).state().term();

    // cut the leader off; a follower times out and wins the majority side
    cluster.partition(1);
    cluster.tick_until_campaign(2);
    cluster.pump();

    assert_eq!(cluster.node(2).role(), Role::Leader);
    let new_term = cluster.node(2).state().term();
    assert!(new_term > old_term);

    // at most one leader exists per term
    let leaders = cluster.leaders();
    assert!(leaders.contains(&2));
    if leaders.contains(&1) {
        assert!(cluster.node(1).state().term() < new_term);
    }

    // heal: the old leader observes the higher term and steps down
    cluster.partitioned.clear();
    for _ in 0..5 {
        cluster.node_mut(2).tick();
        cluster.pump();
    }
    assert_eq!(cluster.node(1).role(), Role::Follower);
    assert_eq!(cluster.node(1).state().leader(), NodeId::new(2));
    assert_eq!(cluster.leaders(), vec![2]);
}

#[test]
fn lagging_follower_syncs_config_from_leader() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.tick_until_campaign(1);
    cluster.pump();

    // node 3 misses the proposal round
    cluster.partition(3);
    cluster
        .node_mut(1)
        .propose_config(5, Bytes::from_static(b"cfg-5"))
        .expect("propose");
    cluster.pump();
    assert_eq!(cluster.node(1).committed_config_version(), 5);
    assert_eq!(cluster.node(3).local_config_version(), 0);

    // back online: a heartbeat advertises version 5, the follower stages a
    // Sync, and the leader answers with the config
    cluster.partitioned.clear();
    for _ in 0..5 {
        cluster.node_mut(1).tick();
        cluster.pump();
    }
    assert_eq!(cluster.node(3).local_config_version(), 5);
    assert_eq!(cluster.node(3).config_data(), &Bytes::from_static(b"cfg-5"));
}
