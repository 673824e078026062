//! Identity atoms.
//!
//! NodeId: cluster member id (0 = unknown/none)
//! Uid / DeviceId / ConnId: message sender identity
//! ChannelId + ChannelType: logical mailbox identity, canonicalized to a
//! ChannelKey for routing

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Cluster node identifier. Zero is reserved for "unknown": a channel whose
/// leader has not been resolved yet, or a consensus group with no leader.
/// `Default` is the unknown sentinel.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub const NONE: NodeId = NodeId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier. The connection layer authenticates uids before they reach
/// the reactor, so no shape is enforced here.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({:?})", self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device identifier within a uid's session set.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({:?})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection identifier on the node that accepted the client socket.
/// Zero means "no connection": a forwarded or system-originated message.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(i64);

impl ConnId {
    pub const NONE: ConnId = ConnId(0);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnId({})", self.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel kind. Wire values are fixed by the client protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ChannelType {
    Person = 1,
    Group = 2,
    CustomerService = 3,
    Community = 4,
    CommunityTopic = 5,
    Info = 6,
    Data = 7,
}

impl ChannelType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ChannelType::Person),
            2 => Some(ChannelType::Group),
            3 => Some(ChannelType::CustomerService),
            4 => Some(ChannelType::Community),
            5 => Some(ChannelType::CommunityTopic),
            6 => Some(ChannelType::Info),
            7 => Some(ChannelType::Data),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Channel identifier string as chosen by clients.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({:?})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical `(channel_id, channel_type)` key: `"{id}#{type}"`.
///
/// Used as the registry key inside a shard and as the hash input for shard
/// routing.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(channel_id: &ChannelId, channel_type: ChannelType) -> Self {
        Self(format!("{}#{}", channel_id.as_str(), channel_type.as_u8()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable in-process hash for shard routing.
    pub fn route_hash(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey({:?})", self.0)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_key_is_canonical() {
        let a = ChannelKey::new(&ChannelId::new("room1"), ChannelType::Group);
        let b = ChannelKey::new(&ChannelId::new("room1"), ChannelType::Group);
        let c = ChannelKey::new(&ChannelId::new("room1"), ChannelType::Person);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "room1#2");
    }

    #[test]
    fn route_hash_is_stable_per_key() {
        let a = ChannelKey::new(&ChannelId::new("room1"), ChannelType::Group);
        let b = ChannelKey::new(&ChannelId::new("room1"), ChannelType::Group);
        assert_eq!(a.route_hash(), b.route_hash());
    }

    #[test]
    fn channel_type_round_trips_wire_values() {
        for raw in 1..=7u8 {
            let ct = ChannelType::from_u8(raw).expect("valid channel type");
            assert_eq!(ct.as_u8(), raw);
        }
        assert_eq!(ChannelType::from_u8(0), None);
        assert_eq!(ChannelType::from_u8(8), None);
    }

    #[test]
    fn node_id_none_sentinel() {
        assert!(NodeId::NONE.is_none());
        assert!(!NodeId::new(3).is_none());
    }
}
