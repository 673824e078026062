#![forbid(unsafe_code)]

//! Core message-processing pipeline and per-group config consensus of a
//! distributed instant-messaging broker.
//!
//! Two subsystems:
//! - [`reactor`]: per-channel state machines driven by sharded event loops,
//!   with stage workers for decrypt, leader forwarding, permission checks,
//!   storage, acknowledgement, and delivery fan-out.
//! - [`consensus`]: a leader-elected replicated state machine agreeing on a
//!   monotonic cluster-configuration version per replica group.
//!
//! The wire codec, durable log, transport, tag manager, connection registry,
//! and process bootstrap are collaborators reached through the traits in
//! [`reactor::deps`].

pub mod config;
pub mod consensus;
pub mod core;
pub mod error;
pub mod metrics;
pub mod reactor;
pub mod telemetry;
pub mod test_harness;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::core::{
    AppendResult, ChannelId, ChannelInfo, ChannelKey, ChannelType, ConnId, DeviceId, Framer,
    NodeId, PendingMessage, Reason, ReasonCode, SendPacket, SendackPacket, StoredMessage, Uid,
};
pub use consensus::{ConfigNode, ConsensusOptions};
pub use reactor::{Deps, Reactor, ReactorOptions};
