//! Cluster configuration consensus.
//!
//! Provides:
//! - `ConfigNode` - per-group replicated agreement on a config version
//! - `Message`/`Ready` - the tick-driven, message-in/message-out interface
//!
//! The host owns transport and persistence: it feeds inbound messages to
//! `ConfigNode::step`, calls `tick` on a timer, and drains
//! `ready`/`accept_ready`.

mod message;
mod node;

pub use message::{Message, MessageKind, Ready};
pub use node::{ConfigNode, ConsensusOptions, Role, State, StepError};
