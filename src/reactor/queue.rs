//! Bounded action queue feeding a shard.
//!
//! Producers run on other shards or worker threads; an enqueue that cannot
//! complete immediately fails instead of blocking, so a full shard can never
//! deadlock its producers.

use crossbeam::channel::{Receiver, Sender, TrySendError};

use super::action::ChannelAction;

#[derive(Clone)]
pub struct ActionQueue {
    tx: Sender<ChannelAction>,
    rx: Receiver<ChannelAction>,
}

impl ActionQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam::channel::bounded(capacity);
        Self { tx, rx }
    }

    /// Returns false when the queue is full (or the shard is gone); the
    /// action is dropped and the caller decides whether to warn.
    pub fn add(&self, action: ChannelAction) -> bool {
        match self.tx.try_send(action) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Drains everything currently queued without blocking.
    pub fn drain_into(&self, out: &mut Vec<ChannelAction>) {
        while let Ok(action) = self.rx.try_recv() {
            out.push(action);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelId, ChannelType, NodeId};
    use crate::reactor::action::ActionKind;

    fn action() -> ChannelAction {
        ChannelAction {
            channel_id: ChannelId::new("ch"),
            channel_type: ChannelType::Group,
            unique_no: None,
            kind: ActionKind::LeaderChange {
                leader_id: NodeId::new(2),
            },
        }
    }

    #[test]
    fn overflow_returns_false_and_never_blocks() {
        let queue = ActionQueue::new(2);
        assert!(queue.add(action()));
        assert!(queue.add(action()));
        assert!(!queue.add(action()));

        let mut drained = Vec::new();
        queue.drain_into(&mut drained);
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
