//! Typed messages, sent directly or queued with a dispatch delay

use std::any::Any;

use crate::object::GameObjectHandle;

/// A value routed to component handlers by its concrete type. The sorting
/// key orders messages that become due at the same time: lower keys first
pub trait Message: Any + Send + Sync {
    fn sorting_key(&self) -> u32 {
        0
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Boilerplate impl of [Message] for plain message structs
#[macro_export]
macro_rules! impl_message {
    ($ty:ty) => {
        impl $crate::Message for $ty {
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }
    };
    ($ty:ty, sorting_key: $key:expr) => {
        impl $crate::Message for $ty {
            fn sorting_key(&self) -> u32 {
                $key
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }
    };
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageQueueKind {
    /// Dispatches during the current (or next) update once its time is due
    ThisFrame,
    /// Never dispatches in the update it was posted from
    NextFrame,
    /// Additionally waits until the target's components are initialized
    AfterInitialized,
}

pub(crate) struct QueuedMessage {
    pub dispatch_time: f64,
    pub queued_frame: u64,
    pub seq: u64,
    pub kind: MessageQueueKind,
    pub target: GameObjectHandle,
    pub message: Box<dyn Message>,
}

/// Per-world queue of timed messages
#[derive(Default)]
pub(crate) struct MessageQueue {
    queued: Vec<QueuedMessage>,
    seq: u64,
}

impl MessageQueue {
    pub fn post(
        &mut self,
        target: GameObjectHandle,
        message: Box<dyn Message>,
        delay: f64,
        kind: MessageQueueKind,
        now: f64,
        frame: u64,
    ) {
        self.seq += 1;
        self.queued.push(QueuedMessage {
            dispatch_time: now + delay,
            queued_frame: frame,
            seq: self.seq,
            kind,
            target,
            message,
        });
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Pulls every message due at `now`, ordered by due time, then sorting
    /// key, then post order. `initialized` gates AfterInitialized messages
    pub fn take_due(
        &mut self,
        now: f64,
        frame: u64,
        initialized: impl Fn(GameObjectHandle) -> bool,
    ) -> Vec<QueuedMessage> {
        let mut due = Vec::new();
        let mut keep = Vec::with_capacity(self.queued.len());

        for message in self.queued.drain(..) {
            let time_due = message.dispatch_time <= now;
            let frame_ok = match message.kind {
                MessageQueueKind::ThisFrame => true,
                MessageQueueKind::NextFrame | MessageQueueKind::AfterInitialized => {
                    frame > message.queued_frame
                }
            };
            let init_ok = match message.kind {
                MessageQueueKind::AfterInitialized => initialized(message.target),
                _ => true,
            };

            if time_due && frame_ok && init_ok {
                due.push(message);
            } else {
                keep.push(message);
            }
        }
        self.queued = keep;

        due.sort_by(|a, b| {
            a.dispatch_time
                .partial_cmp(&b.dispatch_time)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.message.sorting_key().cmp(&b.message.sorting_key()))
                .then(a.seq.cmp(&b.seq))
        });
        due
    }

    /// Messages aimed at destroyed objects are dropped silently
    pub fn drop_for_target(&mut self, target: GameObjectHandle) {
        self.queued.retain(|m| m.target != target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{RawHandle, TypedHandle};

    struct Ping(u32);
    impl Message for Ping {
        fn sorting_key(&self) -> u32 {
            self.0
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn fake_handle() -> GameObjectHandle {
        TypedHandle::from_raw(RawHandle::from_bits(42))
    }

    #[test]
    fn due_messages_sort_by_key() {
        let mut queue = MessageQueue::default();
        let target = fake_handle();

        queue.post(target, Box::new(Ping(5)), 0.0, MessageQueueKind::ThisFrame, 0.0, 1);
        queue.post(target, Box::new(Ping(1)), 0.0, MessageQueueKind::ThisFrame, 0.0, 1);
        queue.post(target, Box::new(Ping(3)), 0.0, MessageQueueKind::ThisFrame, 0.0, 1);

        let due = queue.take_due(0.1, 1, |_| true);
        let keys: Vec<u32> = due.iter().map(|m| m.message.sorting_key()).collect();
        assert_eq!(keys, [1, 3, 5]);
    }

    #[test]
    fn delayed_messages_wait_for_their_time() {
        let mut queue = MessageQueue::default();
        let target = fake_handle();

        queue.post(target, Box::new(Ping(0)), 2.0, MessageQueueKind::ThisFrame, 10.0, 1);

        assert!(queue.take_due(11.0, 2, |_| true).is_empty());
        assert_eq!(queue.take_due(12.0, 3, |_| true).len(), 1);
    }

    #[test]
    fn next_frame_never_dispatches_same_frame() {
        let mut queue = MessageQueue::default();
        let target = fake_handle();

        queue.post(target, Box::new(Ping(0)), 0.0, MessageQueueKind::NextFrame, 0.0, 5);

        assert!(queue.take_due(100.0, 5, |_| true).is_empty());
        assert_eq!(queue.take_due(100.0, 6, |_| true).len(), 1);
    }

    #[test]
    fn dead_targets_drop_silently() {
        let mut queue = MessageQueue::default();
        let target = fake_handle();

        queue.post(target, Box::new(Ping(0)), 0.0, MessageQueueKind::ThisFrame, 0.0, 1);
        queue.drop_for_target(target);
        assert_eq!(queue.len(), 0);
    }
}
