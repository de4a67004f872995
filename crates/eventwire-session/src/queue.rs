use std::collections::VecDeque;

use bytes::Bytes;

use crate::config::OverflowPolicy;

/// An encoded frame waiting for its channel to open.
#[derive(Debug, Clone)]
pub(crate) struct QueuedFrame {
    pub channel: String,
    pub bytes: Bytes,
    /// Correlation id when the frame is an ack request.
    pub ack: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest frame.
    Evicted(QueuedFrame),
    /// The new frame was discarded.
    Dropped(QueuedFrame),
    /// The new frame was refused; the send should fail.
    Rejected,
}

/// Bounded FIFO of outbound frames, shared by all channels of a connection.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    items: VecDeque<QueuedFrame>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            policy,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn push(&mut self, item: QueuedFrame) -> PushOutcome {
        if self.items.len() < self.capacity {
            self.items.push_back(item);
            return PushOutcome::Queued;
        }
        match self.policy {
            OverflowPolicy::DropOldest => match self.items.pop_front() {
                Some(oldest) => {
                    self.items.push_back(item);
                    PushOutcome::Evicted(oldest)
                }
                None => PushOutcome::Dropped(item),
            },
            OverflowPolicy::DropNewest => PushOutcome::Dropped(item),
            OverflowPolicy::Reject => PushOutcome::Rejected,
        }
    }

    /// Remove and return every frame for `channel`, oldest first.
    pub(crate) fn take_channel(&mut self, channel: &str) -> Vec<QueuedFrame> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if item.channel == channel {
                taken.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        taken
    }

    /// Put frames back at the front, preserving their order.
    pub(crate) fn restore_front(&mut self, items: Vec<QueuedFrame>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub(crate) fn clear(&mut self) -> Vec<QueuedFrame> {
        self.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: &str, n: u8) -> QueuedFrame {
        QueuedFrame {
            channel: channel.to_string(),
            bytes: Bytes::from(vec![n]),
            ack: None,
        }
    }

    fn tags(items: &[QueuedFrame]) -> Vec<u8> {
        items.iter().map(|item| item.bytes[0]).collect()
    }

    #[test]
    fn drop_oldest_evicts_front() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        assert!(matches!(queue.push(frame("/", 1)), PushOutcome::Queued));
        assert!(matches!(queue.push(frame("/", 2)), PushOutcome::Queued));
        match queue.push(frame("/", 3)) {
            PushOutcome::Evicted(old) => assert_eq!(old.bytes[0], 1),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(tags(&queue.take_channel("/")), vec![2, 3]);
    }

    #[test]
    fn drop_newest_and_reject_keep_contents() {
        for policy in [OverflowPolicy::DropNewest, OverflowPolicy::Reject] {
            let mut queue = OutboundQueue::new(1, policy);
            queue.push(frame("/", 1));
            let outcome = queue.push(frame("/", 2));
            match policy {
                OverflowPolicy::DropNewest => assert!(matches!(outcome, PushOutcome::Dropped(_))),
                _ => assert!(matches!(outcome, PushOutcome::Rejected)),
            }
            assert_eq!(queue.len(), 1);
        }
    }

    #[test]
    fn zero_capacity_never_queues() {
        let mut queue = OutboundQueue::new(0, OverflowPolicy::DropOldest);
        assert!(matches!(queue.push(frame("/", 1)), PushOutcome::Dropped(_)));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn take_channel_preserves_order_and_others() {
        let mut queue = OutboundQueue::new(10, OverflowPolicy::DropOldest);
        for (channel, n) in [("/a", 1), ("/b", 2), ("/a", 3), ("/b", 4)] {
            queue.push(frame(channel, n));
        }
        assert_eq!(tags(&queue.take_channel("/a")), vec![1, 3]);
        let rest = queue.take_channel("/b");
        assert_eq!(tags(&rest), vec![2, 4]);
        queue.restore_front(rest);
        assert_eq!(tags(&queue.clear()), vec![2, 4]);
    }
}
