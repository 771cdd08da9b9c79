//! Bounded multi-producer/single-consumer message queue.

use crate::message::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// What to do when the queue is at its threshold and a new message arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardAction {
    /// Drop the oldest queued message to make room for the new one.
    Oldest,
    /// Drop the incoming message, leaving the queue untouched.
    Newest,
    /// Never discard; the queue grows without bound.
    None,
}

impl Default for DiscardAction {
    fn default() -> Self {
        DiscardAction::Oldest
    }
}

/// Result of an `enqueue` call: whether the message was appended, and
/// whatever was discarded as a side effect (if anything). The queue itself
/// never touches statistics - the caller (the writer) uses this outcome to
/// update counters.
#[derive(Debug)]
pub struct EnqueueOutcome {
    pub appended: bool,
    pub discarded: Option<Message>,
}

struct Inner {
    deque: VecDeque<Message>,
    threshold: i32,
    action: DiscardAction,
}

/// A FIFO queue of [`Message`] shared between many producer threads and a
/// single consumer (the writer's background thread).
///
/// Enqueue/requeue are safe to call concurrently with each other and with
/// `dequeue`. `dequeue` is intended to be called from exactly one thread at
/// a time; calling it concurrently from multiple threads will not corrupt
/// state but may steal messages from each other in an unspecified order.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl MessageQueue {
    /// Create a queue with the given discard threshold and action.
    pub fn new(threshold: i32, action: DiscardAction) -> Self {
        Self {
            inner: Mutex::new(Inner {
                deque: VecDeque::new(),
                threshold,
                action,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Append to the tail, applying the discard policy if the queue is at
    /// its threshold. O(1).
    pub fn enqueue(&self, msg: Message) -> EnqueueOutcome {
        let mut inner = self.inner.lock();

        let at_threshold = inner.deque.len() as i64 >= inner.threshold.max(0) as i64;

        let outcome = if at_threshold {
            match inner.action {
                DiscardAction::Oldest => {
                    let discarded = inner.deque.pop_front();
                    inner.deque.push_back(msg);
                    EnqueueOutcome {
                        appended: true,
                        discarded,
                    }
                }
                DiscardAction::Newest => EnqueueOutcome {
                    appended: false,
                    discarded: Some(msg),
                },
                DiscardAction::None => {
                    inner.deque.push_back(msg);
                    EnqueueOutcome {
                        appended: true,
                        discarded: None,
                    }
                }
            }
        } else {
            inner.deque.push_back(msg);
            EnqueueOutcome {
                appended: true,
                discarded: None,
            }
        };

        drop(inner);
        self.not_empty.notify_one();
        outcome
    }

    /// Insert at the head, bypassing the threshold. Always succeeds. Used
    /// by the writer to restore a single unsent message in order. O(1).
    pub fn requeue(&self, msg: Message) {
        let mut inner = self.inner.lock();
        inner.deque.push_front(msg);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Insert a list at the head so that `list[0]` becomes the new head.
    /// O(n).
    pub fn requeue_all(&self, list: Vec<Message>) {
        if list.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for msg in list.into_iter().rev() {
            inner.deque.push_front(msg);
        }
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Wait up to `timeout` for a message to become available and remove
    /// it. Returns `None` on timeout. A zero or negative-equivalent
    /// timeout never blocks: it checks once and returns immediately.
    pub fn dequeue(&self, timeout: Duration) -> Option<Message> {
        let mut inner = self.inner.lock();

        if let Some(msg) = inner.deque.pop_front() {
            return Some(msg);
        }

        if timeout.is_zero() {
            return None;
        }

        self.not_empty.wait_for(&mut inner, timeout);
        inner.deque.pop_front()
    }

    /// Whether the queue currently holds no messages.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().deque.is_empty()
    }

    /// Current number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().deque.len()
    }

    /// Update the discard threshold; takes effect on the next enqueue.
    pub fn set_threshold(&self, threshold: i32) {
        self.inner.lock().threshold = threshold;
    }

    /// Update the discard action; takes effect on the next enqueue.
    pub fn set_action(&self, action: DiscardAction) {
        self.inner.lock().action = action;
    }

    /// Snapshot the threshold/action pair, mostly useful for tests.
    pub fn policy(&self) -> (i32, DiscardAction) {
        let inner = self.inner.lock();
        (inner.threshold, inner.action)
    }

    /// Drain and return every queued message, in FIFO order. Used when a
    /// writer transitions to `InitFailed` and must discard everything held
    /// so far.
    pub fn drain_all(&self) -> Vec<Message> {
        let mut inner = self.inner.lock();
        inner.deque.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: i64, text: &str) -> Message {
        Message::new(n, text)
    }

    #[test]
    fn discard_oldest_keeps_threshold() {
        // Scenario 7: threshold=10, action=oldest, enqueue m0..m19.
        let q = MessageQueue::new(10, DiscardAction::Oldest);
        let mut discarded = 0;
        for i in 0..20 {
            let outcome = q.enqueue(msg(i, &format!("m{i}")));
            if outcome.discarded.is_some() {
                discarded += 1;
            }
        }

        assert_eq!(discarded, 10);
        assert_eq!(q.len(), 10);

        for i in 10..20 {
            let m = q.dequeue(Duration::ZERO).unwrap();
            assert_eq!(m.text(), format!("m{i}"));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn discard_newest_drops_incoming() {
        let q = MessageQueue::new(2, DiscardAction::Newest);
        assert!(q.enqueue(msg(0, "a")).appended);
        assert!(q.enqueue(msg(1, "b")).appended);
        let outcome = q.enqueue(msg(2, "c"));
        assert!(!outcome.appended);
        assert_eq!(q.len(), 2);

        let first = q.dequeue(Duration::ZERO).unwrap();
        assert_eq!(first.text(), "a");
    }

    #[test]
    fn action_none_grows_unbounded() {
        let q = MessageQueue::new(1, DiscardAction::None);
        for i in 0..50 {
            assert!(q.enqueue(msg(i, "x")).appended);
        }
        assert_eq!(q.len(), 50);
    }

    #[test]
    fn requeue_all_preserves_order_at_head() {
        let q = MessageQueue::new(0, DiscardAction::None);
        q.enqueue(msg(3, "later"));
        q.requeue_all(vec![msg(0, "r0"), msg(1, "r1"), msg(2, "r2")]);

        assert_eq!(q.dequeue(Duration::ZERO).unwrap().text(), "r0");
        assert_eq!(q.dequeue(Duration::ZERO).unwrap().text(), "r1");
        assert_eq!(q.dequeue(Duration::ZERO).unwrap().text(), "r2");
        assert_eq!(q.dequeue(Duration::ZERO).unwrap().text(), "later");
    }

    #[test]
    fn dequeue_zero_timeout_does_not_block_when_empty() {
        let q = MessageQueue::new(0, DiscardAction::None);
        assert!(q.dequeue(Duration::ZERO).is_none());
    }
}
