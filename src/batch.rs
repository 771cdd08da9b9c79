//! Batch assembly from the message queue.

use crate::message::Message;
use crate::queue::MessageQueue;
use std::time::{Duration, Instant};

/// Per-service shape rules a [`Batcher`] enforces while assembling a batch.
///
/// `effective_size` lets a facade account for protocol overhead (e.g. the
/// group-and-stream service's 26 bytes of per-message overhead, or a
/// shard-partitioned stream's partition-key bytes) without the batcher
/// itself knowing about any particular wire format.
pub trait BatchPolicy {
    /// The byte cost this message contributes toward the batch's byte
    /// budget, including any per-message protocol overhead.
    fn effective_size(&self, msg: &Message) -> usize;

    /// Whether a batch with the given accumulated byte total and message
    /// count is still within this service's limits.
    fn within_limits(&self, batch_bytes: usize, batch_count: usize) -> bool;
}

/// Assembles batches from a [`MessageQueue`] subject to a [`BatchPolicy`].
///
/// The first message in a batch is never rejected by the limits check - the
/// writer is responsible for rejecting oversize messages at enqueue time;
/// `Batcher` assumes whatever it dequeues first already satisfies the
/// per-message size rule.
pub struct Batcher;

impl Batcher {
    /// Build one batch.
    ///
    /// Waits up to `first_message_deadline` for a first message; if none
    /// arrives, returns an empty batch. Otherwise accumulates messages
    /// until either the policy's limits would be exceeded (the offending
    /// message is pushed back to the head of the queue) or
    /// `batch_delay` elapses since the batch started, whichever comes
    /// first.
    pub fn build_batch(
        queue: &MessageQueue,
        first_message_deadline: Duration,
        batch_delay: Duration,
        policy: &dyn BatchPolicy,
    ) -> Vec<Message> {
        let first = match queue.dequeue(first_message_deadline) {
            Some(msg) => msg,
            None => return Vec::new(),
        };

        let mut batch_bytes = policy.effective_size(&first);
        let mut batch = vec![first];
        let batch_deadline = Instant::now() + batch_delay;

        loop {
            let remaining = batch_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return batch;
            }

            let next = match queue.dequeue(remaining) {
                Some(msg) => msg,
                None => return batch,
            };

            let candidate_bytes = batch_bytes + policy.effective_size(&next);
            let candidate_count = batch.len() + 1;

            if !policy.within_limits(candidate_bytes, candidate_count) {
                queue.requeue(next);
                return batch;
            }

            batch_bytes = candidate_bytes;
            batch.push(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DiscardAction;

    struct CountLimit {
        max_count: usize,
        max_bytes: usize,
    }

    impl BatchPolicy for CountLimit {
        fn effective_size(&self, msg: &Message) -> usize {
            msg.byte_length()
        }

        fn within_limits(&self, batch_bytes: usize, batch_count: usize) -> bool {
            batch_bytes <= self.max_bytes && batch_count <= self.max_count
        }
    }

    #[test]
    fn batches_by_count() {
        // Scenario 3: count limit 500, 750 one-byte messages -> 500 then 250.
        let queue = MessageQueue::new(0, DiscardAction::None);
        for i in 0..750 {
            queue.enqueue(Message::new(i, "x"));
        }

        let policy = CountLimit {
            max_count: 500,
            max_bytes: usize::MAX,
        };

        let first = Batcher::build_batch(&queue, Duration::from_millis(50), Duration::ZERO, &policy);
        assert_eq!(first.len(), 500);

        let second = Batcher::build_batch(&queue, Duration::from_millis(50), Duration::ZERO, &policy);
        assert_eq!(second.len(), 250);

        let third = Batcher::build_batch(&queue, Duration::from_millis(10), Duration::ZERO, &policy);
        assert!(third.is_empty());
    }

    #[test]
    fn batches_by_bytes_with_partition_key_overhead() {
        // Scenario 4: 200 messages of 32768 bytes, "bargle" partition key (6 bytes).
        struct StreamPolicy;
        impl BatchPolicy for StreamPolicy {
            fn effective_size(&self, msg: &Message) -> usize {
                msg.byte_length() + 6
            }
            fn within_limits(&self, batch_bytes: usize, batch_count: usize) -> bool {
                batch_bytes <= 5_242_880 && batch_count <= 500
            }
        }

        let queue = MessageQueue::new(0, DiscardAction::None);
        let payload = "x".repeat(32_768);
        for i in 0..200 {
            queue.enqueue(Message::new(i, payload.clone()));
        }

        let policy = StreamPolicy;
        let first = Batcher::build_batch(&queue, Duration::from_millis(50), Duration::ZERO, &policy);
        assert_eq!(first.len(), 160);

        let second = Batcher::build_batch(&queue, Duration::from_millis(50), Duration::ZERO, &policy);
        assert_eq!(second.len(), 40);
    }

    #[test]
    fn empty_queue_returns_empty_batch() {
        let queue = MessageQueue::new(0, DiscardAction::None);
        let policy = CountLimit {
            max_count: 10,
            max_bytes: 100,
        };
        let batch = Batcher::build_batch(&queue, Duration::from_millis(20), Duration::from_millis(20), &policy);
        assert!(batch.is_empty());
    }
}
