//! In-memory fake [`ServiceFacade`] implementations used by writer tests
//! to exercise partial-failure, sequence-token-recovery, and discard
//! scenarios without a real network call.

use crate::batch::BatchPolicy;
use crate::error::FacadeError;
use crate::facade::{PerMessageOutcome, ServiceFacade};
use crate::message::Message;
use crate::retry::CancellationToken;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

struct FakePolicy {
    max_bytes: usize,
    max_count: usize,
}

impl BatchPolicy for FakePolicy {
    fn effective_size(&self, msg: &Message) -> usize {
        msg.byte_length()
    }

    fn within_limits(&self, batch_bytes: usize, batch_count: usize) -> bool {
        batch_bytes <= self.max_bytes && batch_count <= self.max_count
    }
}

/// A facade double whose behavior is configured up front, then driven
/// entirely in memory. Every `send` call is recorded so a test can assert
/// on what the writer actually delivered and in what order.
pub struct FakeFacade {
    policy: FakePolicy,
    sent: Mutex<Vec<Message>>,
    send_calls: AtomicUsize,
    init_calls: AtomicUsize,
    /// Timestamps of messages to reject with `PerMessageOutcome::Retry`
    /// the first time they are seen (simulating per-record rejection,
    /// e.g. "positions {1,4,7}" in a boundary scenario). Once a rejected
    /// message reappears in a later `send` call it succeeds.
    reject_once: Mutex<HashSet<i64>>,
    /// When true, the next `send` call fails the whole batch with
    /// `FacadeError::InvalidSequenceToken`; cleared after firing once.
    invalidate_sequence_once: AtomicBool,
    /// When set, `initialize_destination` fails with this error exactly
    /// once, then succeeds on the next attempt.
    init_fails_once: Mutex<Option<FacadeError>>,
    supports_rotation: bool,
}

impl Default for FakeFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeFacade {
    pub fn new() -> Self {
        Self {
            policy: FakePolicy {
                max_bytes: usize::MAX,
                max_count: usize::MAX,
            },
            sent: Mutex::new(Vec::new()),
            send_calls: AtomicUsize::new(0),
            init_calls: AtomicUsize::new(0),
            reject_once: Mutex::new(HashSet::new()),
            invalidate_sequence_once: AtomicBool::new(false),
            init_fails_once: Mutex::new(None),
            supports_rotation: true,
        }
    }

    pub fn with_batch_limits(mut self, max_bytes: usize, max_count: usize) -> Self {
        self.policy = FakePolicy { max_bytes, max_count };
        self
    }

    /// Reject (as `Retry`) every message whose timestamp is in `positions`
    /// the first time it is presented to `send`.
    pub fn with_reject_once(self, positions: impl IntoIterator<Item = i64>) -> Self {
        *self.reject_once.lock() = positions.into_iter().collect();
        self
    }

    pub fn with_invalid_sequence_token_once(self) -> Self {
        self.invalidate_sequence_once.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_init_failure_once(self, err: FacadeError) -> Self {
        *self.init_fails_once.lock() = Some(err);
        self
    }

    pub fn without_rotation_support(mut self) -> Self {
        self.supports_rotation = false;
        self
    }

    /// Messages accepted across every `send` call so far, in delivery
    /// order.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn send_call_count(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn init_call_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ServiceFacade for FakeFacade {
    async fn initialize_destination(
        &self,
        _deadline: Instant,
        _token: &CancellationToken,
    ) -> Result<(), FacadeError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.init_fails_once.lock().take() {
            return Err(err);
        }
        Ok(())
    }

    async fn send(
        &self,
        batch: &[Message],
        _deadline: Instant,
        _token: &CancellationToken,
    ) -> Result<Vec<PerMessageOutcome>, FacadeError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);

        if self.invalidate_sequence_once.swap(false, Ordering::SeqCst) {
            return Err(FacadeError::InvalidSequenceToken);
        }

        let mut reject_once = self.reject_once.lock();
        let mut outcomes = Vec::with_capacity(batch.len());
        for msg in batch {
            if reject_once.remove(&msg.timestamp()) {
                outcomes.push(PerMessageOutcome::Retry);
            } else {
                self.sent.lock().push(msg.clone());
                outcomes.push(PerMessageOutcome::Sent);
            }
        }
        Ok(outcomes)
    }

    async fn shutdown(&self) {}

    fn batch_policy(&self) -> &dyn BatchPolicy {
        &self.policy
    }

    fn supports_rotation(&self) -> bool {
        self.supports_rotation
    }

    async fn rotate(
        &self,
        _new_name: &str,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<(), FacadeError> {
        self.initialize_destination(deadline, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::CancellationToken;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn accepts_all_messages_by_default() {
        let facade = FakeFacade::new();
        let token = CancellationToken::new();
        let batch = vec![Message::new(1, "a"), Message::new(2, "b")];
        let outcomes = facade.send(&batch, far_deadline(), &token).await.unwrap();
        assert_eq!(outcomes, vec![PerMessageOutcome::Sent, PerMessageOutcome::Sent]);
        assert_eq!(facade.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn rejects_configured_positions_once_then_accepts_on_retry() {
        let facade = FakeFacade::new().with_reject_once([2]);
        let token = CancellationToken::new();
        let batch = vec![Message::new(1, "a"), Message::new(2, "b"), Message::new(3, "c")];
        let first = facade.send(&batch, far_deadline(), &token).await.unwrap();
        assert_eq!(
            first,
            vec![PerMessageOutcome::Sent, PerMessageOutcome::Retry, PerMessageOutcome::Sent]
        );

        let retry_batch = vec![Message::new(2, "b")];
        let second = facade.send(&retry_batch, far_deadline(), &token).await.unwrap();
        assert_eq!(second, vec![PerMessageOutcome::Sent]);
        assert_eq!(facade.sent_messages().len(), 3);
    }

    #[tokio::test]
    async fn invalid_sequence_token_fires_once() {
        let facade = FakeFacade::new().with_invalid_sequence_token_once();
        let token = CancellationToken::new();
        let batch = vec![Message::new(1, "a")];

        let first = facade.send(&batch, far_deadline(), &token).await;
        assert!(matches!(first, Err(FacadeError::InvalidSequenceToken)));

        let second = facade.send(&batch, far_deadline(), &token).await.unwrap();
        assert_eq!(second, vec![PerMessageOutcome::Sent]);
    }

    #[tokio::test]
    async fn init_failure_fires_once_then_succeeds() {
        let facade = FakeFacade::new().with_init_failure_once(FacadeError::MissingResource {
            name: "gone".into(),
        });
        let token = CancellationToken::new();

        let first = facade.initialize_destination(far_deadline(), &token).await;
        assert!(matches!(first, Err(FacadeError::MissingResource { .. })));

        let second = facade.initialize_destination(far_deadline(), &token).await;
        assert!(second.is_ok());
        assert_eq!(facade.init_call_count(), 2);
    }
}
