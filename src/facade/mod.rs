//! `ServiceFacade`: the abstract contract implemented by the three
//! destination variants.

pub mod log_service;
pub mod stream_service;
pub mod test_support;
pub mod topic_service;

use crate::batch::BatchPolicy;
use crate::error::FacadeError;
use crate::message::Message;
use crate::retry::CancellationToken;
use crate::stats::Statistics;
use std::time::Instant;

/// What happened to one message inside a batch that was handed to
/// [`ServiceFacade::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerMessageOutcome {
    /// Delivered successfully.
    Sent,
    /// Transient failure (throttled, record-level rejection); the writer
    /// requeues this message at the head.
    Retry,
    /// Permanent failure (e.g. oversize after formatting); the writer
    /// discards this message.
    Fail,
}

/// A minimal wrapper over one destination service. All three variants
/// (group-and-stream log service, shard-partitioned stream, topic pub/sub)
/// implement this contract; the writer never inspects which variant it
/// holds.
///
/// Construction of whatever underlying transport a facade uses (client
/// region/endpoint/credentials) happens entirely outside this trait - the
/// writer receives an already-built facade and never constructs one
/// itself.
#[async_trait::async_trait]
pub trait ServiceFacade: Send + Sync {
    /// Ensure the destination exists and is in a usable state, optionally
    /// creating it first. Blocks (asynchronously) until either the
    /// destination is ready or `deadline` passes. The caller is responsible
    /// for recording resolved identifiers into statistics afterwards, via
    /// [`ServiceFacade::record_resolved_identifiers`].
    async fn initialize_destination(
        &self,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<(), FacadeError>;

    /// Attempt delivery of one batch, returning a per-message outcome in
    /// the same order as `batch`. A whole-batch failure (throttling,
    /// aborted, missing destination) is surfaced as `Err` instead - the
    /// writer treats every message in the batch as `Retry` in that case.
    async fn send(
        &self,
        batch: &[Message],
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<Vec<PerMessageOutcome>, FacadeError>;

    /// Release any held resources. Idempotent.
    async fn shutdown(&self);

    /// The batching shape rules (byte/count ceilings, per-message
    /// overhead) this destination enforces.
    fn batch_policy(&self) -> &dyn BatchPolicy;

    /// Whether `rotate()` has any effect for this destination. The topic
    /// facade has no stream name to rotate and returns `false`.
    fn supports_rotation(&self) -> bool {
        true
    }

    /// Recompute the destination name (via the substitution collaborator,
    /// applied by the caller) and re-initialize. No-op for facades with
    /// `supports_rotation() == false`.
    async fn rotate(
        &self,
        new_name: &str,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<(), FacadeError>;

    /// Record whatever destination identifier(s) this facade has resolved
    /// (group name, stream name, topic ARN, ...) into `stats`. The writer
    /// calls this after a successful `initialize_destination` or `rotate`;
    /// the default is a no-op for facades with nothing new to report.
    fn record_resolved_identifiers(&self, stats: &Statistics) {
        let _ = stats;
    }
}
