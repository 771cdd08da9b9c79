//! Writer operational statistics, readable from any thread.

use crate::error::FacadeError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Default)]
struct ErrorState {
    last_error_message: Option<String>,
    last_error: Option<Arc<FacadeError>>,
    last_error_timestamp_millis: i64,
}

#[derive(Default)]
struct DestinationState {
    actual_topic_arn: Option<String>,
    actual_stream_name: Option<String>,
    actual_log_group_name: Option<String>,
    actual_log_stream_name: Option<String>,
}

/// A point-in-time, immutable view of [`Statistics`], returned by
/// [`Statistics::snapshot`].
#[derive(Clone, Debug, Default)]
pub struct StatisticsSnapshot {
    pub messages_sent: i64,
    pub messages_discarded: i64,
    pub messages_requeued: i64,
    pub batch_count: i64,
    pub last_error_message: Option<String>,
    pub last_error_timestamp_millis: i64,
    pub actual_topic_arn: Option<String>,
    pub actual_stream_name: Option<String>,
    pub actual_log_group_name: Option<String>,
    pub actual_log_stream_name: Option<String>,
}

/// Mutable writer statistics. Counters are plain atomics; the error and
/// destination-name fields are grouped behind small mutexes since they
/// change together and are read far less often than the counters.
///
/// Cloning a `Statistics` handle shares the same underlying counters -
/// clone it to hand a read-only view to an observer thread.
#[derive(Clone, Default)]
pub struct Statistics {
    messages_sent: Arc<AtomicI64>,
    messages_discarded: Arc<AtomicI64>,
    messages_requeued: Arc<AtomicI64>,
    batch_count: Arc<AtomicI64>,
    error_state: Arc<Mutex<ErrorState>>,
    destination_state: Arc<Mutex<DestinationState>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, count: i64) {
        self.messages_sent.fetch_add(count, Ordering::AcqRel);
    }

    pub fn record_discarded(&self, count: i64) {
        self.messages_discarded.fetch_add(count, Ordering::AcqRel);
    }

    pub fn record_requeued(&self, count: i64) {
        self.messages_requeued.fetch_add(count, Ordering::AcqRel);
    }

    pub fn record_batch(&self) {
        self.batch_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a facade error with its cause chain, setting
    /// `last_error`/`last_error_message`. Errors a facade already recovers
    /// from internally (e.g. a refreshed sequence token) should not call
    /// this.
    pub fn record_error(&self, err: FacadeError) {
        let mut state = self.error_state.lock();
        state.last_error_message = Some(err.to_string());
        state.last_error = Some(Arc::new(err));
        state.last_error_timestamp_millis = now_millis();
    }

    /// Record a plain diagnostic message that isn't itself a `FacadeError`
    /// (e.g. noting pending messages discarded at shutdown).
    pub fn record_error_message(&self, message: impl Into<String>) {
        let mut state = self.error_state.lock();
        state.last_error_message = Some(message.into());
        state.last_error = None;
        state.last_error_timestamp_millis = now_millis();
    }

    pub fn set_actual_topic_arn(&self, arn: impl Into<String>) {
        self.destination_state.lock().actual_topic_arn = Some(arn.into());
    }

    pub fn set_actual_stream_name(&self, name: impl Into<String>) {
        self.destination_state.lock().actual_stream_name = Some(name.into());
    }

    pub fn set_actual_log_group_name(&self, name: impl Into<String>) {
        self.destination_state.lock().actual_log_group_name = Some(name.into());
    }

    pub fn set_actual_log_stream_name(&self, name: impl Into<String>) {
        self.destination_state.lock().actual_log_stream_name = Some(name.into());
    }

    pub fn messages_sent(&self) -> i64 {
        self.messages_sent.load(Ordering::Acquire)
    }

    pub fn messages_discarded(&self) -> i64 {
        self.messages_discarded.load(Ordering::Acquire)
    }

    pub fn messages_requeued(&self) -> i64 {
        self.messages_requeued.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<Arc<FacadeError>> {
        self.error_state.lock().last_error.clone()
    }

    /// Take an immutable snapshot suitable for handing to an observer.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let error_state = self.error_state.lock();
        let destination_state = self.destination_state.lock();
        StatisticsSnapshot {
            messages_sent: self.messages_sent(),
            messages_discarded: self.messages_discarded(),
            messages_requeued: self.messages_requeued(),
            batch_count: self.batch_count.load(Ordering::Acquire),
            last_error_message: error_state.last_error_message.clone(),
            last_error_timestamp_millis: error_state.last_error_timestamp_millis,
            actual_topic_arn: destination_state.actual_topic_arn.clone(),
            actual_stream_name: destination_state.actual_stream_name.clone(),
            actual_log_group_name: destination_state.actual_log_group_name.clone(),
            actual_log_stream_name: destination_state.actual_log_stream_name.clone(),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_visible_across_clones() {
        let stats = Statistics::new();
        let observer = stats.clone();

        stats.record_sent(3);
        stats.record_discarded(1);
        stats.record_requeued(2);

        assert_eq!(observer.messages_sent(), 3);
        assert_eq!(observer.messages_discarded(), 1);
        assert_eq!(observer.messages_requeued(), 2);
    }

    #[test]
    fn snapshot_includes_last_error() {
        let stats = Statistics::new();
        stats.record_error(FacadeError::MissingResource {
            name: "my-group".into(),
        });

        let snap = stats.snapshot();
        assert!(snap.last_error_message.unwrap().contains("my-group"));
        assert!(snap.last_error_timestamp_millis > 0);
    }
}
