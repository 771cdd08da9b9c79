//! The writer state machine: owns the message queue, drives a
//! background thread (or, in synchronous mode, the caller's thread)
//! through batch assembly and delivery, and exposes the external interface
//! host applications construct and call into.

use crate::batch::{BatchPolicy, Batcher};
use crate::config::{RotationTrigger, WriterConfig};
use crate::error::{FacadeError, WriterError};
use crate::facade::ServiceFacade;
use crate::facade::PerMessageOutcome;
use crate::logger::InternalLogger;
use crate::message::Message;
use crate::queue::{DiscardAction, EnqueueOutcome, MessageQueue};
use crate::retry::{BackoffMode, CancellationToken, JitterMode, RetryError, RetryManager};
use crate::stats::{Statistics, StatisticsSnapshot};
use crate::substitutions::Substitutions;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Once, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const FIRST_MESSAGE_WAIT: Duration = Duration::from_millis(500);
const FIRST_MESSAGE_WAIT_DRAINING: Duration = Duration::from_millis(50);
const BATCH_SEND_TIMEOUT: Duration = Duration::from_secs(30);
const ROTATION_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BASE_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle states a [`Writer`] moves through. There is no
/// transition back to `Created`: a writer that fails or stops is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    Created,
    Initializing,
    Running,
    Draining,
    Terminated,
    InitFailed,
}

struct WriterShared {
    queue: MessageQueue,
    facade: Arc<dyn ServiceFacade>,
    stats: Statistics,
    logger: Arc<dyn InternalLogger>,
    config: Mutex<WriterConfig>,
    rotation: Option<RotationTrigger>,
    name_template: Option<String>,
    substitutions: Option<Arc<dyn Substitutions>>,
    state: Mutex<WriterState>,
    cancellation: CancellationToken,
    runtime: tokio::runtime::Runtime,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_deadline: Mutex<Option<Instant>>,
    messages_since_rotation: AtomicI64,
    last_rotation: Mutex<Instant>,
    last_rotation_bucket: Mutex<String>,
}

/// A handle to a running (or not-yet-started) writer. Cheap to clone - every
/// clone shares the same background thread and queue, matching
/// `tracing_appender`'s guard-handle split: hold a [`ShutdownGuard`]
/// (obtained via [`Writer::shutdown_guard`]) for as long as the process
/// should keep flushing on exit.
#[derive(Clone)]
pub struct Writer(Arc<WriterShared>);

impl Writer {
    /// Construct a writer bound to `facade`. Does not start it - call
    /// [`Writer::start`] once, typically right after construction.
    pub fn new(
        config: WriterConfig,
        facade: Arc<dyn ServiceFacade>,
        logger: Arc<dyn InternalLogger>,
    ) -> Result<Self, WriterError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| {
                WriterError::InitializationFailed(FacadeError::Unexpected { source: Box::new(e) })
            })?;

        let queue = MessageQueue::new(config.discard_threshold, config.discard_action);

        let shared = WriterShared {
            queue,
            facade,
            stats: Statistics::new(),
            logger,
            config: Mutex::new(config),
            rotation: None,
            name_template: None,
            substitutions: None,
            state: Mutex::new(WriterState::Created),
            cancellation: CancellationToken::new(),
            runtime,
            thread: Mutex::new(None),
            shutdown_deadline: Mutex::new(None),
            messages_since_rotation: AtomicI64::new(0),
            last_rotation: Mutex::new(Instant::now()),
            last_rotation_bucket: Mutex::new(String::new()),
        };

        Ok(Writer(Arc::new(shared)))
    }

    /// Enable rotation. Must be called before [`Writer::start`] -
    /// the underlying facade must already support it
    /// (`facade.supports_rotation()`), otherwise rotation attempts are
    /// silently skipped at runtime.
    pub fn with_rotation(
        mut self,
        trigger: RotationTrigger,
        name_template: impl Into<String>,
        substitutions: Arc<dyn Substitutions>,
    ) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.0) {
            shared.rotation = Some(trigger);
            shared.name_template = Some(name_template.into());
            shared.substitutions = Some(substitutions);
        }
        self
    }

    /// Initialize the destination and, in asynchronous mode, spawn the
    /// background thread. Blocks the caller until initialization either
    /// succeeds or `init_timeout` elapses.
    pub fn start(&self, init_timeout: Duration) -> Result<(), WriterError> {
        {
            let mut state = self.0.state.lock();
            if *state != WriterState::Created {
                return Err(WriterError::AlreadyStarted);
            }
            *state = WriterState::Initializing;
        }

        let deadline = Instant::now() + init_timeout;
        let result = self
            .0
            .runtime
            .block_on(self.0.facade.initialize_destination(deadline, &self.0.cancellation));

        match result {
            Ok(()) => {
                *self.0.state.lock() = WriterState::Running;
                *self.0.last_rotation.lock() = Instant::now();
                *self.0.last_rotation_bucket.lock() = current_hour_bucket();
                self.0.facade.record_resolved_identifiers(&self.0.stats);

                if !self.0.config.lock().is_synchronous() {
                    let shared = self.0.clone();
                    let handle = thread::Builder::new()
                        .name("log-writer".to_string())
                        .spawn(move || run_loop(shared))
                        .expect("failed to spawn writer background thread");
                    *self.0.thread.lock() = Some(handle);
                }

                if self.0.config.lock().use_shutdown_hook {
                    register_shutdown_hook(self.clone());
                }

                Ok(())
            }
            Err(e) => {
                *self.0.state.lock() = WriterState::InitFailed;
                self.0.logger.error("destination initialization failed", Some(&e));

                let discarded = self.0.queue.drain_all();
                if !discarded.is_empty() {
                    self.0.stats.record_discarded(discarded.len() as i64);
                }
                self.0.queue.set_threshold(0);
                self.0.queue.set_action(DiscardAction::Oldest);
                self.0.stats.record_error_message(e.to_string());

                Err(WriterError::InitializationFailed(e))
            }
        }
    }

    /// Accept one message. In synchronous mode this
    /// also performs batch assembly and delivery on the caller's thread
    /// before returning.
    pub fn enqueue(&self, message: Message) -> EnqueueOutcome {
        let state = *self.0.state.lock();
        if matches!(
            state,
            WriterState::InitFailed | WriterState::Terminated | WriterState::Draining
        ) {
            self.0.stats.record_discarded(1);
            return EnqueueOutcome {
                appended: false,
                discarded: Some(message),
            };
        }

        let policy = self.0.facade.batch_policy();
        let message = if policy.within_limits(policy.effective_size(&message), 1) {
            message
        } else if self.0.config.lock().truncate_oversize {
            truncate_to_fit(message, policy)
        } else {
            self.0.logger.warn("discarding oversize message");
            self.0.stats.record_discarded(1);
            return EnqueueOutcome {
                appended: false,
                discarded: Some(message),
            };
        };

        let outcome = self.0.queue.enqueue(message);
        if outcome.discarded.is_some() {
            self.0.stats.record_discarded(1);
        }

        if self.0.config.lock().is_synchronous() {
            run_synchronous_step(&self.0);
        }

        outcome
    }

    pub fn set_batch_delay(&self, delay: Duration) {
        self.0.config.lock().batch_delay_millis = delay.as_millis() as u64;
    }

    pub fn set_discard_threshold(&self, threshold: i32) {
        self.0.config.lock().discard_threshold = threshold;
        self.0.queue.set_threshold(threshold);
    }

    pub fn set_discard_action(&self, action: DiscardAction) {
        self.0.config.lock().discard_action = action;
        self.0.queue.set_action(action);
    }

    /// Force a rotation right now, regardless of the configured trigger.
    /// No-op if rotation was never enabled or the facade doesn't
    /// support it.
    pub fn rotate(&self) {
        do_rotate(&self.0);
    }

    /// Stop accepting the writer's own further progress: cancel any
    /// in-flight retry wait, wait up to `deadline` for the queue to drain,
    /// then discard whatever is still pending. Idempotent.
    pub fn stop(&self, deadline: Duration) {
        {
            let mut state = self.0.state.lock();
            if matches!(
                *state,
                WriterState::Terminated | WriterState::InitFailed | WriterState::Created
            ) {
                return;
            }
            *state = WriterState::Draining;
        }

        *self.0.shutdown_deadline.lock() = Some(Instant::now() + deadline);
        self.0.cancellation.cancel();

        let handle = self.0.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        } else {
            drain_remaining(&self.0);
            *self.0.state.lock() = WriterState::Terminated;
        }
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.0.stats.snapshot()
    }

    pub fn state(&self) -> WriterState {
        *self.0.state.lock()
    }

    /// An RAII handle whose `Drop` calls [`Writer::stop`]. The Rust
    /// analogue of `tracing_appender`'s `WorkerGuard`: a host holds this
    /// for as long as the process should keep flushing, typically in
    /// `main`'s top-level binding.
    pub fn shutdown_guard(&self, deadline: Duration) -> ShutdownGuard {
        ShutdownGuard {
            writer: self.clone(),
            deadline,
        }
    }
}

/// See [`Writer::shutdown_guard`].
pub struct ShutdownGuard {
    writer: Writer,
    deadline: Duration,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.writer.stop(self.deadline);
    }
}

/// Writers registered via `use_shutdown_hook = true`, stopped by
/// [`run_registered_shutdown_hooks`] when the process exits normally.
static SHUTDOWN_HOOK_REGISTRY: OnceLock<Mutex<Vec<Writer>>> = OnceLock::new();
static SHUTDOWN_HOOK_INSTALLED: Once = Once::new();

fn register_shutdown_hook(writer: Writer) {
    SHUTDOWN_HOOK_INSTALLED.call_once(|| {
        // SAFETY: `run_registered_shutdown_hooks` takes no arguments, never
        // unwinds across the FFI boundary, and is only ever installed once.
        unsafe {
            libc::atexit(run_registered_shutdown_hooks);
        }
    });
    SHUTDOWN_HOOK_REGISTRY
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .push(writer);
}

extern "C" fn run_registered_shutdown_hooks() {
    let Some(registry) = SHUTDOWN_HOOK_REGISTRY.get() else {
        return;
    };
    let writers = std::mem::take(&mut *registry.lock());
    for writer in writers {
        let deadline = writer.0.config.lock().batch_delay();
        writer.stop(deadline);
    }
}

fn run_loop(shared: Arc<WriterShared>) {
    loop {
        let cancelled = shared.cancellation.is_cancelled();
        if cancelled {
            let deadline_passed = shared
                .shutdown_deadline
                .lock()
                .map(|d| Instant::now() >= d)
                .unwrap_or(true);
            if shared.queue.is_empty() || deadline_passed {
                break;
            }
        }

        let policy = shared.facade.batch_policy();
        let first_wait = if cancelled {
            FIRST_MESSAGE_WAIT_DRAINING
        } else {
            FIRST_MESSAGE_WAIT
        };
        let batch_delay = shared.config.lock().batch_delay();
        let batch = Batcher::build_batch(&shared.queue, first_wait, batch_delay, policy);

        if batch.is_empty() {
            continue;
        }

        process_batch(&shared, batch);
        maybe_rotate(&shared);
    }

    drain_remaining(&shared);
    *shared.state.lock() = WriterState::Terminated;
}

fn run_synchronous_step(shared: &Arc<WriterShared>) {
    let policy = shared.facade.batch_policy();
    let batch = Batcher::build_batch(&shared.queue, Duration::ZERO, Duration::ZERO, policy);
    if batch.is_empty() {
        return;
    }
    process_batch(shared, batch);
    maybe_rotate(shared);
}

fn process_batch(shared: &Arc<WriterShared>, batch: Vec<Message>) {
    shared.stats.record_batch();
    let deadline = Instant::now() + BATCH_SEND_TIMEOUT;
    let retry = RetryManager::new(RETRY_BASE_INTERVAL, BackoffMode::Exponential).with_jitter(JitterMode::Full);

    let result = retry.invoke(
        deadline,
        &shared.cancellation,
        || {
            match shared
                .runtime
                .block_on(shared.facade.send(&batch, deadline, &shared.cancellation))
            {
                Ok(outcomes) => Ok(Some(outcomes)),
                Err(FacadeError::AlreadyProcessed) => Ok(Some(vec![PerMessageOutcome::Sent; batch.len()])),
                Err(e) => Err(e),
            }
        },
        Some(|e: &FacadeError| e.is_retryable()),
    );

    match result {
        Ok(Some(outcomes)) => apply_outcomes(shared, batch, outcomes),
        Ok(None) | Err(RetryError::Timeout) => {
            shared.stats.record_requeued(batch.len() as i64);
            shared.queue.requeue_all(batch);
        }
        Err(RetryError::Operation(e)) => {
            shared.logger.error("batch send failed", Some(&e));
            shared.stats.record_error(e);
            shared.stats.record_requeued(batch.len() as i64);
            shared.queue.requeue_all(batch);
        }
        Err(RetryError::Cancelled) => {
            shared.queue.requeue_all(batch);
        }
    }
}

fn apply_outcomes(shared: &Arc<WriterShared>, batch: Vec<Message>, outcomes: Vec<PerMessageOutcome>) {
    let mut retry_list = Vec::new();
    let mut sent = 0i64;
    let mut failed = 0i64;

    for (msg, outcome) in batch.into_iter().zip(outcomes) {
        match outcome {
            PerMessageOutcome::Sent => sent += 1,
            PerMessageOutcome::Retry => retry_list.push(msg),
            PerMessageOutcome::Fail => failed += 1,
        }
    }

    if sent > 0 {
        shared.stats.record_sent(sent);
        shared.messages_since_rotation.fetch_add(sent, Ordering::Relaxed);
    }
    if failed > 0 {
        shared.stats.record_discarded(failed);
    }
    if !retry_list.is_empty() {
        shared.stats.record_requeued(retry_list.len() as i64);
        shared.queue.requeue_all(retry_list);
    }
}

fn maybe_rotate(shared: &Arc<WriterShared>) {
    let Some(trigger) = &shared.rotation else {
        return;
    };
    if !shared.facade.supports_rotation() {
        return;
    }

    let should_rotate = match trigger {
        RotationTrigger::Count(n) => shared.messages_since_rotation.load(Ordering::Relaxed) >= *n as i64,
        RotationTrigger::Interval { seconds } => {
            shared.last_rotation.lock().elapsed() >= Duration::from_secs(*seconds)
        }
        RotationTrigger::Hourly => current_hour_bucket() != *shared.last_rotation_bucket.lock(),
        RotationTrigger::Daily => current_day_bucket() != *shared.last_rotation_bucket.lock(),
        RotationTrigger::Explicit => false,
    };

    if should_rotate {
        do_rotate(shared);
    }
}

fn do_rotate(shared: &Arc<WriterShared>) {
    let (Some(template), Some(subs)) = (&shared.name_template, &shared.substitutions) else {
        return;
    };
    if !shared.facade.supports_rotation() {
        return;
    }

    let new_name = subs.expand(template);
    let deadline = Instant::now() + ROTATION_TIMEOUT;

    match shared
        .runtime
        .block_on(shared.facade.rotate(&new_name, deadline, &shared.cancellation))
    {
        Ok(()) => {
            shared.logger.debug(&format!("rotated destination to {new_name}"));
            shared.messages_since_rotation.store(0, Ordering::Relaxed);
            *shared.last_rotation.lock() = Instant::now();
            let bucket = match shared.rotation {
                Some(RotationTrigger::Daily) => current_day_bucket(),
                _ => current_hour_bucket(),
            };
            *shared.last_rotation_bucket.lock() = bucket;
            shared.facade.record_resolved_identifiers(&shared.stats);
        }
        Err(e) => {
            shared.logger.error("rotation failed", Some(&e));
            shared.stats.record_error(e);
        }
    }
}

fn drain_remaining(shared: &WriterShared) {
    let remaining = shared.queue.drain_all();
    if !remaining.is_empty() {
        shared.stats.record_discarded(remaining.len() as i64);
        shared.stats.record_error_message(format!(
            "discarded {} pending message(s) at the shutdown deadline",
            remaining.len()
        ));
    }
}

fn current_hour_bucket() -> String {
    chrono::Utc::now().format("%Y%m%d%H").to_string()
}

fn current_day_bucket() -> String {
    chrono::Utc::now().format("%Y%m%d").to_string()
}

/// Find the byte boundary at or before `index` that lies on a UTF-8
/// character boundary.
fn floor_char_boundary(bytes: &[u8], index: usize) -> usize {
    let mut i = index.min(bytes.len());
    while i > 0 && (bytes[i] & 0b1100_0000) == 0b1000_0000 {
        i -= 1;
    }
    i
}

/// Best-effort truncation for an oversize message when
/// `truncate_oversize = true`. Shrinks by roughly a eighth of the
/// remaining length each step, snapping to a UTF-8 boundary, since the
/// per-message overhead a policy enforces is opaque to the writer.
fn truncate_to_fit(message: Message, policy: &dyn BatchPolicy) -> Message {
    if policy.within_limits(policy.effective_size(&message), 1) {
        return message;
    }

    let bytes = message.text().as_bytes();
    let mut len = bytes.len();

    loop {
        if len == 0 {
            return Message::new(message.timestamp(), String::new());
        }
        let step = (len / 8).max(1);
        len = floor_char_boundary(bytes, len.saturating_sub(step));

        let candidate_text = std::str::from_utf8(&bytes[..len]).unwrap_or("");
        let candidate = Message::new(message.timestamp(), candidate_text);
        if policy.within_limits(policy.effective_size(&candidate), 1) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::test_support::FakeFacade;
    use crate::logger::NullLogger;

    fn writer_with(facade: FakeFacade, config: WriterConfig) -> (Writer, Arc<FakeFacade>) {
        let facade = Arc::new(facade);
        let writer = Writer::new(config, facade.clone(), Arc::new(NullLogger)).unwrap();
        (writer, facade)
    }

    #[test]
    fn init_failure_drains_queue_and_sets_discard_everything() {
        let (writer, _facade) = writer_with(
            FakeFacade::new().with_init_failure_once(FacadeError::MissingResource {
                name: "gone".into(),
            }),
            WriterConfig::default(),
        );

        let result = writer.start(Duration::from_millis(100));
        assert!(result.is_err());
        assert_eq!(writer.state(), WriterState::InitFailed);

        let outcome = writer.enqueue(Message::new(1, "dropped"));
        assert!(!outcome.appended);
        assert_eq!(writer.statistics().messages_discarded, 1);
    }

    #[test]
    fn synchronous_mode_sends_inline() {
        let (writer, facade) = writer_with(
            FakeFacade::new(),
            WriterConfig {
                batch_delay_millis: 0,
                ..Default::default()
            },
        );
        writer.start(Duration::from_secs(5)).unwrap();

        writer.enqueue(Message::new(1, "hello"));
        writer.enqueue(Message::new(2, "world"));

        assert_eq!(facade.sent_messages().len(), 2);
        assert_eq!(writer.statistics().messages_sent, 2);
    }

    #[test]
    fn asynchronous_mode_drains_on_stop() {
        let (writer, facade) = writer_with(
            FakeFacade::new(),
            WriterConfig {
                batch_delay_millis: 20,
                ..Default::default()
            },
        );
        writer.start(Duration::from_secs(5)).unwrap();

        for i in 0..5 {
            writer.enqueue(Message::new(i, format!("m{i}")));
        }

        writer.stop(Duration::from_secs(5));

        assert_eq!(writer.state(), WriterState::Terminated);
        assert_eq!(facade.sent_messages().len(), 5);
        assert_eq!(writer.statistics().messages_sent, 5);
    }

    #[test]
    fn rejected_records_are_requeued_and_eventually_sent() {
        let (writer, facade) = writer_with(
            FakeFacade::new().with_reject_once([1]),
            WriterConfig {
                batch_delay_millis: 20,
                ..Default::default()
            },
        );
        writer.start(Duration::from_secs(5)).unwrap();

        writer.enqueue(Message::new(1, "will be retried"));
        writer.enqueue(Message::new(2, "sent first try"));

        writer.stop(Duration::from_secs(5));

        let sent = facade.sent_messages();
        assert_eq!(sent.len(), 2);
        assert!(writer.statistics().messages_requeued >= 1);
    }

    #[test]
    fn oversize_message_is_truncated_when_configured() {
        struct TinyPolicy;
        impl BatchPolicy for TinyPolicy {
            fn effective_size(&self, msg: &Message) -> usize {
                msg.byte_length()
            }
            fn within_limits(&self, batch_bytes: usize, _batch_count: usize) -> bool {
                batch_bytes <= 4
            }
        }

        let big = Message::new(1, "hello world");
        let policy = TinyPolicy;
        let truncated = truncate_to_fit(big, &policy);
        assert!(truncated.byte_length() <= 4);
    }

    #[test]
    fn shutdown_hook_flushes_pending_messages_when_invoked() {
        let (writer, facade) = writer_with(
            FakeFacade::new(),
            WriterConfig {
                batch_delay_millis: 20,
                use_shutdown_hook: true,
                ..Default::default()
            },
        );
        writer.start(Duration::from_secs(5)).unwrap();

        writer.enqueue(Message::new(1, "a"));
        writer.enqueue(Message::new(2, "b"));

        // Exercise the registered callback directly rather than waiting for
        // the test binary's own process exit.
        run_registered_shutdown_hooks();

        assert_eq!(writer.state(), WriterState::Terminated);
        assert_eq!(facade.sent_messages().len(), 2);
    }
}
