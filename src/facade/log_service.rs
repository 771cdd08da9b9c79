//! Variant A: a managed, group-and-stream log service (CloudWatch Logs
//! shaped): streams are organized under groups, and writers present a
//! monotonically increasing sequence token with every send.

use crate::batch::BatchPolicy;
use crate::error::{FacadeError, NameValidationError};
use crate::facade::{PerMessageOutcome, ServiceFacade};
use crate::logger::InternalLogger;
use crate::message::Message;
use crate::retry::CancellationToken;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Per-message overhead the service adds when accounting a batch's byte
/// total.
pub const PER_MESSAGE_OVERHEAD_BYTES: usize = 26;
pub const MAX_BATCH_BYTES: usize = 1_048_576 - PER_MESSAGE_OVERHEAD_BYTES;
pub const MAX_BATCH_COUNT: usize = 10_000;
pub const MAX_MESSAGE_BYTES: usize = 262_118;
const MAX_BATCH_SPAN_MILLIS: i64 = 24 * 60 * 60 * 1000;

fn group_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_/.#-]{1,512}$").unwrap())
}

/// Configuration for the group-and-stream facade.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogServiceConfig {
    pub log_group_name: String,
    pub log_stream_name: String,
    pub retention_days: Option<u32>,
    pub dedicated_writer: bool,
    pub auto_create: bool,
}

/// Validate a log group name: 1-512 chars, `[A-Za-z0-9_/.#-]`.
pub fn validate_group_name(name: &str) -> Result<(), NameValidationError> {
    if group_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(NameValidationError {
            field: "log group name",
            value: name.to_string(),
            rule: "1-512 chars of [A-Za-z0-9_/.#-]",
        })
    }
}

/// Validate a log stream name: 1-512 chars, no `:` or `*`.
pub fn validate_stream_name(name: &str) -> Result<(), NameValidationError> {
    if name.is_empty()
        || name.len() > 512
        || name.contains(':')
        || name.contains('*')
    {
        Err(NameValidationError {
            field: "log stream name",
            value: name.to_string(),
            rule: "1-512 chars, no ':' or '*'",
        })
    } else {
        Ok(())
    }
}

#[derive(Serialize)]
struct PutEventsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    sequence_token: Option<&'a str>,
    events: Vec<WireEvent<'a>>,
}

#[derive(Serialize)]
struct WireEvent<'a> {
    timestamp: i64,
    message: &'a str,
}

#[derive(Deserialize)]
struct PutEventsResponse {
    #[serde(default)]
    next_sequence_token: Option<String>,
    #[serde(default)]
    rejected_record_indexes: Vec<usize>,
    #[serde(default)]
    error: Option<String>,
}

struct LogServiceBatchPolicy;

impl BatchPolicy for LogServiceBatchPolicy {
    fn effective_size(&self, msg: &Message) -> usize {
        msg.byte_length() + PER_MESSAGE_OVERHEAD_BYTES
    }

    fn within_limits(&self, batch_bytes: usize, batch_count: usize) -> bool {
        if batch_count <= 1 {
            batch_bytes <= MAX_MESSAGE_BYTES
        } else {
            batch_bytes <= MAX_BATCH_BYTES && batch_count <= MAX_BATCH_COUNT
        }
    }
}

/// The group-and-stream log service facade.
pub struct LogServiceFacade {
    http: reqwest::Client,
    endpoint: String,
    config: LogServiceConfig,
    resolved_stream_name: Mutex<String>,
    sequence_token: Mutex<Option<String>>,
    logger: Arc<dyn InternalLogger>,
    policy: LogServiceBatchPolicy,
}

impl LogServiceFacade {
    /// `endpoint` is the base URL of the log service's REST API, already
    /// resolved by the host (region/credentials/proxy are out of this
    /// crate's scope).
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        config: LogServiceConfig,
        logger: Arc<dyn InternalLogger>,
    ) -> Result<Self, NameValidationError> {
        validate_group_name(&config.log_group_name)?;
        validate_stream_name(&config.log_stream_name)?;
        let resolved_stream_name = config.log_stream_name.clone();
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            config,
            resolved_stream_name: Mutex::new(resolved_stream_name),
            sequence_token: Mutex::new(None),
            logger,
            policy: LogServiceBatchPolicy,
        })
    }

    fn events_url(&self) -> String {
        format!("{}/put-log-events", self.endpoint.trim_end_matches('/'))
    }

    fn describe_url(&self) -> String {
        format!("{}/describe-log-streams", self.endpoint.trim_end_matches('/'))
    }

    async fn describe_sequence_token(&self) -> Result<Option<String>, FacadeError> {
        #[derive(Deserialize)]
        struct DescribeResponse {
            #[serde(default)]
            upload_sequence_token: Option<String>,
        }

        let stream_name = self.resolved_stream_name.lock().clone();
        let resp = self
            .http
            .get(self.describe_url())
            .query(&[
                ("logGroupName", self.config.log_group_name.as_str()),
                ("logStreamName", stream_name.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FacadeError::MissingResource { name: stream_name });
        }

        let body: DescribeResponse = resp
            .json()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;
        Ok(body.upload_sequence_token)
    }

    async fn create_destination(&self) -> Result<(), FacadeError> {
        #[derive(Serialize)]
        struct CreateRequest<'a> {
            log_group_name: &'a str,
            log_stream_name: &'a str,
            retention_days: Option<u32>,
        }

        let stream_name = self.resolved_stream_name.lock().clone();
        let resp = self
            .http
            .put(format!("{}/create-log-stream", self.endpoint.trim_end_matches('/')))
            .json(&CreateRequest {
                log_group_name: &self.config.log_group_name,
                log_stream_name: &stream_name,
                retention_days: self.config.retention_days,
            })
            .send()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        if resp.status().is_success() || resp.status() == reqwest::StatusCode::CONFLICT {
            Ok(())
        } else if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(FacadeError::Throttling { source: None })
        } else {
            Err(FacadeError::InvalidConfiguration {
                message: format!("failed to create log stream: {}", resp.status()),
            })
        }
    }

    /// The describe/auto-create/poll loop shared by `initialize_destination`
    /// and `rotate`; both act against whatever name currently sits in
    /// `resolved_stream_name`.
    async fn run_init_loop(
        &self,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<(), FacadeError> {
        loop {
            if token.is_cancelled() {
                return Err(FacadeError::Aborted { source: None });
            }
            match self.describe_sequence_token().await {
                Ok(seq) => {
                    *self.sequence_token.lock() = seq;
                    return Ok(());
                }
                Err(FacadeError::MissingResource { .. }) if self.config.auto_create => {
                    self.logger.debug(&format!(
                        "creating log stream {} (not found)",
                        self.resolved_stream_name.lock()
                    ));
                    self.create_destination().await?;
                }
                Err(FacadeError::MissingResource { name }) => {
                    return Err(FacadeError::MissingResource { name });
                }
                Err(FacadeError::Throttling { .. }) => {}
                Err(other) => return Err(other),
            }

            if Instant::now() >= deadline {
                return Err(FacadeError::Unexpected {
                    source: "destination did not become ready before the deadline".into(),
                });
            }
            if !crate::retry::sleep_quietly(Duration::from_secs(1), token) {
                return Err(FacadeError::Aborted { source: None });
            }
        }
    }

    fn assert_single_hour_span(&self, batch: &[Message]) {
        if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
            let span = (last.timestamp() - first.timestamp()).abs();
            if span > MAX_BATCH_SPAN_MILLIS {
                self.logger.warn(&format!(
                    "batch for {} spans {}ms, exceeding the 24h limit",
                    self.resolved_stream_name.lock(),
                    span
                ));
            }
        }
    }

    async fn send_once(
        &self,
        sorted: &[Message],
        token: Option<String>,
    ) -> Result<Vec<PerMessageOutcome>, FacadeError> {
        let stream_name = self.resolved_stream_name.lock().clone();
        let events: Vec<WireEvent> = sorted
            .iter()
            .map(|m| WireEvent {
                timestamp: m.timestamp(),
                message: m.text(),
            })
            .collect();

        let resp = self
            .http
            .post(self.events_url())
            .json(&PutEventsRequest {
                log_group_name: &self.config.log_group_name,
                log_stream_name: &stream_name,
                sequence_token: token.as_deref(),
                events,
            })
            .send()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FacadeError::Throttling { source: None });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FacadeError::MissingResource { name: stream_name });
        }
        if status.is_server_error() {
            return Err(FacadeError::Aborted { source: None });
        }

        let body: PutEventsResponse = resp
            .json()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        match body.error.as_deref() {
            Some("InvalidSequenceToken") => Err(FacadeError::InvalidSequenceToken),
            Some("DataAlreadyAccepted") => Err(FacadeError::AlreadyProcessed),
            Some(other) => Err(FacadeError::Unexpected {
                source: format!("unrecognized error from log service: {other}").into(),
            }),
            None => {
                if let Some(next) = body.next_sequence_token {
                    *self.sequence_token.lock() = Some(next);
                }
                let rejected: std::collections::HashSet<usize> =
                    body.rejected_record_indexes.into_iter().collect();
                Ok(sorted
                    .iter()
                    .enumerate()
                    .map(|(i, _)| {
                        if rejected.contains(&i) {
                            PerMessageOutcome::Retry
                        } else {
                            PerMessageOutcome::Sent
                        }
                    })
                    .collect())
            }
        }
    }
}

#[async_trait::async_trait]
impl ServiceFacade for LogServiceFacade {
    async fn initialize_destination(
        &self,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<(), FacadeError> {
        self.run_init_loop(deadline, token).await
    }

    async fn send(
        &self,
        batch: &[Message],
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<Vec<PerMessageOutcome>, FacadeError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut sorted: Vec<Message> = batch.to_vec();
        sorted.sort_by(|a, b| a.timestamp_cmp(b));
        self.assert_single_hour_span(&sorted);

        let current_token = self.sequence_token.lock().clone();
        match self.send_once(&sorted, current_token).await {
            Ok(outcomes) => Ok(outcomes),
            Err(FacadeError::InvalidSequenceToken) => {
                self.logger
                    .debug("sequence token rejected, re-fetching and retrying once");
                if Instant::now() >= deadline || token.is_cancelled() {
                    return Ok(vec![PerMessageOutcome::Retry; sorted.len()]);
                }
                let refreshed = self.describe_sequence_token().await?;
                *self.sequence_token.lock() = refreshed.clone();
                match self.send_once(&sorted, refreshed).await {
                    Ok(outcomes) => Ok(outcomes),
                    Err(_) => Ok(vec![PerMessageOutcome::Retry; sorted.len()]),
                }
            }
            Err(FacadeError::AlreadyProcessed) => Ok(vec![PerMessageOutcome::Sent; sorted.len()]),
            Err(other) => Err(other),
        }
    }

    async fn shutdown(&self) {}

    fn batch_policy(&self) -> &dyn BatchPolicy {
        &self.policy
    }

    async fn rotate(
        &self,
        new_name: &str,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<(), FacadeError> {
        validate_stream_name(new_name).map_err(|e| FacadeError::InvalidConfiguration {
            message: e.to_string(),
        })?;
        *self.resolved_stream_name.lock() = new_name.to_string();
        *self.sequence_token.lock() = None;
        self.run_init_loop(deadline, token).await
    }

    fn record_resolved_identifiers(&self, stats: &crate::stats::Statistics) {
        stats.set_actual_log_group_name(self.config.log_group_name.clone());
        stats.set_actual_log_stream_name(self.resolved_stream_name.lock().clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_name_accepts_allowed_charset() {
        assert!(validate_group_name("my-app/logs.prod#1").is_ok());
        assert!(validate_group_name("bad name with space").is_err());
    }

    #[test]
    fn stream_name_rejects_colon_and_star() {
        assert!(validate_stream_name("stream-1").is_ok());
        assert!(validate_stream_name("bad:stream").is_err());
        assert!(validate_stream_name("bad*stream").is_err());
        assert!(validate_stream_name("").is_err());
    }

    #[test]
    fn policy_accounts_per_message_overhead() {
        let policy = LogServiceBatchPolicy;
        let msg = Message::new(0, "x");
        assert_eq!(policy.effective_size(&msg), 1 + PER_MESSAGE_OVERHEAD_BYTES);
    }

    #[test]
    fn within_limits_enforces_per_message_ceiling_only_for_lone_messages() {
        let policy = LogServiceBatchPolicy;
        assert!(policy.within_limits(MAX_MESSAGE_BYTES, 1));
        assert!(!policy.within_limits(MAX_MESSAGE_BYTES + 1, 1));
        // A multi-message batch is bounded by the aggregate ceiling instead,
        // which is much larger than a single message's limit.
        assert!(policy.within_limits(MAX_MESSAGE_BYTES + 1, 2));
        assert!(!policy.within_limits(MAX_BATCH_BYTES + 1, 2));
    }

    #[test]
    fn record_resolved_identifiers_reports_group_and_current_stream_name() {
        let facade = LogServiceFacade::new(
            reqwest::Client::new(),
            "http://localhost",
            LogServiceConfig {
                log_group_name: "my-group".into(),
                log_stream_name: "my-stream".into(),
                retention_days: None,
                dedicated_writer: false,
                auto_create: false,
            },
            Arc::new(crate::logger::NullLogger),
        )
        .unwrap();

        *facade.resolved_stream_name.lock() = "my-stream-rotated".into();

        let stats = crate::stats::Statistics::new();
        facade.record_resolved_identifiers(&stats);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.actual_log_group_name.as_deref(), Some("my-group"));
        assert_eq!(
            snapshot.actual_log_stream_name.as_deref(),
            Some("my-stream-rotated")
        );
    }
}
