//! Variant B: a shard-partitioned stream service (Kinesis shaped): records
//! carry a partition key and are submitted in multi-record put batches.

use crate::batch::BatchPolicy;
use crate::error::{FacadeError, NameValidationError};
use crate::facade::{PerMessageOutcome, ServiceFacade};
use crate::logger::InternalLogger;
use crate::message::Message;
use crate::retry::CancellationToken;
use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub const MAX_BATCH_BYTES: usize = 5_242_880;
pub const MAX_BATCH_COUNT: usize = 500;
pub const MAX_MESSAGE_BYTES: usize = 1_048_576;

fn stream_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]{1,128}$").unwrap())
}

/// Configuration for the shard-partitioned stream facade.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StreamServiceConfig {
    pub stream_name: String,
    pub partition_key: String,
    pub shard_count: Option<u32>,
    pub retention_hours: Option<u32>,
    pub auto_create: bool,
    pub random_partition_key: bool,
}

/// Validate a stream name against `[A-Za-z0-9_.-]{1,128}`.
pub fn validate_stream_name(name: &str) -> Result<(), NameValidationError> {
    if stream_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(NameValidationError {
            field: "stream name",
            value: name.to_string(),
            rule: "1-128 chars of [A-Za-z0-9_.-]",
        })
    }
}

/// Validate a partition key: 1-256 chars.
pub fn validate_partition_key(key: &str) -> Result<(), NameValidationError> {
    if key.is_empty() || key.len() > 256 {
        Err(NameValidationError {
            field: "partition key",
            value: key.to_string(),
            rule: "1-256 chars",
        })
    } else {
        Ok(())
    }
}

fn random_partition_key() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08}", rng.gen_range(0..100_000_000u32))
}

struct StreamBatchPolicy {
    partition_key_bytes: usize,
}

impl BatchPolicy for StreamBatchPolicy {
    fn effective_size(&self, msg: &Message) -> usize {
        msg.byte_length() + self.partition_key_bytes
    }

    fn within_limits(&self, batch_bytes: usize, batch_count: usize) -> bool {
        if batch_count <= 1 {
            batch_bytes <= MAX_MESSAGE_BYTES.saturating_sub(self.partition_key_bytes)
        } else {
            batch_bytes <= MAX_BATCH_BYTES && batch_count <= MAX_BATCH_COUNT
        }
    }
}

#[derive(Serialize)]
struct PutRecordsRequest<'a> {
    stream_name: &'a str,
    records: Vec<WireRecord>,
}

#[derive(Serialize)]
struct WireRecord {
    partition_key: String,
    data: String,
}

#[derive(Deserialize)]
struct PutRecordsResponse {
    #[serde(default)]
    failed_record_count: usize,
    #[serde(default)]
    records: Vec<WireRecordResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct WireRecordResult {
    #[serde(default)]
    error_code: Option<String>,
}

/// The shard-partitioned stream service facade.
pub struct StreamServiceFacade {
    http: reqwest::Client,
    endpoint: String,
    config: StreamServiceConfig,
    logger: Arc<dyn InternalLogger>,
    policy: StreamBatchPolicy,
    resolved_name: Mutex<String>,
}

impl StreamServiceFacade {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        config: StreamServiceConfig,
        logger: Arc<dyn InternalLogger>,
    ) -> Result<Self, NameValidationError> {
        validate_stream_name(&config.stream_name)?;
        validate_partition_key(&config.partition_key)?;
        let policy = StreamBatchPolicy {
            partition_key_bytes: if config.random_partition_key {
                8
            } else {
                config.partition_key.len()
            },
        };
        let resolved_name = config.stream_name.clone();
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            config,
            logger,
            policy,
            resolved_name: Mutex::new(resolved_name),
        })
    }

    fn describe_url(&self) -> String {
        format!("{}/describe-stream", self.endpoint.trim_end_matches('/'))
    }

    fn put_records_url(&self) -> String {
        format!("{}/put-records", self.endpoint.trim_end_matches('/'))
    }

    fn create_stream_url(&self) -> String {
        format!("{}/create-stream", self.endpoint.trim_end_matches('/'))
    }

    fn partition_key_for(&self) -> String {
        if self.config.random_partition_key {
            random_partition_key()
        } else {
            self.config.partition_key.clone()
        }
    }

    async fn describe(&self) -> Result<bool, FacadeError> {
        let name = self.resolved_name.lock().clone();
        let resp = self
            .http
            .get(self.describe_url())
            .query(&[("streamName", name.as_str())])
            .send()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Err(FacadeError::MissingResource { name }),
            reqwest::StatusCode::TOO_MANY_REQUESTS => Err(FacadeError::Throttling { source: None }),
            status if status.is_success() => {
                #[derive(Deserialize)]
                struct DescribeResponse {
                    #[serde(default)]
                    active: bool,
                }
                let body: DescribeResponse = resp
                    .json()
                    .await
                    .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;
                Ok(body.active)
            }
            status => Err(FacadeError::Unexpected {
                source: format!("unexpected describe-stream status {status}").into(),
            }),
        }
    }

    async fn create_stream(&self) -> Result<(), FacadeError> {
        #[derive(Serialize)]
        struct CreateRequest<'a> {
            stream_name: &'a str,
            shard_count: Option<u32>,
            retention_hours: Option<u32>,
        }
        let name = self.resolved_name.lock().clone();
        let resp = self
            .http
            .put(self.create_stream_url())
            .json(&CreateRequest {
                stream_name: &name,
                shard_count: self.config.shard_count,
                retention_hours: self.config.retention_hours,
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
                message: format!("failed to create stream {name}"),
            })
        }
    }

    /// The describe/auto-create/poll loop shared by `initialize_destination`
    /// and `rotate`; both act against whatever name currently sits in
    /// `resolved_name`.
    async fn run_init_loop(
        &self,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<(), FacadeError> {
        loop {
            if token.is_cancelled() {
                return Err(FacadeError::Aborted { source: None });
            }
            match self.describe().await {
                Ok(true) => {
                    self.logger
                        .debug(&format!("stream {} is active", self.resolved_name.lock()));
                    return Ok(());
                }
                Ok(false) => {}
                Err(FacadeError::MissingResource { name }) if self.config.auto_create => {
                    self.logger.debug(&format!("creating stream {name}"));
                    self.create_stream().await?;
                }
                Err(FacadeError::MissingResource { name }) => {
                    return Err(FacadeError::MissingResource { name })
                }
                Err(FacadeError::Throttling { .. }) => {}
                Err(other) => return Err(other),
            }

            if Instant::now() >= deadline {
                return Err(FacadeError::Unexpected {
                    source: "stream did not become active before the deadline".into(),
                });
            }
            if !crate::retry::sleep_quietly(Duration::from_secs(1), token) {
                return Err(FacadeError::Aborted { source: None });
            }
        }
    }
}

#[async_trait::async_trait]
impl ServiceFacade for StreamServiceFacade {
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
        _deadline: Instant,
        _token: &CancellationToken,
    ) -> Result<Vec<PerMessageOutcome>, FacadeError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let records: Vec<WireRecord> = batch
            .iter()
            .map(|m| WireRecord {
                partition_key: self.partition_key_for(),
                data: m.text().to_string(),
            })
            .collect();

        let name = self.resolved_name.lock().clone();
        let resp = self
            .http
            .post(self.put_records_url())
            .json(&PutRecordsRequest {
                stream_name: &name,
                records,
            })
            .send()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FacadeError::Throttling { source: None });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FacadeError::MissingResource { name });
        }
        if status.is_server_error() {
            return Err(FacadeError::Aborted { source: None });
        }

        let body: PutRecordsResponse = resp
            .json()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        if let Some(err) = body.error {
            return Err(FacadeError::Unexpected {
                source: format!("put-records failed: {err}").into(),
            });
        }

        if body.failed_record_count == 0 {
            Ok(vec![PerMessageOutcome::Sent; batch.len()])
        } else {
            Ok(body
                .records
                .into_iter()
                .map(|r| {
                    if r.error_code.is_some() {
                        PerMessageOutcome::Retry
                    } else {
                        PerMessageOutcome::Sent
                    }
                })
                .collect())
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
        *self.resolved_name.lock() = new_name.to_string();
        self.run_init_loop(deadline, token).await
    }

    fn record_resolved_identifiers(&self, stats: &crate::stats::Statistics) {
        stats.set_actual_stream_name(self.resolved_name.lock().clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_matches_allowed_pattern() {
        assert!(validate_stream_name("my-stream.v1").is_ok());
        assert!(validate_stream_name("bad stream").is_err());
        assert!(validate_stream_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn partition_key_length_bounds() {
        assert!(validate_partition_key("bargle").is_ok());
        assert!(validate_partition_key("").is_err());
        assert!(validate_partition_key(&"a".repeat(257)).is_err());
    }

    #[test]
    fn random_partition_key_is_eight_digits() {
        let key = random_partition_key();
        assert_eq!(key.len(), 8);
        assert!(key.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn policy_accounts_for_shared_partition_key_bytes() {
        let policy = StreamBatchPolicy {
            partition_key_bytes: 6,
        };
        let msg = Message::new(0, "x".repeat(32_768));
        assert_eq!(policy.effective_size(&msg), 32_768 + 6);
    }

    #[test]
    fn within_limits_enforces_per_message_ceiling_net_of_partition_key() {
        let policy = StreamBatchPolicy {
            partition_key_bytes: 100,
        };
        assert!(policy.within_limits(MAX_MESSAGE_BYTES - 100, 1));
        assert!(!policy.within_limits(MAX_MESSAGE_BYTES - 99, 1));
        // Multi-message batches are bounded by the aggregate ceiling, not
        // the per-message one.
        assert!(policy.within_limits(MAX_MESSAGE_BYTES, 2));
        assert!(!policy.within_limits(MAX_BATCH_BYTES + 1, 2));
    }

    #[test]
    fn record_resolved_identifiers_reports_current_stream_name() {
        let facade = StreamServiceFacade::new(
            reqwest::Client::new(),
            "http://localhost",
            StreamServiceConfig {
                stream_name: "my-stream".into(),
                partition_key: "k".into(),
                shard_count: None,
                retention_hours: None,
                auto_create: false,
                random_partition_key: false,
            },
            Arc::new(crate::logger::NullLogger),
        )
        .unwrap();

        *facade.resolved_name.lock() = "my-stream-rotated".into();

        let stats = crate::stats::Statistics::new();
        facade.record_resolved_identifiers(&stats);
        assert_eq!(
            stats.snapshot().actual_stream_name.as_deref(),
            Some("my-stream-rotated")
        );
    }
}
