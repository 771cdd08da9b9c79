//! Variant C: a topic pub/sub service (SNS shaped): one message per publish
//! call, no sequence tokens, no partition keys, and no stream name to
//! rotate.

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

pub const MAX_MESSAGE_BYTES: usize = 262_144;

fn topic_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,256}$").unwrap())
}

/// Configuration for the topic facade. Exactly one of `topic_name` /
/// `topic_arn` must be set: a name is resolved (and optionally
/// created) at initialization, while an ARN is used as-is.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TopicServiceConfig {
    pub topic_name: Option<String>,
    pub topic_arn: Option<String>,
    pub subject: Option<String>,
    pub auto_create: bool,
}

impl TopicServiceConfig {
    pub fn validate(&self) -> Result<(), NameValidationError> {
        match (&self.topic_name, &self.topic_arn) {
            (Some(_), Some(_)) | (None, None) => Err(NameValidationError {
                field: "topic_name/topic_arn",
                value: format!("{:?}/{:?}", self.topic_name, self.topic_arn),
                rule: "exactly one of topic_name or topic_arn must be set",
            }),
            (Some(name), None) => validate_topic_name(name),
            (None, Some(_)) => Ok(()),
        }
    }
}

/// Validate a topic name against `[A-Za-z0-9_-]{1,256}`.
pub fn validate_topic_name(name: &str) -> Result<(), NameValidationError> {
    if topic_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(NameValidationError {
            field: "topic name",
            value: name.to_string(),
            rule: "1-256 chars of [A-Za-z0-9_-]",
        })
    }
}

struct TopicBatchPolicy;

impl BatchPolicy for TopicBatchPolicy {
    fn effective_size(&self, msg: &Message) -> usize {
        msg.byte_length()
    }

    fn within_limits(&self, batch_bytes: usize, batch_count: usize) -> bool {
        // One publish call per message: the batcher is still free to
        // accumulate many messages into one logical batch (this facade
        // sends them with individual publish calls inside `send`), so
        // `batch_count` is otherwise unbounded. The byte ceiling does still
        // apply to a single message, since the writer also calls
        // `within_limits(effective_size(msg), 1)` to decide whether a lone
        // oversize message needs truncation or discarding before it ever
        // reaches a batch.
        if batch_count <= 1 {
            batch_bytes <= MAX_MESSAGE_BYTES
        } else {
            true
        }
    }
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    topic_arn: &'a str,
    message: &'a str,
    subject: Option<&'a str>,
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

/// The topic pub/sub facade.
pub struct TopicServiceFacade {
    http: reqwest::Client,
    endpoint: String,
    config: TopicServiceConfig,
    logger: Arc<dyn InternalLogger>,
    policy: TopicBatchPolicy,
    resolved_arn: Mutex<Option<String>>,
    created_by_us: Mutex<bool>,
}

impl TopicServiceFacade {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        config: TopicServiceConfig,
        logger: Arc<dyn InternalLogger>,
    ) -> Result<Self, NameValidationError> {
        config.validate()?;
        let resolved_arn = config.topic_arn.clone();
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            config,
            logger,
            policy: TopicBatchPolicy,
            resolved_arn: Mutex::new(resolved_arn),
            created_by_us: Mutex::new(false),
        })
    }

    fn resolve_topic_url(&self) -> String {
        format!("{}/resolve-topic", self.endpoint.trim_end_matches('/'))
    }

    fn create_topic_url(&self) -> String {
        format!("{}/create-topic", self.endpoint.trim_end_matches('/'))
    }

    fn publish_url(&self) -> String {
        format!("{}/publish", self.endpoint.trim_end_matches('/'))
    }

    async fn resolve_by_name(&self, name: &str) -> Result<String, FacadeError> {
        #[derive(Deserialize)]
        struct ResolveResponse {
            #[serde(default)]
            arn: Option<String>,
        }
        let resp = self
            .http
            .get(self.resolve_topic_url())
            .query(&[("name", name)])
            .send()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FacadeError::MissingResource {
                name: name.to_string(),
            });
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FacadeError::Throttling { source: None });
        }
        let body: ResolveResponse = resp
            .json()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;
        body.arn.ok_or(FacadeError::MissingResource {
            name: name.to_string(),
        })
    }

    async fn create_topic(&self, name: &str) -> Result<String, FacadeError> {
        #[derive(Serialize)]
        struct CreateRequest<'a> {
            name: &'a str,
        }
        #[derive(Deserialize)]
        struct CreateResponse {
            arn: String,
        }
        let resp = self
            .http
            .put(self.create_topic_url())
            .json(&CreateRequest { name })
            .send()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FacadeError::Throttling { source: None });
        }
        if !resp.status().is_success() {
            return Err(FacadeError::InvalidConfiguration {
                message: format!("failed to create topic {name}"),
            });
        }
        let body: CreateResponse = resp
            .json()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;
        Ok(body.arn)
    }

    async fn publish_one(&self, arn: &str, msg: &Message) -> Result<PerMessageOutcome, FacadeError> {
        let resp = self
            .http
            .post(self.publish_url())
            .json(&PublishRequest {
                topic_arn: arn,
                message: msg.text(),
                subject: self.config.subject.as_deref(),
            })
            .send()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FacadeError::Throttling { source: None });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FacadeError::MissingResource {
                name: arn.to_string(),
            });
        }
        if status.is_server_error() {
            return Err(FacadeError::Aborted { source: None });
        }

        let body: PublishResponse = resp
            .json()
            .await
            .map_err(|e| FacadeError::Unexpected { source: Box::new(e) })?;

        match body.error_code.as_deref() {
            None => Ok(PerMessageOutcome::Sent),
            Some("MISSING_TOPIC") => Err(FacadeError::MissingResource {
                name: arn.to_string(),
            }),
            Some(_) => Ok(PerMessageOutcome::Retry),
        }
        .map(|outcome| {
            if body.message_id.is_none() {
                self.logger.debug("publish accepted without a message id");
            }
            outcome
        })
    }
}

#[async_trait::async_trait]
impl ServiceFacade for TopicServiceFacade {
    async fn initialize_destination(
        &self,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<(), FacadeError> {
        if let Some(arn) = &self.config.topic_arn {
            *self.resolved_arn.lock() = Some(arn.clone());
            return Ok(());
        }

        let name = self
            .config
            .topic_name
            .as_ref()
            .expect("validate() guarantees exactly one of topic_name/topic_arn");

        loop {
            if token.is_cancelled() {
                return Err(FacadeError::Aborted { source: None });
            }
            match self.resolve_by_name(name).await {
                Ok(arn) => {
                    self.logger.debug(&format!("topic {name} resolved to {arn}"));
                    *self.resolved_arn.lock() = Some(arn);
                    return Ok(());
                }
                Err(FacadeError::MissingResource { .. }) if self.config.auto_create => {
                    self.logger.debug(&format!("creating topic {name}"));
                    let arn = self.create_topic(name).await?;
                    *self.created_by_us.lock() = true;
                    *self.resolved_arn.lock() = Some(arn);
                    return Ok(());
                }
                Err(FacadeError::MissingResource { name }) => {
                    return Err(FacadeError::MissingResource { name })
                }
                Err(FacadeError::Throttling { .. }) => {}
                Err(other) => return Err(other),
            }

            if Instant::now() >= deadline {
                return Err(FacadeError::Unexpected {
                    source: "topic did not resolve before the deadline".into(),
                });
            }
            if !crate::retry::sleep_quietly(Duration::from_secs(1), token) {
                return Err(FacadeError::Aborted { source: None });
            }
        }
    }

    async fn send(
        &self,
        batch: &[Message],
        _deadline: Instant,
        _token: &CancellationToken,
    ) -> Result<Vec<PerMessageOutcome>, FacadeError> {
        let arn = self
            .resolved_arn
            .lock()
            .clone()
            .ok_or_else(|| FacadeError::Unexpected {
                source: "send() called before a topic ARN was resolved".into(),
            })?;

        // One publish call per message: larger batches loop
        // internally instead of being rejected by the queue.
        let mut outcomes = Vec::with_capacity(batch.len());
        for msg in batch {
            match self.publish_one(&arn, msg).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(FacadeError::MissingResource { name }) => {
                    // Open question: the topic was auto-created earlier in
                    // this writer's life but is now gone - it was deleted
                    // out of band. Fail the whole batch rather than the one
                    // message, drop the cached ARN so the next
                    // initialize_destination re-resolves (and, if
                    // auto_create is still set, recreates) it.
                    *self.resolved_arn.lock() = None;
                    if *self.created_by_us.lock() {
                        *self.created_by_us.lock() = false;
                    }
                    return Err(FacadeError::MissingResource { name });
                }
                Err(other) => return Err(other),
            }
        }
        Ok(outcomes)
    }

    async fn shutdown(&self) {}

    fn batch_policy(&self) -> &dyn BatchPolicy {
        &self.policy
    }

    fn supports_rotation(&self) -> bool {
        false
    }

    async fn rotate(
        &self,
        _new_name: &str,
        _deadline: Instant,
        _token: &CancellationToken,
    ) -> Result<(), FacadeError> {
        Ok(())
    }

    fn record_resolved_identifiers(&self, stats: &crate::stats::Statistics) {
        if let Some(arn) = self.resolved_arn.lock().clone() {
            stats.set_actual_topic_arn(arn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_matches_allowed_pattern() {
        assert!(validate_topic_name("order-events_v2").is_ok());
        assert!(validate_topic_name("bad topic!").is_err());
        assert!(validate_topic_name(&"a".repeat(257)).is_err());
    }

    #[test]
    fn within_limits_enforces_per_message_ceiling_only_for_lone_messages() {
        let policy = TopicBatchPolicy;
        assert!(policy.within_limits(MAX_MESSAGE_BYTES, 1));
        assert!(!policy.within_limits(MAX_MESSAGE_BYTES + 1, 1));
        // Accumulating many small messages into one logical batch is fine:
        // each still goes out as its own publish call.
        assert!(policy.within_limits(MAX_MESSAGE_BYTES * 10, 10));
    }

    #[test]
    fn config_rejects_both_name_and_arn() {
        let cfg = TopicServiceConfig {
            topic_name: Some("orders".into()),
            topic_arn: Some("arn:svc:topic:orders".into()),
            subject: None,
            auto_create: false,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_rejects_neither_name_nor_arn() {
        let cfg = TopicServiceConfig {
            topic_name: None,
            topic_arn: None,
            subject: None,
            auto_create: false,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_accepts_arn_only() {
        let cfg = TopicServiceConfig {
            topic_name: None,
            topic_arn: Some("arn:svc:topic:orders".into()),
            subject: None,
            auto_create: false,
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn record_resolved_identifiers_reports_resolved_arn_when_present() {
        let facade = TopicServiceFacade::new(
            reqwest::Client::new(),
            "http://localhost",
            TopicServiceConfig {
                topic_name: Some("orders".into()),
                topic_arn: None,
                subject: None,
                auto_create: false,
            },
            Arc::new(crate::logger::NullLogger),
        )
        .unwrap();

        let stats = crate::stats::Statistics::new();

        // Nothing resolved yet - a bare name isn't recorded until
        // initialize_destination runs and resolves it to an ARN.
        facade.record_resolved_identifiers(&stats);
        assert_eq!(stats.snapshot().actual_topic_arn, None);

        *facade.resolved_arn.lock() = Some("arn:svc:topic:orders".into());
        facade.record_resolved_identifiers(&stats);
        assert_eq!(
            stats.snapshot().actual_topic_arn.as_deref(),
            Some("arn:svc:topic:orders")
        );
    }
}
