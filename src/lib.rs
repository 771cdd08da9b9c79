//! log-shippers-core
//!
//! A background log-writer subsystem for shipping application log events to
//! managed log, stream, and topic cloud services. Producer threads enqueue
//! formatted messages; a background thread batches and delivers them
//! through a pluggable [`ServiceFacade`](facade::ServiceFacade), with
//! bounded queueing, configurable discard behavior, and retry with
//! backoff.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use log_shippers_core::{Writer, WriterConfig};
//! use log_shippers_core::facade::log_service::{LogServiceConfig, LogServiceFacade};
//! use log_shippers_core::logger::TracingLogger;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let http = reqwest::Client::new();
//! let config = LogServiceConfig {
//!     log_group_name: "my-app".to_string(),
//!     log_stream_name: "{hostname}-{date}".to_string(),
//!     retention_days: None,
//!     dedicated_writer: false,
//!     auto_create: true,
//! };
//! let facade = Arc::new(LogServiceFacade::new(
//!     http,
//!     "https://logs.example.com",
//!     config,
//!     Arc::new(TracingLogger::new("log-service")),
//! )?);
//!
//! let writer = Writer::new(WriterConfig::default(), facade, Arc::new(TracingLogger::new("writer")))?;
//! writer.start(Duration::from_secs(30))?;
//! writer.enqueue(log_shippers_core::Message::new(0, "hello world"));
//! writer.stop(Duration::from_secs(10));
//! # Ok(())
//! # }
//! ```

mod batch;
mod config;
mod error;
pub mod facade;
pub mod logger;
mod message;
mod queue;
mod retry;
mod stats;
mod substitutions;
mod writer;

pub use batch::{BatchPolicy, Batcher};
pub use config::{RotationTrigger, WriterConfig};
pub use error::{FacadeError, NameValidationError, WriterError};
pub use message::Message;
pub use queue::{DiscardAction, EnqueueOutcome, MessageQueue};
pub use retry::{BackoffMode, CancellationToken, JitterMode, RetryError, RetryManager};
pub use stats::{Statistics, StatisticsSnapshot};
pub use substitutions::{StandardSubstitutions, Substitutions};
pub use writer::{ShutdownGuard, Writer, WriterState};
