//! Writer configuration, loadable from TOML or built programmatically.

use crate::queue::DiscardAction;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When a rotation-eligible writer (stream-name-based destinations only)
/// should recompute its destination name and re-initialize.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RotationTrigger {
    /// Rotate after this many messages have been sent.
    Count(u64),
    /// Rotate after this much wall-clock time has elapsed since the last
    /// rotation.
    Interval { seconds: u64 },
    /// Rotate at each UTC hour boundary.
    Hourly,
    /// Rotate at each UTC day boundary.
    Daily,
    /// Never rotate automatically; only `Writer::rotate()` triggers it.
    Explicit,
}

/// Fields common to every writer, regardless of which [`crate::facade`]
/// variant it drives.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Milliseconds to accumulate a batch before sending it. `0` selects
    /// synchronous mode: `enqueue` sends on the caller's thread and
    /// no background thread is started.
    pub batch_delay_millis: u64,

    /// Bounded-queue threshold. `0` means "drop everything" when
    /// `discard_action != None`.
    pub discard_threshold: i32,

    /// What to do with messages once the queue is at `discard_threshold`.
    pub discard_action: DiscardAction,

    /// Truncate (rather than drop) messages that exceed the destination's
    /// per-message byte limit.
    pub truncate_oversize: bool,

    /// Force synchronous mode regardless of `batch_delay_millis` (kept as
    /// a distinct flag so a host can flip it without also changing the
    /// batch delay used once back in async mode).
    pub synchronous: bool,

    /// Register a process-exit callback that calls `stop()`.
    pub use_shutdown_hook: bool,

    /// Rotation policy for stream-name-based destinations; ignored by the
    /// topic facade.
    pub rotation: Option<RotationTrigger>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_delay_millis: 2000,
            discard_threshold: 10_000,
            discard_action: DiscardAction::Oldest,
            truncate_oversize: false,
            synchronous: false,
            use_shutdown_hook: false,
            rotation: None,
        }
    }
}

impl WriterConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_millis)
    }

    /// Whether this config selects synchronous mode: either the
    /// flag is set, or the batch delay is exactly zero.
    pub fn is_synchronous(&self) -> bool {
        self.synchronous || self.batch_delay_millis == 0
    }

    /// Parse a `WriterConfig` from a TOML document.
    pub fn from_toml(document: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_batch_delay_is_synchronous() {
        let cfg = WriterConfig {
            batch_delay_millis: 0,
            ..Default::default()
        };
        assert!(cfg.is_synchronous());
    }

    #[test]
    fn parses_from_toml() {
        let doc = r#"
            batch_delay_millis = 500
            discard_threshold = 100
            discard_action = "newest"
            truncate_oversize = true
        "#;
        let cfg = WriterConfig::from_toml(doc).unwrap();
        assert_eq!(cfg.batch_delay_millis, 500);
        assert_eq!(cfg.discard_threshold, 100);
        assert_eq!(cfg.discard_action, DiscardAction::Newest);
        assert!(cfg.truncate_oversize);
    }
}
