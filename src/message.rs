//! A single log event as accepted by the writer.

use std::cmp::Ordering;

/// An immutable log event: a formatted line of text plus the timestamp it
/// was produced at.
///
/// `byte_length` is computed once at construction and cached as the UTF-8
/// byte length of `text`. Ordering by timestamp is
/// intentionally non-total: two messages with equal timestamps are neither
/// less nor greater than each other (insertion order, not `Message::less`,
/// is what keeps them in FIFO order inside the queue).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    timestamp: i64,
    text: String,
    byte_length: usize,
}

impl Message {
    /// Construct a message, computing and caching its UTF-8 byte length.
    pub fn new(timestamp: i64, text: impl Into<String>) -> Self {
        let text = text.into();
        let byte_length = text.len();
        Self {
            timestamp,
            text,
            byte_length,
        }
    }

    /// Epoch milliseconds this message was produced at.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The formatted text of this message.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Cached UTF-8 byte length of `text()`.
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Ordering relation used only by tests: `less(a, b)` iff `a.timestamp <
    /// b.timestamp`. Deliberately not a total order — callers that need
    /// FIFO semantics for equal timestamps must rely on queue order, not
    /// this comparison.
    pub fn less(&self, other: &Message) -> bool {
        self.timestamp < other.timestamp
    }

    /// Partial ordering by timestamp only, matching `less`. Equal
    /// timestamps compare as `Equal` even though `less`/`less` both return
    /// `false` for them - this is intentionally not antisymmetric with
    /// insertion order and must not be used to sort two messages that are
    /// otherwise FIFO-ordered in a queue.
    pub fn timestamp_cmp(&self, other: &Message) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}
