//! The writer's own diagnostics channel, kept separate from the
//! application's logging framework so an appender shell can route core
//! diagnostics wherever it likes.

use std::fmt;

/// Diagnostics sink for the core's own operation. An appender shell
/// supplies an implementation at construction; the writer never calls
/// into any other logging facility directly.
pub trait InternalLogger: Send + Sync {
    fn debug(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str, cause: Option<&(dyn std::error::Error + 'static)>);
}

/// Default [`InternalLogger`] that forwards to the `tracing` crate at the
/// matching level, with the writer's component name attached as a span
/// field.
pub struct TracingLogger {
    component: &'static str,
}

impl TracingLogger {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }
}

impl InternalLogger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!(component = self.component, "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(component = self.component, "{message}");
    }

    fn error(&self, message: &str, cause: Option<&(dyn std::error::Error + 'static)>) {
        match cause {
            Some(err) => tracing::error!(component = self.component, error = %err, "{message}"),
            None => tracing::error!(component = self.component, "{message}"),
        }
    }
}

/// A no-op logger for tests that don't want tracing output.
pub struct NullLogger;

impl InternalLogger for NullLogger {
    fn debug(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str, _cause: Option<&(dyn std::error::Error + 'static)>) {}
}

impl fmt::Debug for TracingLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingLogger")
            .field("component", &self.component)
            .finish()
    }
}
