//! Placeholder expansion for destination names, ARNs and subjects.
//!
//! Substitution only ever runs at initialization and after rotation -
//! never per message - so none of this sits on the hot path.

use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single placeholder resolver. Implement this to plug in host-specific
/// values (EC2 instance metadata, an account id looked up once at startup,
/// etc.) without the core needing to know how to reach those services -
/// keeping facade construction a thin adapter over whatever host
/// environment it runs in.
pub trait Substitutions: Send + Sync {
    /// Expand every `{placeholder}` occurrence in `template`. Unknown
    /// placeholders are left verbatim so a typo doesn't silently turn into
    /// an empty string in a destination name.
    fn expand(&self, template: &str) -> String;
}

type MetadataProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// The standard set of supported placeholders:
/// `{date}`, `{timestamp}`, `{hourlyTimestamp}`, `{startupTimestamp}`,
/// `{pid}`, `{hostname}`, `{sequence}`, `{aws:accountId}`,
/// `{ec2:instanceId}`, `{ec2:region}`, `{sysprop:NAME}`, `{env:NAME}`.
pub struct StandardSubstitutions {
    startup_timestamp_millis: i64,
    pid: u32,
    hostname: String,
    sequence: AtomicU64,
    properties: HashMap<String, String>,
    account_id: Option<MetadataProvider>,
    instance_id: Option<MetadataProvider>,
    region: Option<MetadataProvider>,
}

impl StandardSubstitutions {
    /// Create a substitution context, capturing `{startupTimestamp}` as
    /// "now".
    pub fn new() -> Self {
        Self::with_startup_millis(now_millis())
    }

    /// Create a substitution context with an explicit startup timestamp
    /// (for tests, or hosts that want `{startupTimestamp}` to reflect
    /// process launch rather than writer construction).
    pub fn with_startup_millis(startup_timestamp_millis: i64) -> Self {
        Self {
            startup_timestamp_millis,
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            sequence: AtomicU64::new(0),
            properties: HashMap::new(),
            account_id: None,
            instance_id: None,
            region: None,
        }
    }

    /// Register a `{sysprop:NAME}` value (the Rust analogue of a JVM
    /// system property: a host-supplied key/value the writer itself never
    /// discovers on its own).
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Register a provider for `{aws:accountId}`.
    pub fn with_account_id_provider(
        mut self,
        provider: impl Fn() -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.account_id = Some(Arc::new(provider));
        self
    }

    /// Register a provider for `{ec2:instanceId}`.
    pub fn with_instance_id_provider(
        mut self,
        provider: impl Fn() -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.instance_id = Some(Arc::new(provider));
        self
    }

    /// Register a provider for `{ec2:region}`.
    pub fn with_region_provider(
        mut self,
        provider: impl Fn() -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.region = Some(Arc::new(provider));
        self
    }

    fn resolve(&self, placeholder: &str) -> Option<String> {
        if let Some(name) = placeholder.strip_prefix("sysprop:") {
            return self.properties.get(name).cloned();
        }
        if let Some(name) = placeholder.strip_prefix("env:") {
            return std::env::var(name).ok();
        }

        match placeholder {
            "date" => Some(format_utc_millis(now_millis(), "%Y-%m-%d")),
            "timestamp" => Some(now_millis().to_string()),
            "hourlyTimestamp" => Some(hourly_timestamp(now_millis())),
            "startupTimestamp" => Some(self.startup_timestamp_millis.to_string()),
            "pid" => Some(self.pid.to_string()),
            "hostname" => Some(self.hostname.clone()),
            "sequence" => Some(self.sequence.fetch_add(1, Ordering::Relaxed).to_string()),
            "aws:accountId" => self.account_id.as_ref().and_then(|p| p()),
            "ec2:instanceId" => self.instance_id.as_ref().and_then(|p| p()),
            "ec2:region" => self.region.as_ref().and_then(|p| p()),
            _ => None,
        }
    }
}

impl Default for StandardSubstitutions {
    fn default() -> Self {
        Self::new()
    }
}

impl Substitutions for StandardSubstitutions {
    fn expand(&self, template: &str) -> String {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                output.push_str(rest);
                return output;
            };
            let close = open + close;

            output.push_str(&rest[..open]);
            let placeholder = &rest[open + 1..close];

            match self.resolve(placeholder) {
                Some(value) => output.push_str(&value),
                None => {
                    output.push('{');
                    output.push_str(placeholder);
                    output.push('}');
                }
            }

            rest = &rest[close + 1..];
        }

        output.push_str(rest);
        output
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn format_utc_millis(millis: i64, fmt: &str) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format(fmt).to_string())
        .unwrap_or_default()
}

/// `{hourlyTimestamp}`: the UTC hour-of-year bucket, seconds and minutes
/// zeroed, derived from the raw epoch millis - not by truncating a
/// formatted timestamp string, which would bucket incorrectly across
/// month/year boundaries.
fn hourly_timestamp(millis: i64) -> String {
    format_utc_millis(millis, "%Y%m%d%H0000")
}
