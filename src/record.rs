//! Log record data model shared by every ingestion path.
//!
//! Records are built once (by a framework adapter, the file tailer, or the
//! `LogSink` helpers) and never mutated afterwards; the builder-style `with_*`
//! methods consume the record and return a new one.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

static LEVEL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(SEVERE|ERROR|WARNING|WARN|INFO|DEBUG|FINE)\b")
        .expect("level pattern is valid")
});

/// Log severity levels, mapped onto the OTLP severity number ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Severity {
    #[default]
    Unspecified,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    /// OTLP `SeverityNumber` for the first slot of this level's range.
    pub fn otlp_number(&self) -> i32 {
        match self {
            Severity::Unspecified => 0,
            Severity::Trace => 1,
            Severity::Debug => 5,
            Severity::Info => 9,
            Severity::Warn => 13,
            Severity::Error => 17,
            Severity::Fatal => 21,
        }
    }

    /// Canonical upper-case text used for `severity_text` when none is given.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unspecified => "UNSPECIFIED",
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    /// Infer a severity from free text by looking for the first level token.
    ///
    /// Matching is case-insensitive and word-bounded, so `INFORMATION` does not
    /// count as `INFO`. `SEVERE` and `FINE` are accepted as aliases of `ERROR`
    /// and `DEBUG`.
    pub fn infer(text: &str) -> Severity {
        let Some(caps) = LEVEL_PATTERN.captures(text) else {
            return Severity::Unspecified;
        };
        match caps[1].to_ascii_uppercase().as_str() {
            "ERROR" | "SEVERE" => Severity::Error,
            "WARN" | "WARNING" => Severity::Warn,
            "DEBUG" | "FINE" => Severity::Debug,
            "INFO" => Severity::Info,
            _ => Severity::Unspecified,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered string key/value pairs with unique keys.
///
/// Inserting an existing key replaces its value in place, keeping the
/// original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn extend<I, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in pairs {
            self.insert(k, v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        attrs.extend(iter);
        attrs
    }
}

/// A single structured log event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    time_unix_nano: u64,
    observed_time_unix_nano: u64,
    severity: Severity,
    severity_text: String,
    body: String,
    attributes: Attributes,
}

impl LogRecord {
    /// Create a record stamped with the current time and no severity.
    pub fn new(body: impl Into<String>) -> Self {
        let now = now_unix_nanos();
        Self {
            time_unix_nano: now,
            observed_time_unix_nano: now,
            severity: Severity::Unspecified,
            severity_text: Severity::Unspecified.as_str().to_string(),
            body: body.into(),
            attributes: Attributes::new(),
        }
    }

    /// Set the event time. The observed time is left untouched.
    pub fn with_time(mut self, time_unix_nano: u64) -> Self {
        self.time_unix_nano = time_unix_nano;
        self
    }

    pub fn with_observed_time(mut self, observed_time_unix_nano: u64) -> Self {
        self.observed_time_unix_nano = observed_time_unix_nano;
        self
    }

    /// Set the severity; the text follows the level's canonical name.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self.severity_text = severity.as_str().to_string();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key, value);
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn time_unix_nano(&self) -> u64 {
        self.time_unix_nano
    }

    pub fn observed_time_unix_nano(&self) -> u64 {
        self.observed_time_unix_nano
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn severity_text(&self) -> &str {
        &self.severity_text
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

/// Attributes sent once per export call rather than per record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceContext {
    attributes: Attributes,
}

impl ResourceContext {
    pub fn new(attributes: Attributes) -> Self {
        Self { attributes }
    }

    /// Resource carrying `service.name` plus the given static tags.
    pub fn for_service(service_name: &str, tags: &Attributes) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert("service.name", service_name);
        attributes.extend(tags.iter());
        Self { attributes }
    }

    /// A copy of this resource with extra attributes layered on top.
    pub fn merged_with(&self, extra: &Attributes) -> Self {
        let mut attributes = self.attributes.clone();
        attributes.extend(extra.iter());
        Self { attributes }
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn service_name(&self) -> Option<&str> {
        self.attributes.get("service.name")
    }
}

/// An ordered group of records shipped in one export call.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Client-side identifier, only used to correlate log lines
    pub batch_id: Uuid,

    pub records: Vec<LogRecord>,
}

impl Batch {
    pub fn new(records: Vec<LogRecord>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Current wall-clock time as nanoseconds since the Unix epoch.
pub fn now_unix_nanos() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or(0)
}
