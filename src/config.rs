//! Configuration module for the log sink.
//!
//! `Config` is an immutable value: it is only produced by [`ConfigBuilder::build`]
//! (or [`Config::from_env`], which feeds the builder), and the builder validates
//! every option before any component starts.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::record::{Attributes, ResourceContext};

/// Default record-start pattern: an ISO-like `YYYY-MM-DD[ T]HH:MM:SS` prefix.
pub const DEFAULT_RECORD_START_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}";

/// Header carrying the API key on every export request.
pub const DEFAULT_API_KEY_HEADER: &str = "x-cardinalhq-api-key";

const DEFAULT_SERVICE_NAME: &str = "logsink";
const DEFAULT_CHECKPOINT_DIR: &str = "./checkpoints";

/// Default batch size (number of records per export call)
const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default engine queue size; rounded up to a power of two by the engine
const DEFAULT_QUEUE_SIZE: usize = 1000;

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

/// Derives per-file resource attributes from the tailed file's path.
pub type AttributesDeriver = Arc<dyn Fn(&Path) -> Attributes + Send + Sync>;

/// Error type for configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held an unusable value
    #[error("Configuration error for {var}: {message}")]
    Env { var: String, message: String },

    /// A builder option failed validation
    #[error("Configuration error: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn env(var: &str, message: impl Into<String>) -> Self {
        ConfigError::Env {
            var: var.to_string(),
            message: message.into(),
        }
    }
}

/// Validated, immutable configuration shared by all components.
#[derive(Clone)]
pub struct Config {
    otlp_endpoint: String,
    api_key: String,
    api_key_header: String,
    max_batch_size: usize,
    queue_size: usize,
    flush_interval: Duration,
    publish_interval: Duration,
    record_start_pattern: Regex,
    checkpoint_dir: PathBuf,
    attributes_deriver: AttributesDeriver,
    service_name: String,
    resource_attributes: Attributes,
    request_timeout: Duration,
    follow: bool,
    poll_interval: Duration,
    max_concurrent_tailers: Option<usize>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("otlp_endpoint", &self.otlp_endpoint)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .field("api_key_header", &self.api_key_header)
            .field("max_batch_size", &self.max_batch_size)
            .field("queue_size", &self.queue_size)
            .field("flush_interval", &self.flush_interval)
            .field("publish_interval", &self.publish_interval)
            .field("record_start_pattern", &self.record_start_pattern.as_str())
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("service_name", &self.service_name)
            .field("resource_attributes", &self.resource_attributes)
            .field("request_timeout", &self.request_timeout)
            .field("follow", &self.follow)
            .field("poll_interval", &self.poll_interval)
            .field("max_concurrent_tailers", &self.max_concurrent_tailers)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// The endpoint comes from `LOGSINK_OTLP_ENDPOINT`, falling back to the
    /// standard `OTEL_EXPORTER_OTLP_ENDPOINT`. `OTEL_SERVICE_NAME` and
    /// `OTEL_RESOURCE_ATTRIBUTES` are honoured as well. Everything else uses the
    /// `LOGSINK_` prefix.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the resulting
    /// configuration fails validation (e.g. no endpoint at all).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder_from_env()?.build()
    }

    /// Like [`Config::from_env`] but returns the builder so callers (the CLI)
    /// can layer overrides on top before validating.
    pub fn builder_from_env() -> Result<ConfigBuilder, ConfigError> {
        let mut builder = Config::builder();

        if let Some(endpoint) = env_string("LOGSINK_OTLP_ENDPOINT")
            .or_else(|| env_string("OTEL_EXPORTER_OTLP_ENDPOINT"))
        {
            builder = builder.otlp_endpoint(endpoint);
        }
        if let Some(key) = env_string("LOGSINK_API_KEY") {
            builder = builder.api_key(key);
        }
        if let Some(header) = env_string("LOGSINK_API_KEY_HEADER") {
            builder = builder.api_key_header(header);
        }
        if let Some(size) = parse_env::<usize>("LOGSINK_MAX_BATCH_SIZE")? {
            builder = builder.max_batch_size(size);
        }
        if let Some(size) = parse_env::<usize>("LOGSINK_QUEUE_SIZE")? {
            builder = builder.queue_size(size);
        }
        if let Some(ms) = parse_env::<u64>("LOGSINK_FLUSH_INTERVAL_MS")? {
            builder = builder.flush_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_env::<u64>("LOGSINK_PUBLISH_INTERVAL_MS")? {
            builder = builder.publish_interval(Duration::from_millis(ms));
        }
        if let Some(pattern) = env_string("LOGSINK_RECORD_START_PATTERN") {
            let regex = Regex::new(&pattern).map_err(|e| {
                ConfigError::env("LOGSINK_RECORD_START_PATTERN", format!("invalid regex: {}", e))
            })?;
            builder = builder.record_start_pattern(regex);
        }
        if let Some(dir) = env_string("LOGSINK_CHECKPOINT_DIR") {
            builder = builder.checkpoint_dir(dir);
        }
        if let Some(secs) = parse_env::<u64>("LOGSINK_REQUEST_TIMEOUT_SECS")? {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        if let Some(follow) = env_string("LOGSINK_FOLLOW") {
            let follow = parse_bool(&follow)
                .ok_or_else(|| ConfigError::env("LOGSINK_FOLLOW", format!("'{}' is not a boolean", follow)))?;
            builder = builder.follow(follow);
        }
        if let Some(ms) = parse_env::<u64>("LOGSINK_POLL_INTERVAL_MS")? {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }
        if let Some(n) = parse_env::<usize>("LOGSINK_MAX_CONCURRENT_TAILERS")? {
            builder = builder.max_concurrent_tailers(n);
        }
        if let Some(service) = env_string("OTEL_SERVICE_NAME") {
            builder = builder.service_name(service);
        }
        if let Some(attrs) = env_string("OTEL_RESOURCE_ATTRIBUTES") {
            builder = builder.resource_attributes(parse_resource_attributes(&attrs));
        }

        Ok(builder)
    }

    pub fn otlp_endpoint(&self) -> &str {
        &self.otlp_endpoint
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn api_key_header(&self) -> &str {
        &self.api_key_header
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Engine ticker period.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Time budget a tailer lets records sit in memory before exporting.
    pub fn publish_interval(&self) -> Duration {
        self.publish_interval
    }

    pub fn record_start_pattern(&self) -> &Regex {
        &self.record_start_pattern
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn resource_attributes(&self) -> &Attributes {
        &self.resource_attributes
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn follow(&self) -> bool {
        self.follow
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn max_concurrent_tailers(&self) -> Option<usize> {
        self.max_concurrent_tailers
    }

    /// Resource attached to programmatic (non-file) exports.
    pub fn resource(&self) -> ResourceContext {
        ResourceContext::for_service(&self.service_name, &self.resource_attributes)
    }

    /// Resource attached to exports of records read from `path`.
    pub fn resource_for_file(&self, path: &Path) -> ResourceContext {
        self.resource().merged_with(&(self.attributes_deriver)(path))
    }
}

/// Builder for [`Config`]; every setter is optional except the endpoint.
#[derive(Clone)]
pub struct ConfigBuilder {
    otlp_endpoint: Option<String>,
    api_key: String,
    api_key_header: String,
    max_batch_size: usize,
    queue_size: usize,
    flush_interval: Duration,
    publish_interval: Duration,
    record_start_pattern: Option<Regex>,
    checkpoint_dir: PathBuf,
    attributes_deriver: AttributesDeriver,
    service_name: String,
    resource_attributes: Attributes,
    request_timeout: Duration,
    follow: bool,
    poll_interval: Duration,
    max_concurrent_tailers: Option<usize>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            api_key: String::new(),
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            publish_interval: Duration::from_millis(DEFAULT_PUBLISH_INTERVAL_MS),
            record_start_pattern: None,
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            attributes_deriver: Arc::new(default_file_attributes),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            resource_attributes: Attributes::new(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            follow: false,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_concurrent_tailers: None,
        }
    }
}

impl ConfigBuilder {
    pub fn otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    pub fn api_key_header(mut self, header: impl Into<String>) -> Self {
        self.api_key_header = header.into();
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    pub fn record_start_pattern(mut self, pattern: Regex) -> Self {
        self.record_start_pattern = Some(pattern);
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn attributes_deriver<F>(mut self, deriver: F) -> Self
    where
        F: Fn(&Path) -> Attributes + Send + Sync + 'static,
    {
        self.attributes_deriver = Arc::new(deriver);
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn resource_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource_attributes.insert(key, value);
        self
    }

    pub fn resource_attributes(mut self, attributes: Attributes) -> Self {
        self.resource_attributes.extend(attributes.iter());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_concurrent_tailers(mut self, limit: usize) -> Self {
        self.max_concurrent_tailers = Some(limit);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        let endpoint = self
            .otlp_endpoint
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ConfigError::Invalid("OTLP endpoint must be provided".to_string()))?;

        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| ConfigError::Invalid(format!("invalid OTLP endpoint '{}': {}", endpoint, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Invalid(format!(
                "OTLP endpoint must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.api_key_header.trim().is_empty() {
            return Err(ConfigError::Invalid("API key header name must not be empty".to_string()));
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max batch size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.max_batch_size
            )));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::Invalid("queue size must be greater than 0".to_string()));
        }
        for (name, value) in [
            ("flush interval", self.flush_interval),
            ("publish interval", self.publish_interval),
            ("poll interval", self.poll_interval),
            ("request timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.max_concurrent_tailers == Some(0) {
            return Err(ConfigError::Invalid(
                "max concurrent tailers must be greater than 0".to_string(),
            ));
        }
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid("service name must not be empty".to_string()));
        }

        let record_start_pattern = match self.record_start_pattern {
            Some(pattern) => pattern,
            None => Regex::new(DEFAULT_RECORD_START_PATTERN)
                .map_err(|e| ConfigError::Invalid(format!("default record pattern: {}", e)))?,
        };

        Ok(Config {
            otlp_endpoint: endpoint,
            api_key: self.api_key,
            api_key_header: self.api_key_header,
            max_batch_size: self.max_batch_size,
            queue_size: self.queue_size,
            flush_interval: self.flush_interval,
            publish_interval: self.publish_interval,
            record_start_pattern,
            checkpoint_dir: self.checkpoint_dir,
            attributes_deriver: self.attributes_deriver,
            service_name: self.service_name,
            resource_attributes: self.resource_attributes,
            request_timeout: self.request_timeout,
            follow: self.follow,
            poll_interval: self.poll_interval,
            max_concurrent_tailers: self.max_concurrent_tailers,
        })
    }
}

/// Default per-file attributes: the file's full path and base name.
pub fn default_file_attributes(path: &Path) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("log.file.path", path.to_string_lossy());
    if let Some(name) = path.file_name() {
        attrs.insert("log.file.name", name.to_string_lossy());
    }
    attrs
}

/// Parse the `OTEL_RESOURCE_ATTRIBUTES` format: `k1=v1,k2=v2`.
///
/// Pairs without a key or without a value are skipped.
pub fn parse_resource_attributes(raw: &str) -> Attributes {
    let mut attrs = Attributes::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        attrs.insert(key, value);
    }
    attrs
}

fn env_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match env_string(var) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::env(var, format!("'{}' is not a valid number", value))),
        None => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
