//! Configuration module for Presign Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and per-field validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex_lite::Regex =
            regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}")
                .expect("env var pattern is valid");
    }

    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_VAR.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Missing required configuration field: {0}")]
    MissingField(&'static str),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub signer: SignerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    ///
    /// Every problem is reported against the field that caused it, so a
    /// missing signer endpoint and a zero part count produce different errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signer.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField("signer.endpoint"));
        }
        if !is_valid_http_url(&self.signer.endpoint) {
            return Err(ConfigError::ValidationError(format!(
                "signer.endpoint must start with http:// or https://, got: {}",
                self.signer.endpoint
            )));
        }
        if self.signer.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "signer.timeout_seconds must be greater than 0".into(),
            ));
        }

        if self.upload.max_parts == 0 {
            return Err(ConfigError::ValidationError(
                "upload.max_parts must be at least 1".into(),
            ));
        }
        if self.upload.max_parts > crate::upload::planner::MAX_PARTS {
            return Err(ConfigError::ValidationError(format!(
                "upload.max_parts must not exceed {}",
                crate::upload::planner::MAX_PARTS
            )));
        }
        if self.upload.acl.trim().is_empty() {
            return Err(ConfigError::MissingField("upload.acl"));
        }
        if self.upload.abort_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "upload.abort_timeout_seconds must be greater than 0".into(),
            ));
        }
        if let Some(0) = self.upload.concurrent_parts {
            return Err(ConfigError::ValidationError(
                "upload.concurrent_parts must be at least 1 when set".into(),
            ));
        }
        for name in self.upload.headers.keys() {
            if name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "upload.headers contains an empty header name".into(),
                ));
            }
        }

        if self.transport.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "transport.chunk_size must be greater than 0".into(),
            ));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid logging.format '{}': must be 'pretty' or 'json'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Signing endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Absolute URL of the signing route (e.g. `http://localhost:4000/sign`)
    #[serde(default)]
    pub endpoint: String,
    /// Lifetime requested for each signed URL, forwarded as `expires`
    #[serde(default)]
    pub expires_seconds: Option<u64>,
    #[serde(default = "default_signer_timeout")]
    pub timeout_seconds: u64,
}

impl SignerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn expires(&self) -> Option<Duration> {
        self.expires_seconds.map(Duration::from_secs)
    }
}

fn default_signer_timeout() -> u64 {
    30
}

/// How per-part progress is folded into the session's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressAggregation {
    /// Unweighted mean of every part's percent
    #[default]
    Mean,
    /// Mean weighted by each part's byte length
    Weighted,
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,
    /// Upper bound on parts in flight at once; unbounded when absent
    #[serde(default)]
    pub concurrent_parts: Option<usize>,
    #[serde(default = "default_acl")]
    pub acl: String,
    #[serde(default)]
    pub part_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound on the remote abort issued after failure or cancellation
    #[serde(default = "default_abort_timeout_seconds")]
    pub abort_timeout_seconds: u64,
    #[serde(default)]
    pub progress: ProgressAggregation,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl UploadConfig {
    pub fn concurrency_limit(&self) -> Option<NonZeroUsize> {
        self.concurrent_parts.and_then(NonZeroUsize::new)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_secs(self.abort_timeout_seconds)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: default_multipart_threshold(),
            max_parts: default_max_parts(),
            concurrent_parts: None,
            acl: default_acl(),
            part_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            abort_timeout_seconds: default_abort_timeout_seconds(),
            progress: ProgressAggregation::default(),
            headers: BTreeMap::new(),
        }
    }
}

fn default_multipart_threshold() -> u64 {
    20971520 // 20MB
}

fn default_max_parts() -> usize {
    4
}

fn default_acl() -> String {
    "public-read".to_string()
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_abort_timeout_seconds() -> u64 {
    10
}

/// Store transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Whole-request timeout; none by default since parts can be large
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Body chunk size used for progress reporting
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl TransportConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    65536 // 64KB
}

/// Logging configuration
///
/// `RUST_LOG` takes precedence over `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
