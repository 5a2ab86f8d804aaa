//! Configuration types for export-subscriber

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Credential issuer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Issuer base URL. When it carries no path, the default
    /// temporary-endpoints path is appended.
    pub url: String,

    /// Integration partner name sent with every issue request
    pub integration_name: String,

    /// Resource identifier the access token is requested for
    #[serde(default)]
    pub resource_id: Option<String>,

    /// Pre-acquired bearer token for the issuer (None = anonymous request)
    #[serde(default)]
    pub access_token: Option<String>,

    /// Timeout for a single issue request (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            integration_name: String::new(),
            resource_id: None,
            access_token: None,
            timeout: default_request_timeout(),
        }
    }
}

/// Local storage settings (working files and output artifacts)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root folder for per-message output folders (default: "./output")
    ///
    /// If this folder does not exist, processed records are not persisted.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Folder for downloaded working files (default: system temp directory)
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            temp_dir: default_temp_dir(),
        }
    }
}

/// Subscription pump behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PumpConfig {
    /// The one blob type this job handles (default: "testdata")
    #[serde(default = "default_blob_type")]
    pub supported_blob_type: String,

    /// Content type accepted for the supported blob type
    /// (default: "application/x-jsonlines")
    #[serde(default = "default_content_type")]
    pub supported_content_type: String,

    /// Minimum age of a bundle before another refresh is allowed
    /// (default: 300 seconds)
    #[serde(default = "default_refresh_interval", with = "duration_serde")]
    pub min_refresh_interval: Duration,

    /// Pause applied after a denied refresh (default: 300 seconds)
    #[serde(default = "default_cooldown", with = "duration_serde")]
    pub cooldown: Duration,

    /// Broker message lock duration (default: 60 seconds)
    #[serde(default = "default_lock_duration", with = "duration_serde")]
    pub lock_duration: Duration,

    /// Part of the lock window reserved for complete/abandon round trips
    /// (default: 10 seconds)
    #[serde(default = "default_lock_margin", with = "duration_serde")]
    pub lock_margin: Duration,

    /// Messages the transport may buffer ahead of the handler (default: 10)
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u32,

    /// Wait between receive attempts on an empty subscription
    /// (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// Capacity of the pump event channel (default: 256)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            supported_blob_type: default_blob_type(),
            supported_content_type: default_content_type(),
            min_refresh_interval: default_refresh_interval(),
            cooldown: default_cooldown(),
            lock_duration: default_lock_duration(),
            lock_margin: default_lock_margin(),
            prefetch_count: default_prefetch_count(),
            poll_interval: default_poll_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl PumpConfig {
    /// Time budget for fetch + process of one message
    pub fn processing_deadline(&self) -> Duration {
        self.lock_duration.saturating_sub(self.lock_margin)
    }
}

/// Retry configuration for the startup credential fetch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for the subscription pump
///
/// Sections mirror the collaborators they configure:
/// - [`issuer`](IssuerConfig): where credentials come from
/// - [`storage`](StorageConfig): working files and output artifacts
/// - [`pump`](PumpConfig): message handling and the lock budget
/// - [`retry`](RetryConfig): startup credential retries
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Credential issuer settings
    pub issuer: IssuerConfig,

    /// Local storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Pump behavior
    #[serde(default)]
    pub pump: PumpConfig,

    /// Startup retry policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load and validate configuration from a JSON settings file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.issuer.url.trim().is_empty() {
            return Err(Error::config("issuer.url", "issuer URL is required"));
        }
        if let Err(e) = url::Url::parse(self.issuer.url.trim()) {
            return Err(Error::config(
                "issuer.url",
                format!("issuer URL is not absolute: {e}"),
            ));
        }
        if self.issuer.integration_name.trim().is_empty() {
            return Err(Error::config(
                "issuer.integration_name",
                "integration name is required",
            ));
        }
        if self.pump.supported_blob_type.trim().is_empty() {
            return Err(Error::config(
                "pump.supported_blob_type",
                "a supported blob type is required",
            ));
        }
        if self.pump.min_refresh_interval.is_zero() {
            return Err(Error::config(
                "pump.min_refresh_interval",
                "minimum refresh interval must be positive",
            ));
        }
        if self.pump.processing_deadline().is_zero() {
            return Err(Error::config(
                "pump.lock_margin",
                "lock margin must be shorter than the lock duration",
            ));
        }
        if self.pump.event_capacity == 0 {
            return Err(Error::config(
                "pump.event_capacity",
                "event channel capacity must be positive",
            ));
        }
        Ok(())
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_blob_type() -> String {
    "testdata".to_string()
}

fn default_content_type() -> String {
    "application/x-jsonlines".to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_lock_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_lock_margin() -> Duration {
    Duration::from_secs(10)
}

fn default_prefetch_count() -> u32 {
    10
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_event_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
