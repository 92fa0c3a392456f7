use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::tracker::TrackerConfig;

/// Default remote base URL for local development.
const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";

/// Client configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development; override via
/// environment variables (a `.env` file is honoured by the binary).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL every request path is appended to.
    pub base_url: String,
    /// Timeout for ordinary API calls.
    pub request_timeout: Duration,
    /// Timeout for uploads (image submissions) and downloads.
    pub transfer_timeout: Duration,
    /// Overall bound on tracking one job, across all polls and reconnects.
    pub tracking_timeout: Duration,
    /// First polling interval once the tracker falls back to polling.
    pub poll_interval: Duration,
    /// Polling interval ceiling.
    pub max_poll_interval: Duration,
    /// Try the event stream before polling.
    pub streaming: bool,
    /// Whether the remote accepts `POST /videos/generate/batch`.
    pub batch_submit: bool,
    /// Directory holding the credential slot.
    pub credential_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(300),
            tracking_timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_millis(2000),
            max_poll_interval: Duration::from_millis(10_000),
            streaming: true,
            batch_submit: false,
            credential_dir: default_credential_dir(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                          |
    /// |-----------------------------|----------------------------------|
    /// | `VEO_API_BASE_URL`          | `http://localhost:8000/api/v1`   |
    /// | `VEO_REQUEST_TIMEOUT_SECS`  | `30`                             |
    /// | `VEO_TRANSFER_TIMEOUT_SECS` | `300`                            |
    /// | `VEO_TRACKING_TIMEOUT_SECS` | `900`                            |
    /// | `VEO_POLL_INTERVAL_MS`      | `2000`                           |
    /// | `VEO_POLL_MAX_INTERVAL_MS`  | `10000`                          |
    /// | `VEO_STREAMING`             | `true`                           |
    /// | `VEO_BATCH_SUBMIT`          | `false`                          |
    /// | `VEO_CREDENTIAL_DIR`        | `$HOME/.veo`                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from any lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let base_url = lookup("VEO_API_BASE_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or(defaults.base_url);

        let request_timeout = parse_or(&lookup, "VEO_REQUEST_TIMEOUT_SECS", 30)
            .map(Duration::from_secs)?;
        let transfer_timeout = parse_or(&lookup, "VEO_TRANSFER_TIMEOUT_SECS", 300)
            .map(Duration::from_secs)?;
        let tracking_timeout = parse_or(&lookup, "VEO_TRACKING_TIMEOUT_SECS", 900)
            .map(Duration::from_secs)?;
        let poll_interval = parse_or(&lookup, "VEO_POLL_INTERVAL_MS", 2000)
            .map(Duration::from_millis)?;
        let max_poll_interval = parse_or(&lookup, "VEO_POLL_MAX_INTERVAL_MS", 10_000)
            .map(Duration::from_millis)?;
        let streaming = parse_or(&lookup, "VEO_STREAMING", true)?;
        let batch_submit = parse_or(&lookup, "VEO_BATCH_SUBMIT", false)?;

        if max_poll_interval < poll_interval {
            return Err(ConfigError::Invalid {
                key: "VEO_POLL_MAX_INTERVAL_MS",
                value: max_poll_interval.as_millis().to_string(),
                reason: "must not be smaller than VEO_POLL_INTERVAL_MS".to_string(),
            });
        }

        let credential_dir = lookup("VEO_CREDENTIAL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.credential_dir);

        Ok(Self {
            base_url,
            request_timeout,
            transfer_timeout,
            tracking_timeout,
            poll_interval,
            max_poll_interval,
            streaming,
            batch_submit,
            credential_dir,
        })
    }

    /// Tracker settings derived from this configuration.
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            streaming: self.streaming,
            poll_interval: self.poll_interval,
            max_poll_interval: self.max_poll_interval,
            default_timeout: self.tracking_timeout,
            ..TrackerConfig::default()
        }
    }
}

fn default_credential_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".veo")
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// A malformed configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
