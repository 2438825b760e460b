// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use crate::sampling::score::MissingCorrelation;
use reqwest::Url;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://telemetry-intake.datadoghq.com/api/v2/apmtelemetry";

/// Adaptive sampling settings
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub enabled: bool,
    /// Throughput the estimator steers towards, in kept items per second
    pub target_items_per_second: f64,
    pub initial_percentage: f64,
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub evaluation_interval: Duration,
    /// Minimum time between two consecutive decreases of the percentage
    pub decrease_timeout: Duration,
    /// Minimum time between two consecutive increases of the percentage
    pub increase_timeout: Duration,
    /// Weight of the newest interval in the moving average
    pub moving_average_ratio: f64,
    /// Score used for items without a correlation id
    pub missing_correlation: MissingCorrelation,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_items_per_second: 5.0,
            initial_percentage: 100.0,
            min_percentage: 0.1,
            max_percentage: 100.0,
            evaluation_interval: Duration::from_secs(15),
            decrease_timeout: Duration::from_secs(2 * 60),
            increase_timeout: Duration::from_secs(15 * 60),
            moving_average_ratio: 0.25,
            missing_correlation: MissingCorrelation::Random,
        }
    }
}

/// Configuration for a telemetry channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Intake URL every transmission is posted to
    pub endpoint: String,
    /// Number of items that triggers a buffer flush
    pub buffer_capacity: usize,
    /// How often the buffer is flushed when it does not fill up
    pub sending_interval: Duration,
    /// Timeout applied to each transmission
    pub request_timeout: Duration,
    /// Byte capacity of the in-memory transmission queue
    pub queue_capacity_bytes: usize,
    /// Maximum concurrent sends while the intake is healthy
    pub max_sender_concurrency: usize,
    /// Directory for the persistent store. No store when unset.
    pub storage_path: Option<PathBuf>,
    pub storage_max_files: usize,
    pub storage_capacity_bytes: u64,
    /// Base unit of the retry delay
    pub backoff_slot: Duration,
    pub backoff_max_delay: Duration,
    /// Upper bound for the final flush on shutdown
    pub shutdown_timeout: Duration,
    pub compression: bool,
    pub compression_level: i32,
    pub https_proxy: Option<String>,
    pub log_level: String,
    pub sampling: SamplingConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            buffer_capacity: 500,
            sending_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(100),
            queue_capacity_bytes: 1024 * 1024,
            max_sender_concurrency: 3,
            storage_path: None,
            storage_max_files: 5000,
            storage_capacity_bytes: 50 * 1024 * 1024,
            backoff_slot: Duration::from_secs(10),
            backoff_max_delay: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(5),
            compression: false,
            compression_level: 3,
            https_proxy: None,
            log_level: "info".to_string(),
            sampling: SamplingConfig::default(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            debug!("Ignoring malformed value for {name}: {value:?}");
            None
        }
    }
}

fn parse_bool_env(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|val| val.trim().to_lowercase() != "false")
}

impl ChannelConfig {
    /// Create configuration from environment variables. Malformed values keep
    /// their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let sampling_defaults = SamplingConfig::default();

        let secs = |name: &str| parse_env::<u64>(name).map(Duration::from_secs);
        let millis = |name: &str| parse_env::<u64>(name).map(Duration::from_millis);

        let sampling = SamplingConfig {
            enabled: parse_bool_env("DD_TELEMETRY_SAMPLING_ENABLED")
                .unwrap_or(sampling_defaults.enabled),
            target_items_per_second: parse_env("DD_TELEMETRY_SAMPLING_TARGET_EPS")
                .unwrap_or(sampling_defaults.target_items_per_second),
            initial_percentage: parse_env("DD_TELEMETRY_SAMPLING_INITIAL_PERCENTAGE")
                .unwrap_or(sampling_defaults.initial_percentage),
            min_percentage: parse_env("DD_TELEMETRY_SAMPLING_MIN_PERCENTAGE")
                .unwrap_or(sampling_defaults.min_percentage),
            max_percentage: parse_env("DD_TELEMETRY_SAMPLING_MAX_PERCENTAGE")
                .unwrap_or(sampling_defaults.max_percentage),
            evaluation_interval: secs("DD_TELEMETRY_SAMPLING_EVALUATION_INTERVAL_SECS")
                .unwrap_or(sampling_defaults.evaluation_interval),
            decrease_timeout: secs("DD_TELEMETRY_SAMPLING_DECREASE_TIMEOUT_SECS")
                .unwrap_or(sampling_defaults.decrease_timeout),
            increase_timeout: secs("DD_TELEMETRY_SAMPLING_INCREASE_TIMEOUT_SECS")
                .unwrap_or(sampling_defaults.increase_timeout),
            moving_average_ratio: parse_env("DD_TELEMETRY_SAMPLING_EMA_RATIO")
                .unwrap_or(sampling_defaults.moving_average_ratio),
            missing_correlation: parse_env("DD_TELEMETRY_SAMPLING_MISSING_CORRELATION")
                .unwrap_or(sampling_defaults.missing_correlation),
        };

        let config = Self {
            endpoint: env::var("DD_TELEMETRY_ENDPOINT").unwrap_or(defaults.endpoint),
            buffer_capacity: parse_env("DD_TELEMETRY_BUFFER_CAPACITY")
                .unwrap_or(defaults.buffer_capacity),
            sending_interval: millis("DD_TELEMETRY_SENDING_INTERVAL_MS")
                .unwrap_or(defaults.sending_interval),
            request_timeout: secs("DD_TELEMETRY_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout),
            queue_capacity_bytes: parse_env("DD_TELEMETRY_QUEUE_CAPACITY_BYTES")
                .unwrap_or(defaults.queue_capacity_bytes),
            max_sender_concurrency: parse_env("DD_TELEMETRY_MAX_SENDERS")
                .unwrap_or(defaults.max_sender_concurrency),
            storage_path: env::var("DD_TELEMETRY_STORAGE_PATH")
                .ok()
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            storage_max_files: parse_env("DD_TELEMETRY_STORAGE_MAX_FILES")
                .unwrap_or(defaults.storage_max_files),
            storage_capacity_bytes: parse_env("DD_TELEMETRY_STORAGE_CAPACITY_BYTES")
                .unwrap_or(defaults.storage_capacity_bytes),
            backoff_slot: secs("DD_TELEMETRY_BACKOFF_SLOT_SECS").unwrap_or(defaults.backoff_slot),
            backoff_max_delay: secs("DD_TELEMETRY_BACKOFF_MAX_SECS")
                .unwrap_or(defaults.backoff_max_delay),
            shutdown_timeout: millis("DD_TELEMETRY_SHUTDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.shutdown_timeout),
            compression: parse_bool_env("DD_TELEMETRY_COMPRESSION").unwrap_or(defaults.compression),
            compression_level: parse_env("DD_TELEMETRY_COMPRESSION_LEVEL")
                .unwrap_or(defaults.compression_level),
            https_proxy: env::var("DD_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            log_level: env::var("DD_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            sampling,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::Invalid(format!("endpoint {:?} is not a valid URL: {e}", self.endpoint))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Invalid(format!(
                "endpoint must use http or https, got {}",
                url.scheme()
            )));
        }

        if self.queue_capacity_bytes == 0 {
            return Err(ConfigError::Invalid(
                "queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.max_sender_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max sender concurrency must be greater than 0".to_string(),
            ));
        }

        if self.sampling.evaluation_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sampling evaluation interval must be greater than 0".to_string(),
            ));
        }

        if self.sending_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sending interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: &[&str] = &[
        "DD_TELEMETRY_ENDPOINT",
        "DD_TELEMETRY_BUFFER_CAPACITY",
        "DD_TELEMETRY_SENDING_INTERVAL_MS",
        "DD_TELEMETRY_MAX_SENDERS",
        "DD_TELEMETRY_STORAGE_PATH",
        "DD_TELEMETRY_COMPRESSION",
        "DD_TELEMETRY_SAMPLING_TARGET_EPS",
        "DD_TELEMETRY_SAMPLING_MISSING_CORRELATION",
        "DD_PROXY_HTTPS",
        "HTTPS_PROXY",
        "DD_LOG_LEVEL",
    ];

    fn clear_env() {
        for name in ENV_VARS {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_from_empty_env() {
        clear_env();
        let config = ChannelConfig::from_env().expect("default config is valid");
        assert_eq!(config, ChannelConfig::default());
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        clear_env();
        env::set_var("DD_TELEMETRY_ENDPOINT", "http://localhost:8126/telemetry");
        env::set_var("DD_TELEMETRY_BUFFER_CAPACITY", "64");
        env::set_var("DD_TELEMETRY_SENDING_INTERVAL_MS", "250");
        env::set_var("DD_TELEMETRY_STORAGE_PATH", "/tmp/dd-telemetry");
        env::set_var("DD_TELEMETRY_COMPRESSION", "true");
        env::set_var("DD_TELEMETRY_SAMPLING_TARGET_EPS", "20.5");
        env::set_var("DD_TELEMETRY_SAMPLING_MISSING_CORRELATION", "zero");
        env::set_var("HTTPS_PROXY", "http://proxy:3128");
        env::set_var("DD_LOG_LEVEL", "DEBUG");

        let config = ChannelConfig::from_env().expect("config is valid");
        clear_env();

        assert_eq!(config.endpoint, "http://localhost:8126/telemetry");
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.sending_interval, Duration::from_millis(250));
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/dd-telemetry")));
        assert!(config.compression);
        assert!((config.sampling.target_items_per_second - 20.5).abs() < f64::EPSILON);
        assert_eq!(config.sampling.missing_correlation, MissingCorrelation::Zero);
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_malformed_values_keep_defaults() {
        clear_env();
        env::set_var("DD_TELEMETRY_BUFFER_CAPACITY", "lots");
        env::set_var("DD_TELEMETRY_SAMPLING_MISSING_CORRELATION", "sometimes");

        let config = ChannelConfig::from_env().expect("config is valid");
        clear_env();

        assert_eq!(config.buffer_capacity, 500);
        assert_eq!(
            config.sampling.missing_correlation,
            MissingCorrelation::Random
        );
    }

    #[test]
    #[serial]
    fn test_invalid_endpoint_is_rejected() {
        clear_env();
        env::set_var("DD_TELEMETRY_ENDPOINT", "ftp://example.com/upload");
        let result = ChannelConfig::from_env();
        clear_env();

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_zero_senders_is_rejected() {
        clear_env();
        env::set_var("DD_TELEMETRY_MAX_SENDERS", "0");
        let result = ChannelConfig::from_env();
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_queue_capacity() {
        let config = ChannelConfig {
            queue_capacity_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_evaluation_interval() {
        let mut config = ChannelConfig::default();
        config.sampling.evaluation_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_garbage_endpoint() {
        let config = ChannelConfig {
            endpoint: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
