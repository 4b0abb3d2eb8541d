//! JSON configuration file, CLI overrides, and validation.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use relay_core::delivery::DEFAULT_BASE_URL as DEFAULT_DELIVERY_BASE_URL;
use relay_core::provider::{
    DEFAULT_API_BASE_URL, DEFAULT_OPERATION_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_STAGING_DIR,
    ProviderConfig, Throttle,
};
use relay_core::worker::{
    DEFAULT_BASE_DELAY, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_VOLUME_SIZE, PipelineConfig, RetryPolicy,
};
use serde::Deserialize;
use tracing::info;

use crate::cli::Args;

/// Config file used when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Upper bound for `period_secs`.
const MAX_PERIOD_SECS: f64 = 3600.0;

/// A credential that never shows up in logs.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"***\"")
        }
    }
}

/// Runtime settings. Every field is optional in the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub workers: usize,
    pub provider_token: Secret,
    pub bot_token: Secret,
    pub api_base_url: String,
    pub delivery_base_url: String,
    pub staging_dir: String,
    pub volume_size: u64,
    pub buffer_size: usize,
    pub requests_per_period: u32,
    pub period_secs: f64,
    pub operation_poll_interval_secs: u64,
    pub operation_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub queue_capacity: usize,
    pub cache_path: PathBuf,
    pub db_path: PathBuf,
    pub work_dir: PathBuf,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            provider_token: Secret::default(),
            bot_token: Secret::default(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            delivery_base_url: DEFAULT_DELIVERY_BASE_URL.to_string(),
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            volume_size: DEFAULT_VOLUME_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            requests_per_period: 35,
            period_secs: 1.0,
            operation_poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT.as_secs(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_secs: DEFAULT_BASE_DELAY.as_secs(),
            retry_max_delay_secs: DEFAULT_MAX_DELAY.as_secs(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cache_path: PathBuf::from("data/cache.json"),
            db_path: PathBuf::from("data/statistics.db"),
            work_dir: PathBuf::from("temp"),
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
        }
    }
}

impl Config {
    /// Loads the file named by `--config`, or [`DEFAULT_CONFIG_PATH`] if it
    /// exists, or built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    info!("no config file found, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Applies CLI flags on top of file values.
    pub fn apply_overrides(&mut self, args: &Args) {
        if let Some(workers) = args.workers {
            self.workers = usize::from(workers);
        }
        if let Some(volume_size) = args.volume_size {
            self.volume_size = volume_size;
        }
    }

    /// Validates values against runtime constraints.
    pub fn validate(&self) -> Result<()> {
        if !(1..=64).contains(&self.workers) {
            bail!(
                "Invalid config value for `workers`: {}. Expected range: 1..=64",
                self.workers
            );
        }
        if self.volume_size == 0 {
            bail!("Invalid config value for `volume_size`: 0. Expected a positive byte count");
        }
        if self.buffer_size == 0 {
            bail!("Invalid config value for `buffer_size`: 0. Expected a positive byte count");
        }
        if self.requests_per_period > 0
            && !(self.period_secs > 0.0 && self.period_secs <= MAX_PERIOD_SECS)
        {
            bail!(
                "Invalid config value for `period_secs`: {}. Expected range: (0, {MAX_PERIOD_SECS}]",
                self.period_secs
            );
        }
        if self.operation_poll_interval_secs == 0 {
            bail!("Invalid config value for `operation_poll_interval_secs`: 0. Expected >= 1");
        }
        if self.operation_timeout_secs < self.operation_poll_interval_secs {
            bail!(
                "Invalid config value for `operation_timeout_secs`: {}. Expected >= operation_poll_interval_secs ({})",
                self.operation_timeout_secs,
                self.operation_poll_interval_secs
            );
        }
        if !(1..=100).contains(&self.max_attempts) {
            bail!(
                "Invalid config value for `max_attempts`: {}. Expected range: 1..=100",
                self.max_attempts
            );
        }
        if self.retry_base_delay_secs > self.retry_max_delay_secs {
            bail!(
                "Invalid config value for `retry_base_delay_secs`: {}. Expected <= retry_max_delay_secs ({})",
                self.retry_base_delay_secs,
                self.retry_max_delay_secs
            );
        }
        if self.queue_capacity == 0 {
            bail!("Invalid config value for `queue_capacity`: 0. Expected >= 1");
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        validate_url("api_base_url", &self.api_base_url)?;
        validate_url("delivery_base_url", &self.delivery_base_url)?;

        Ok(())
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            base_url: self.api_base_url.clone(),
            token: self.provider_token.expose().to_string(),
            staging_dir: self.staging_dir.clone(),
            poll_interval: Duration::from_secs(self.operation_poll_interval_secs),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            connect_timeout: self.connect_timeout(),
            read_timeout: self.read_timeout(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            work_dir: self.work_dir.clone(),
            volume_size: self.volume_size,
            buffer_size: self.buffer_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.retry_base_delay_secs),
            Duration::from_secs(self.retry_max_delay_secs),
        )
    }

    pub fn throttle(&self) -> Throttle {
        if self.requests_per_period == 0 {
            return Throttle::disabled();
        }
        let period = Duration::try_from_secs_f64(self.period_secs)
            .unwrap_or(Duration::from_secs_f64(MAX_PERIOD_SECS));
        Throttle::per_period(self.requests_per_period, period)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn validate_timeout_secs(field: &str, value: u64) -> Result<()> {
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    match url::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        _ => bail!("Invalid config value for `{field}`: {value:?}. Expected an http(s) URL"),
    }
}
