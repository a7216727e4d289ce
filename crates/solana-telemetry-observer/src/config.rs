// Numan Thabit 2025
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, DurationMilliSeconds, DurationSeconds};
use solana_telemetry_core::{AccumulatorSettings, EpochCacheSettings, PipelineSettings};
use thiserror::Error;
use tokio::fs;
use tracing::warn;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("epochs.url_template must contain an {{epoch}} placeholder")]
    MissingEpochPlaceholder,
    #[error("prices.assets must list at least one asset")]
    NoPriceAssets,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    #[serde_as(as = "DisplayFromStr")]
    pub http_bind: SocketAddr,
    pub primary: EndpointConfig,
    #[serde(default)]
    pub fallback: Option<EndpointConfig>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub epochs: Option<EpochsConfig>,
    #[serde(default)]
    pub prices: Option<PricesConfig>,
    #[serde(default)]
    pub validators: Option<ValidatorsConfig>,
    #[serde(default)]
    pub stream: StreamConfig,
}

impl ObserverConfig {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {} as TOML", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("polling.fan_out", self.polling.fan_out()),
            ("polling.concurrency", self.polling.concurrency() as u64),
            ("session.snapshot_capacity", self.session.snapshot_capacity() as u64),
            ("session.seen_horizon", self.session.seen_horizon()),
            ("stream.queue_depth", self.stream.queue_depth() as u64),
            ("stream.channel_capacity", self.stream.channel_capacity() as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if let Some(epochs) = &self.epochs {
            if !epochs.url_template.contains("{epoch}") {
                return Err(ConfigError::MissingEpochPlaceholder);
            }
            let limits = [
                ("epochs.capacity", epochs.capacity()),
                ("epochs.concurrency", epochs.concurrency()),
                ("epochs.max_batch", epochs.max_batch()),
            ];
            for (name, value) in limits {
                if value == 0 {
                    return Err(ConfigError::Zero(name));
                }
            }
        }
        if let Some(prices) = &self.prices {
            if prices.assets.is_empty() {
                return Err(ConfigError::NoPriceAssets);
            }
        }
        if let Some(fallback) = &self.fallback {
            if fallback.url == self.primary.url {
                warn!(url = %fallback.url, "fallback endpoint is the same as primary");
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde_as(as = "DisplayFromStr")]
    pub url: Url,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollingConfig {
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub slot_interval_ms: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub block_interval_ms: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub network_interval_secs: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub request_timeout_secs: Option<Duration>,
    #[serde(default)]
    pub fan_out: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl PollingConfig {
    pub fn slot_interval(&self) -> Duration {
        self.slot_interval_ms
            .unwrap_or_else(|| Duration::from_millis(400))
    }

    pub fn block_interval(&self) -> Duration {
        self.block_interval_ms
            .unwrap_or_else(|| Duration::from_secs(2))
    }

    pub fn network_interval(&self) -> Duration {
        self.network_interval_secs
            .unwrap_or_else(|| Duration::from_secs(60))
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_secs
            .unwrap_or(solana_telemetry_core::provider::DEFAULT_TIMEOUT)
    }

    pub fn fan_out(&self) -> u64 {
        self.fan_out.unwrap_or(8)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(4)
    }

    pub fn pipeline(&self) -> PipelineSettings {
        PipelineSettings {
            fan_out: self.fan_out(),
            concurrency: self.concurrency(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub snapshot_capacity: Option<usize>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub snapshot_interval_ms: Option<Duration>,
    #[serde(default)]
    pub top_payers: Option<usize>,
    #[serde(default)]
    pub seen_horizon: Option<u64>,
}

impl SessionConfig {
    pub fn snapshot_capacity(&self) -> usize {
        self.snapshot_capacity.unwrap_or(120)
    }

    pub fn snapshot_interval(&self) -> Duration {
        self.snapshot_interval_ms
            .unwrap_or_else(|| Duration::from_secs(1))
    }

    pub fn top_payers(&self) -> usize {
        self.top_payers.unwrap_or(10)
    }

    /// Slots remembered for duplicate suppression.
    pub fn seen_horizon(&self) -> u64 {
        self.seen_horizon.unwrap_or(10_000)
    }

    pub fn accumulator(&self) -> AccumulatorSettings {
        AccumulatorSettings {
            capacity: self.snapshot_capacity(),
            interval: self.snapshot_interval(),
            top_payers: self.top_payers(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub retention_secs: Option<Duration>,
}

impl HistoryConfig {
    pub fn path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from("data/history.db"))
    }

    pub fn retention(&self) -> Duration {
        self.retention_secs
            .unwrap_or(solana_telemetry_core::history::DEFAULT_RETENTION)
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct EpochsConfig {
    pub url_template: String,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub ttl_secs: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub request_timeout_secs: Option<Duration>,
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub prewarm: Option<u64>,
    #[serde(default)]
    pub max_batch: Option<usize>,
    /// Highest epoch accepted from callers; unset means the current epoch.
    #[serde(default)]
    pub max_epoch: Option<u64>,
}

impl EpochsConfig {
    pub fn ttl(&self) -> Duration {
        self.ttl_secs
            .unwrap_or_else(|| Duration::from_secs(60 * 60))
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_secs
            .unwrap_or_else(|| Duration::from_secs(10))
    }

    pub fn capacity(&self) -> usize {
        self.capacity.unwrap_or(60)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(10)
    }

    pub fn prewarm(&self) -> u64 {
        self.prewarm.unwrap_or(10)
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch.unwrap_or(50)
    }

    pub fn cache(&self) -> EpochCacheSettings {
        EpochCacheSettings {
            ttl: self.ttl(),
            capacity: self.capacity(),
            concurrency: self.concurrency(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct PricesConfig {
    #[serde_as(as = "DisplayFromStr")]
    pub url: Url,
    pub assets: Vec<String>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub ttl_secs: Option<Duration>,
}

impl PricesConfig {
    pub fn ttl(&self) -> Duration {
        self.ttl_secs
            .unwrap_or(solana_telemetry_core::prices::DEFAULT_PRICE_TTL)
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorsConfig {
    #[serde_as(as = "DisplayFromStr")]
    pub url: Url,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub refresh_secs: Option<Duration>,
}

impl ValidatorsConfig {
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_secs
            .unwrap_or_else(|| Duration::from_secs(5 * 60))
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub flush_interval_ms: Option<Duration>,
    #[serde(default)]
    pub queue_depth: Option<usize>,
    #[serde(default)]
    pub channel_capacity: Option<usize>,
}

impl StreamConfig {
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval_ms
            .unwrap_or(solana_telemetry_core::stream::DEFAULT_FLUSH_INTERVAL)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(4096)
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(64)
    }
}
