use core::time::Duration;
use std::fs::{read_to_string, write};

use camino::Utf8Path;
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::{Dialect, UnsupportedDialect};
use crate::record::Timestamp;

pub const CONFIG_FILE: &str = "changestream.toml";

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error(transparent)]
    UnsupportedDialect(#[from] UnsupportedDialect),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ReaderConfig {
    /// Name of the change stream to read
    pub stream_id: String,

    /// `googlesql` or `postgresql`
    #[serde(default = "default_dialect")]
    pub dialect: String,

    /// Reads from the current time when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Timestamp>,

    /// Reads until cancelled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<Timestamp>,

    #[serde(
        rename = "heartbeat_interval_ms",
        with = "serde_duration",
        default = "default_heartbeat_interval"
    )]
    pub heartbeat_interval: Duration,
}

fn default_dialect() -> String {
    Dialect::default().to_string()
}

const fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

impl ReaderConfig {
    #[must_use]
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            dialect: default_dialect(),
            start_timestamp: None,
            end_timestamp: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect.to_string();
        self
    }

    #[must_use]
    pub fn with_start_timestamp(mut self, start_timestamp: Timestamp) -> Self {
        self.start_timestamp = Some(start_timestamp);
        self
    }

    #[must_use]
    pub fn with_end_timestamp(mut self, end_timestamp: Timestamp) -> Self {
        self.end_timestamp = Some(end_timestamp);
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn dialect(&self) -> Result<Dialect, ConfigError> {
        self.dialect.parse().map_err(Into::into)
    }

    /// Configured heartbeat interval, falling back to the default when zero.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        if self.heartbeat_interval.is_zero() {
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            self.heartbeat_interval
        }
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        let config: Self = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse configuration at {path:?}"))?;

        let _dialect = config.dialect()?;

        Ok(config)
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
