use std::time::Duration;

use config::Config;
use serde::Deserialize;
use thiserror::Error;

use crate::data_types::ByteCount;

pub const ENVIRONMENT_PREFIX: &str = "CHANNEL_NET";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load network settings: {msg}")]
    Load { msg: String },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Timeouts and sizes shared by every connection of a multiplexer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub connect_timeout_ms: u64,
    /// Also bounds how long a disconnect request takes to be noticed
    pub receive_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub max_transfer_size: ByteCount,
    pub receive_buffer_size: ByteCount,
    pub accept_poll_interval_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            receive_timeout_ms: 1_000,
            send_timeout_ms: 10_000,
            max_transfer_size: 1024,
            receive_buffer_size: 1024,
            accept_poll_interval_ms: 10,
        }
    }
}

impl NetworkSettings {
    /// Merges the optional `Network` and `Network.<environment>` files with
    /// `CHANNEL_NET_*` environment variables, later sources taking precedence
    pub fn load(environment: &str) -> SettingsResult<Self> {
        let config = Config::builder()
            .add_source(config::File::with_name("Network").required(false))
            .add_source(config::File::with_name(&format!("Network.{environment}")).required(false))
            .add_source(config::Environment::with_prefix(ENVIRONMENT_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| SettingsError::Load { msg: e.to_string() })?;

        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> SettingsResult<Self> {
        let settings = config
            .clone()
            .try_deserialize::<NetworkSettings>()
            .map_err(|e| SettingsError::Load { msg: e.to_string() })?;
        settings.validate()
    }

    fn validate(self: Self) -> SettingsResult<Self> {
        if self.receive_timeout_ms == 0 {
            return Err(SettingsError::Load { msg: String::from("receive_timeout_ms must be greater than zero") });
        }
        if self.max_transfer_size == 0 || self.receive_buffer_size == 0 {
            return Err(SettingsError::Load { msg: String::from("transfer and buffer sizes must be greater than zero") });
        }
        Ok(self)
    }

    pub fn connect_timeout(self: &Self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn receive_timeout(self: &Self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn send_timeout(self: &Self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn accept_poll_interval(self: &Self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }
}
