use std::{
    collections::BTreeSet,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use super::{Device, DeviceId, Ledstrip, ModelError};
use crate::{
    animation::{BufferOrder, DummySinkMode},
    color::PixelColor,
    state::AnimationMode,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error(transparent)]
    Model(#[from] ModelError),
}

async fn load_toml<T>(path: &Path) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Validate,
{
    let full = tokio::fs::read_to_string(path).await?;
    let config: T = toml::from_str(&full)?;
    config.validate()?;
    Ok(config)
}

/// Settings of the message transmitter shared by both ends of a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct TransmitterOptions {
    #[validate(range(min = 1))]
    pub call_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub keep_alive_interval_ms: u64,
    pub keep_alive_retries: u32,
    #[validate(range(min = 64))]
    pub max_frame_length: usize,
}

impl TransmitterOptions {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}

impl Default for TransmitterOptions {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            keep_alive_interval_ms: 2000,
            keep_alive_retries: 3,
            max_frame_length: 16 * 1024 * 1024,
        }
    }
}

/// Frame buffer settings of animation players
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct PlayerOptions {
    #[validate(range(min = 1, max = 100_000))]
    pub capacity: usize,
    #[validate(range(exclusive_min = 0.0, exclusive_max = 1.0))]
    pub threshold: f64,
    pub order: BufferOrder,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            capacity: 500,
            threshold: 0.8,
            order: BufferOrder::default(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 19500))
}

fn default_buses() -> Vec<u8> {
    vec![0]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub bind: SocketAddr,
    /// Buses physically exposed by this host
    #[validate(length(min = 1))]
    pub buses: Vec<u8>,
    /// Where the last applied configuration is persisted, defaults to the user config directory
    pub state_path: Option<PathBuf>,
    pub sink: DummySinkMode,
    #[validate(nested)]
    pub transmitter: TransmitterOptions,
    #[validate(nested)]
    pub player: PlayerOptions,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            buses: default_buses(),
            state_path: None,
            sink: DummySinkMode::default(),
            transmitter: TransmitterOptions::default(),
            player: PlayerOptions::default(),
        }
    }
}

impl DriverConfig {
    pub async fn load_file(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path).await
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(|| {
            let mut path = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
            path.push("ledhub");
            path.push("driver-state.json");
            path
        })
    }
}

/// What a port shows once its device is connected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Scene {
    #[serde(default)]
    pub color: Option<PixelColor>,
    #[serde(default)]
    pub effect: Option<String>,
    #[serde(default = "default_frequency")]
    #[validate(range(min = 1, max = 1000))]
    pub frequency: u16,
    #[serde(default)]
    pub mode: AnimationMode,
}

fn default_frequency() -> u16 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    pub bus: u8,
    #[serde(default)]
    #[validate(nested)]
    pub ledstrip: Option<Ledstrip>,
    #[serde(default)]
    #[validate(nested)]
    pub scene: Option<Scene>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: Uuid,
    pub endpoint: String,
    #[serde(default)]
    #[validate(nested)]
    pub ports: Vec<PortConfig>,
}

impl DeviceConfig {
    pub fn to_device(&self) -> Result<Device, ModelError> {
        let mut device = Device::new(DeviceId(self.id), self.endpoint.clone());
        let mut seen = BTreeSet::new();

        for port in &self.ports {
            if !seen.insert(port.bus) {
                return Err(ModelError::DuplicateBus(port.bus));
            }

            device.add_port(port.bus);
            if let Some(ledstrip) = &port.ledstrip {
                device.attach_ledstrip(port.bus, ledstrip.clone())?;
            }
        }

        Ok(device)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct PortalConfig {
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub reconnect_delay_ms: u64,
    #[validate(nested)]
    pub transmitter: TransmitterOptions,
    #[validate(nested)]
    pub player: PlayerOptions,
    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            reconnect_delay_ms: 5000,
            transmitter: TransmitterOptions::default(),
            player: PlayerOptions::default(),
            devices: Vec::new(),
        }
    }
}

impl PortalConfig {
    pub async fn load_file(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path).await
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
