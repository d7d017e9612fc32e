//! Portal service
//!
//! Connects the configured devices, makes sure each driver runs the wiring the portal knows
//! about, and owns one [`LedstripDisplayState`] per connected ledstrip.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    color::PixelColor,
    connection::{
        ConnectionError, ConnectionOptions, ConnectionRegistry, DeviceConnection, RegistryError,
    },
    effects::{EffectError, EffectProvider},
    models::{
        Device, DeviceId, DisplayStatus, LedstripId, ModelError, PlayerOptions, PortalConfig,
        Scene,
    },
    state::{AnimationMode, LedstripDisplayState, StateError},
};

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("ledstrip {0} is not connected")]
    UnknownLedstrip(LedstripId),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Effect(#[from] EffectError),
}

type SharedState = Arc<tokio::sync::Mutex<LedstripDisplayState>>;

struct DeviceEntry {
    device: Device,
    scenes: BTreeMap<u8, Scene>,
}

/// Coordinator of every configured device
pub struct PortalService {
    options: ConnectionOptions,
    player: PlayerOptions,
    reconnect_delay: Duration,
    devices: BTreeMap<DeviceId, DeviceEntry>,
    registry: Arc<ConnectionRegistry<DeviceConnection>>,
    states: Mutex<HashMap<LedstripId, SharedState>>,
}

impl PortalService {
    pub fn new(
        config: &PortalConfig,
        registry: Arc<ConnectionRegistry<DeviceConnection>>,
    ) -> Result<Self, PortalError> {
        let mut devices = BTreeMap::new();

        for device_config in &config.devices {
            let device = device_config.to_device()?;
            let scenes = device_config
                .ports
                .iter()
                .filter_map(|port| port.scene.clone().map(|scene| (port.bus, scene)))
                .collect();

            devices.insert(device.id, DeviceEntry { device, scenes });
        }

        Ok(Self {
            options: ConnectionOptions::from(config),
            player: config.player,
            reconnect_delay: config.reconnect_delay(),
            devices,
            registry,
            states: Mutex::new(HashMap::new()),
        })
    }

    fn states(&self) -> MutexGuard<'_, HashMap<LedstripId, SharedState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device_ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.keys().copied()
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.registry.is_connected(id)
    }

    /// Connect to the device `id`, uploading its wiring if the driver runs another one
    ///
    /// Once connected, every port with a configured scene shows it.
    #[instrument(skip(self, cancel))]
    pub async fn connect_device(
        &self,
        id: DeviceId,
        cancel: &CancellationToken,
    ) -> Result<Arc<DeviceConnection>, PortalError> {
        let entry = self.devices.get(&id).ok_or(PortalError::UnknownDevice(id))?;

        if self.registry.is_connected(&id) {
            return Err(RegistryError::Conflict(id.to_string()).into());
        }

        let connection = Arc::new(DeviceConnection::new(
            entry.device.clone(),
            self.options.clone(),
        ));

        let configuration_valid = connection.connect(cancel).await?;
        if !configuration_valid {
            info!("driver configuration is stale, uploading");

            if let Err(error) = connection.upload_configuration().await {
                connection.dispose().await;
                return Err(error.into());
            }
        }

        if let Err(error) = self.registry.track(connection.clone()) {
            connection.dispose().await;
            return Err(error.into());
        }

        {
            let mut states = self.states();
            for ledstrip in connection.ledstrips() {
                states.insert(
                    ledstrip.ledstrip().id,
                    Arc::new(tokio::sync::Mutex::new(LedstripDisplayState::new(
                        ledstrip.clone(),
                        self.player,
                    ))),
                );
            }
        }

        for ledstrip in connection.ledstrips() {
            if let Some(scene) = entry.scenes.get(&ledstrip.index()) {
                if let Err(error) = self.apply_scene(ledstrip.ledstrip().id, scene).await {
                    warn!(ledstrip = %ledstrip.ledstrip(), error = %error, "failed to apply scene");
                }
            }
        }

        Ok(connection)
    }

    /// Release the display states of device `id` and close its connection
    #[instrument(skip(self))]
    pub async fn disconnect_device(&self, id: DeviceId) {
        let entry = match self.devices.get(&id) {
            Some(entry) => entry,
            None => return,
        };

        let states: Vec<_> = {
            let mut states = self.states();
            entry
                .device
                .wired_ports()
                .filter_map(|(_, ledstrip)| states.remove(&ledstrip.id))
                .collect()
        };

        for state in states {
            state.lock().await.dispose().await;
        }

        self.registry.untrack_and_dispose(&id).await;
    }

    fn display_state(&self, ledstrip: LedstripId) -> Result<SharedState, PortalError> {
        self.states()
            .get(&ledstrip)
            .cloned()
            .ok_or(PortalError::UnknownLedstrip(ledstrip))
    }

    pub async fn status(&self, ledstrip: LedstripId) -> Result<DisplayStatus, PortalError> {
        Ok(self.display_state(ledstrip)?.lock().await.status())
    }

    pub async fn set_color(&self, ledstrip: LedstripId, color: PixelColor) -> Result<(), PortalError> {
        let state = self.display_state(ledstrip)?;
        state.lock().await.set_solid_color(color).await?;
        Ok(())
    }

    /// Attach the built-in effect `name` and start playing it
    ///
    /// A playing animation is paused first, so the new effect replaces it.
    pub async fn play_effect(
        &self,
        ledstrip: LedstripId,
        name: &str,
        frequency: u16,
        mode: AnimationMode,
    ) -> Result<(), PortalError> {
        let state = self.display_state(ledstrip)?;
        let mut state = state.lock().await;

        match state.status() {
            DisplayStatus::PlayingAnimation => state.pause().await?,
            DisplayStatus::DisplayingColor => state.stop().await?,
            DisplayStatus::Idle | DisplayStatus::PausedAnimation => {}
        }

        let provider = {
            let connection = self
                .registry
                .keys()
                .into_iter()
                .filter_map(|id| self.registry.get(&id))
                .find_map(|device| device.ledstrip(&ledstrip).cloned())
                .ok_or(PortalError::UnknownLedstrip(ledstrip))?;

            Arc::new(EffectProvider::builtin(name, connection.ledstrip(), frequency)?)
        };

        state.attach_effect(provider, frequency, mode).await?;
        state.start_animation().await?;
        Ok(())
    }

    pub async fn pause(&self, ledstrip: LedstripId) -> Result<(), PortalError> {
        let state = self.display_state(ledstrip)?;
        state.lock().await.pause().await?;
        Ok(())
    }

    pub async fn resume(&self, ledstrip: LedstripId) -> Result<(), PortalError> {
        let state = self.display_state(ledstrip)?;
        state.lock().await.resume().await?;
        Ok(())
    }

    pub async fn stop(&self, ledstrip: LedstripId) -> Result<(), PortalError> {
        let state = self.display_state(ledstrip)?;
        state.lock().await.stop().await?;
        Ok(())
    }

    async fn apply_scene(&self, ledstrip: LedstripId, scene: &Scene) -> Result<(), PortalError> {
        if let Some(color) = scene.color {
            self.set_color(ledstrip, color).await
        } else if let Some(effect) = &scene.effect {
            self.play_effect(ledstrip, effect, scene.frequency, scene.mode)
                .await
        } else {
            Ok(())
        }
    }

    /// Keep device `id` connected until `cancel` fires
    ///
    /// Failed or lost connections are retried after the reconnect delay.
    #[instrument(skip(self, cancel))]
    pub async fn maintain_device(&self, id: DeviceId, cancel: CancellationToken) {
        loop {
            match self.connect_device(id, &cancel).await {
                Ok(connection) => {
                    tokio::select! {
                        _ = connection.closed() => {
                            warn!("lost connection to device");
                            self.disconnect_device(id).await;
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(PortalError::Connection(ConnectionError::Cancelled)) => break,
                Err(error) => {
                    warn!(error = %error, "failed to connect device");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Release every display state and close every connection
    pub async fn shutdown(&self) {
        let states: Vec<_> = self.states().drain().map(|(_, state)| state).collect();

        for state in states {
            state.lock().await.dispose().await;
        }

        self.registry.dispose_all().await;
        info!("portal stopped");
    }
}
