use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::{Connection, LedstripConnection};
use crate::{
    api::message::{
        AnimationBufferReply, AnimationBufferRequest, ConnectReply, ConnectRequest, FrameBatch,
        GetStatusReply, GetStatusRequest, SetConfigurationReply, SetConfigurationRequest,
    },
    color::{ColorSpectrum, FrameError},
    effects::{compute_frames, FrameProvider},
    models::{Device, DeviceId, DisplayStatus, LedstripId, PortalConfig, TransmitterOptions},
    transmitter::{HandlerError, Handlers, Transmitter, TransmitterError},
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("connection cancelled")]
    Cancelled,
    #[error("configuration rejected: {}", .0.join("; "))]
    InvalidConfiguration(Vec<String>),
    #[error("ledstrip connection was disposed")]
    Disposed,
    #[error("no frame provider for ledstrip {0}")]
    NoFrameProvider(u8),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transmitter(#[from] TransmitterError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub transmitter: TransmitterOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            transmitter: TransmitterOptions::default(),
        }
    }
}

impl From<&PortalConfig> for ConnectionOptions {
    fn from(config: &PortalConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            transmitter: config.transmitter.clone(),
        }
    }
}

struct Provider {
    spectrum: ColorSpectrum,
    provider: Arc<dyn FrameProvider>,
}

/// State shared by a device connection and its ledstrip connections
pub(super) struct Link {
    transmitter: Mutex<Option<Transmitter>>,
    spectrums: HashMap<u8, ColorSpectrum>,
    providers: RwLock<HashMap<u8, Provider>>,
}

impl Link {
    fn slot(&self) -> MutexGuard<'_, Option<Transmitter>> {
        self.transmitter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn transmitter(&self) -> Result<Transmitter, ConnectionError> {
        match &*self.slot() {
            Some(transmitter) if !transmitter.is_closed() => Ok(transmitter.clone()),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    pub(super) fn set_provider(&self, index: u8, provider: Arc<dyn FrameProvider>) {
        let spectrum = self
            .spectrums
            .get(&index)
            .copied()
            .unwrap_or(ColorSpectrum::Rgb);

        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, Provider { spectrum, provider });
    }

    pub(super) fn clear_provider(&self, index: u8) {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index);
    }

    async fn provide_frames(
        &self,
        request: AnimationBufferRequest,
    ) -> Result<AnimationBufferReply, HandlerError> {
        let (spectrum, provider) = {
            let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
            let entry = providers
                .get(&request.index)
                .ok_or(ConnectionError::NoFrameProvider(request.index))?;
            (entry.spectrum, entry.provider.clone())
        };

        let frames = compute_frames(&provider, request.count as usize).await?;
        trace!(index = request.index, count = frames.len(), "serving frame buffer request");

        Ok(AnimationBufferReply {
            frames: FrameBatch::new(spectrum, frames),
        })
    }
}

/// Portal end of the connection to one device
pub struct DeviceConnection {
    device: Device,
    options: ConnectionOptions,
    link: Arc<Link>,
    ledstrips: BTreeMap<LedstripId, Arc<LedstripConnection>>,
}

impl DeviceConnection {
    pub fn new(device: Device, options: ConnectionOptions) -> Self {
        let link = Arc::new(Link {
            transmitter: Mutex::new(None),
            spectrums: device
                .wired_ports()
                .map(|(bus, ledstrip)| (bus, ledstrip.spectrum()))
                .collect(),
            providers: RwLock::new(HashMap::new()),
        });

        let ledstrips = device
            .wired_ports()
            .map(|(bus, ledstrip)| {
                (
                    ledstrip.id,
                    Arc::new(LedstripConnection::new(
                        device.id,
                        bus,
                        ledstrip.clone(),
                        link.clone(),
                    )),
                )
            })
            .collect();

        Self {
            device,
            options,
            link,
            ledstrips,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_connected(&self) -> bool {
        self.link.transmitter().is_ok()
    }

    fn handlers(&self) -> Handlers {
        let link = self.link.clone();

        Handlers::new().on(move |request: AnimationBufferRequest| {
            let link = link.clone();
            async move { link.provide_frames(request).await }
        })
    }

    /// Open the session and perform the handshake
    ///
    /// Returns whether the driver's applied configuration matches this device's wiring.
    #[instrument(skip(self, cancel), fields(device = %self.device.id, endpoint = %self.device.endpoint))]
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<bool, ConnectionError> {
        if self.is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }

        let endpoint = self.device.endpoint.clone();
        let stream = tokio::select! {
            result = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(&endpoint)) => {
                result
                    .map_err(|_| ConnectionError::ConnectTimeout(endpoint.clone()))?
                    .map_err(|source| ConnectionError::Connect { endpoint: endpoint.clone(), source })?
            }
            _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
        };

        if let Err(error) = stream.set_nodelay(true) {
            debug!(error = %error, "failed to set TCP_NODELAY");
        }

        let transmitter = Transmitter::spawn(
            stream,
            endpoint,
            &self.options.transmitter,
            self.handlers(),
        );

        let request = ConnectRequest {
            token: self.device.token().clone(),
        };

        let reply = tokio::select! {
            reply = transmitter.call::<_, ConnectReply>(&request) => reply,
            _ = cancel.cancelled() => {
                transmitter.close();
                return Err(ConnectionError::Cancelled);
            }
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(error) => {
                transmitter.close();
                return Err(error.into());
            }
        };

        {
            let mut slot = self.link.slot();
            if matches!(&*slot, Some(current) if !current.is_closed()) {
                transmitter.close();
                return Err(ConnectionError::AlreadyConnected);
            }

            *slot = Some(transmitter);
        }

        info!(
            configuration_valid = reply.is_configuration_valid,
            "connected to device"
        );

        Ok(reply.is_configuration_valid)
    }

    /// Send the wiring of every port to the driver
    #[instrument(skip(self), fields(device = %self.device.id))]
    pub async fn upload_configuration(&self) -> Result<(), ConnectionError> {
        let request = SetConfigurationRequest {
            token: self.device.token().clone(),
            ports: self.device.port_mappings(),
        };

        let reply: SetConfigurationReply = self.link.transmitter()?.call(&request).await?;

        if !reply.errors.is_empty() {
            return Err(ConnectionError::InvalidConfiguration(reply.errors));
        }

        info!(token = %request.token, ports = request.ports.len(), "configuration applied");
        Ok(())
    }

    pub async fn request_status(&self) -> Result<HashMap<LedstripId, DisplayStatus>, ConnectionError> {
        let reply: GetStatusReply = self.link.transmitter()?.call(&GetStatusRequest).await?;
        Ok(reply.statuses.into_iter().collect())
    }

    pub fn ledstrips(&self) -> impl Iterator<Item = &Arc<LedstripConnection>> {
        self.ledstrips.values()
    }

    pub fn ledstrip(&self, id: &LedstripId) -> Option<&Arc<LedstripConnection>> {
        self.ledstrips.get(id)
    }

    /// Resolves once the session with the device is over
    pub async fn closed(&self) {
        let transmitter = self.link.slot().clone();

        if let Some(transmitter) = transmitter {
            transmitter.closed().await;
        }
    }

    /// Close the session and every ledstrip connection
    pub async fn dispose(&self) {
        for ledstrip in self.ledstrips.values() {
            ledstrip.dispose();
        }

        let transmitter = self.link.slot().take();
        if let Some(transmitter) = transmitter {
            transmitter.close();
            info!(device = %self.device.id, "disconnected from device");
        }
    }
}

#[async_trait]
impl Connection for DeviceConnection {
    type Key = DeviceId;

    fn key(&self) -> DeviceId {
        self.device.id
    }

    async fn dispose(&self) {
        DeviceConnection::dispose(self).await
    }
}
