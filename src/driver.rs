//! Driver service
//!
//! The driver listens for a single portal session at a time and maps each configured bus to a
//! [`LedstripDisplay`]. Animations play locally and pull more frames from the portal when their
//! buffer runs low. The last configuration a portal applied is persisted with its concurrency
//! token, so a reconnecting portal only uploads its wiring when it changed.

use std::{
    collections::{BTreeMap, BTreeSet},
    convert::TryFrom,
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{
    animation::{FrameSource, PlayerError, SinkError, SinkFactory, SourceError},
    api::{
        message::{
            AnimationBufferReply, AnimationBufferRequest, ClearLedstripRequest, ConnectReply,
            ConnectRequest, DisplayFrameRequest, GetStatusReply, GetStatusRequest,
            PauseAnimationRequest, SetConfigurationReply, SetConfigurationRequest,
            StartAnimationRequest, StopAnimationRequest, StreamFrame, SuccessReply,
        },
        Message,
    },
    color::{ColorSpectrum, Frame, FrameError},
    connection::{Connection, ConnectionRegistry},
    models::{ConcurrencyToken, DisplayStatus, DriverConfig, LedstripId, PortMapping},
    transmitter::{HandlerError, Handlers, Transmitter, TransmitterError},
};

mod ledstrip;
pub use ledstrip::*;

mod store;
pub use store::*;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no ledstrip is configured on bus {0}")]
    UnknownIndex(u8),
    #[error("bus {bus} expects {expected} frames, got {actual}")]
    SpectrumMismatch {
        bus: u8,
        expected: ColorSpectrum,
        actual: ColorSpectrum,
    },
    #[error("no animation on bus {0}")]
    NoAnimation(u8),
    #[error("bus {0} is playing an animation")]
    Busy(u8),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Player(#[from] PlayerError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Session with the connected portal
pub struct PortalSession {
    peer: SocketAddr,
    transmitter: Transmitter,
}

#[async_trait]
impl Connection for PortalSession {
    type Key = SocketAddr;

    fn key(&self) -> SocketAddr {
        self.peer
    }

    async fn dispose(&self) {
        self.transmitter.close();
    }
}

/// Frames requested from the portal for the ledstrip on `bus`
struct UpstreamFrames {
    bus: u8,
    sessions: Arc<ConnectionRegistry<PortalSession>>,
}

#[async_trait]
impl FrameSource for UpstreamFrames {
    async fn request_frames(&self, count: usize) -> Result<Vec<Frame>, SourceError> {
        let session = self
            .sessions
            .keys()
            .first()
            .and_then(|peer| self.sessions.get(peer))
            .ok_or(TransmitterError::ConnectionLost)?;

        let reply: AnimationBufferReply = session
            .transmitter
            .call(&AnimationBufferRequest {
                index: self.bus,
                count: u32::try_from(count).unwrap_or(u32::MAX),
            })
            .await?;

        Ok(reply.frames.frames)
    }
}

struct Inner {
    config: DriverConfig,
    sinks: Arc<dyn SinkFactory>,
    store: StateStore,
    applied: Mutex<Option<DriverState>>,
    displays: tokio::sync::Mutex<BTreeMap<u8, LedstripDisplay>>,
    sessions: Arc<ConnectionRegistry<PortalSession>>,
}

/// Register `f` for `Req` requests, handing it the driver state
fn route<Req, Rep, F, Fut>(handlers: Handlers, inner: &Arc<Inner>, f: F) -> Handlers
where
    Req: Message + Send + 'static,
    Rep: Message + Send + 'static,
    F: Fn(Arc<Inner>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Rep, HandlerError>> + Send + 'static,
{
    let inner = inner.clone();
    handlers.on(move |request: Req| f(inner.clone(), request))
}

impl Inner {
    fn handlers(self: &Arc<Self>) -> Handlers {
        let handlers = Handlers::new();
        let handlers = route(handlers, self, |inner, request: ConnectRequest| async move {
            inner.connect(request)
        });
        let handlers = route(handlers, self, |inner, request: SetConfigurationRequest| async move {
            inner.set_configuration(request).await
        });
        let handlers = route(handlers, self, |inner, _: GetStatusRequest| async move {
            Ok::<_, HandlerError>(GetStatusReply {
                statuses: inner.statuses().await,
            })
        });
        let handlers = route(handlers, self, |inner, request: StartAnimationRequest| async move {
            let mut displays = inner.displays.lock().await;
            display(&mut displays, request.index)?.start_animation(
                request.frequency,
                request.frames.spectrum,
                request.frames.frames,
            )?;
            Ok::<_, HandlerError>(SuccessReply)
        });
        let handlers = route(handlers, self, |inner, request: PauseAnimationRequest| async move {
            let mut displays = inner.displays.lock().await;
            display(&mut displays, request.index)?
                .pause_animation()
                .await?;
            Ok::<_, HandlerError>(SuccessReply)
        });
        let handlers = route(handlers, self, |inner, request: StopAnimationRequest| async move {
            let mut displays = inner.displays.lock().await;
            display(&mut displays, request.index)?
                .stop_animation()
                .await?;
            Ok::<_, HandlerError>(SuccessReply)
        });
        let handlers = route(handlers, self, |inner, request: DisplayFrameRequest| async move {
            let mut displays = inner.displays.lock().await;
            display(&mut displays, request.index)?
                .display_frame(request.frame.spectrum, request.frame.frame)
                .await?;
            Ok::<_, HandlerError>(SuccessReply)
        });
        let handlers = route(handlers, self, |inner, request: StreamFrame| async move {
            let mut displays = inner.displays.lock().await;
            display(&mut displays, request.index)?
                .stream_frame(request.frame.spectrum, request.frame.frame)?;
            Ok::<_, HandlerError>(SuccessReply)
        });

        route(handlers, self, |inner, request: ClearLedstripRequest| async move {
            let mut displays = inner.displays.lock().await;
            display(&mut displays, request.index)?.clear().await?;
            Ok::<_, HandlerError>(SuccessReply)
        })
    }

    fn applied_token(&self) -> Option<ConcurrencyToken> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|state| state.token.clone())
    }

    fn connect(&self, request: ConnectRequest) -> Result<ConnectReply, HandlerError> {
        let applied = self.applied_token();
        let is_configuration_valid = applied.as_ref() == Some(&request.token);

        debug!(
            token = %request.token,
            applied = ?applied.as_ref().map(ConcurrencyToken::as_str),
            is_configuration_valid,
            "portal handshake"
        );

        Ok(ConnectReply {
            is_configuration_valid,
        })
    }

    /// Reasons why `ports` cannot be applied on this host
    fn validate(&self, ports: &[PortMapping]) -> Vec<String> {
        let mut errors = Vec::new();
        let mut buses = BTreeSet::new();
        let mut ledstrips = BTreeSet::new();

        for port in ports {
            if !self.config.buses.contains(&port.bus) {
                errors.push(format!("bus {} is not available on this driver", port.bus));
            }

            if !buses.insert(port.bus) {
                errors.push(format!("bus {} is configured twice", port.bus));
            }

            if !ledstrips.insert(port.ledstrip.id) {
                errors.push(format!("ledstrip {} is configured twice", port.ledstrip.id));
            }

            if port.ledstrip.pixel_count == 0 {
                errors.push(format!("ledstrip {} has no pixels", port.ledstrip.id));
            }
        }

        errors
    }

    /// Open the displays for `ports`, or explain why they cannot be
    fn open_displays(
        &self,
        ports: &[PortMapping],
    ) -> Result<BTreeMap<u8, LedstripDisplay>, Vec<String>> {
        let mut errors = self.validate(ports);
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut displays = BTreeMap::new();
        for port in ports {
            match self.sinks.open(port.bus, &port.ledstrip) {
                Ok(sink) => {
                    let source = Arc::new(UpstreamFrames {
                        bus: port.bus,
                        sessions: self.sessions.clone(),
                    });

                    displays.insert(
                        port.bus,
                        LedstripDisplay::new(
                            port.bus,
                            port.ledstrip.clone(),
                            sink,
                            &self.config.player,
                            source,
                        ),
                    );
                }
                Err(error) => errors.push(format!("bus {}: {}", port.bus, error)),
            }
        }

        if errors.is_empty() {
            Ok(displays)
        } else {
            Err(errors)
        }
    }

    async fn install(&self, displays: BTreeMap<u8, LedstripDisplay>, state: DriverState) {
        let mut current = self.displays.lock().await;
        for display in current.values_mut() {
            display.shutdown().await;
        }

        *current = displays;
        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    #[instrument(skip(self, request), fields(token = %request.token))]
    async fn set_configuration(
        &self,
        request: SetConfigurationRequest,
    ) -> Result<SetConfigurationReply, HandlerError> {
        let displays = match self.open_displays(&request.ports) {
            Ok(displays) => displays,
            Err(errors) => {
                warn!(errors = ?errors, "rejected configuration");
                return Ok(SetConfigurationReply { errors });
            }
        };

        let state = DriverState::new(request.token, request.ports);
        self.store.save(&state).await?;

        info!(ports = state.ports.len(), "applied configuration");
        self.install(displays, state).await;

        Ok(SetConfigurationReply { errors: Vec::new() })
    }

    async fn statuses(&self) -> Vec<(LedstripId, DisplayStatus)> {
        self.displays
            .lock()
            .await
            .values()
            .map(|display| (display.ledstrip().id, display.status()))
            .collect()
    }

    /// Animations cannot refill without a portal
    async fn end_animations(&self) {
        for display in self.displays.lock().await.values_mut() {
            if matches!(
                display.status(),
                DisplayStatus::PlayingAnimation | DisplayStatus::PausedAnimation
            ) {
                if let Err(error) = display.stop_animation().await {
                    let bus = display.bus();
                    warn!(bus = bus, error = %error, "failed to stop animation");
                }
            }
        }
    }

    fn accept(self: &Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        if !self.sessions.is_empty() {
            warn!(peer = %peer, "refusing connection, a portal is already connected");
            return;
        }

        if let Err(error) = socket.set_nodelay(true) {
            debug!(peer = %peer, error = %error, "failed to set TCP_NODELAY");
        }

        let transmitter = Transmitter::spawn(
            socket,
            peer.to_string(),
            &self.config.transmitter,
            self.handlers(),
        );

        let session = Arc::new(PortalSession {
            peer,
            transmitter: transmitter.clone(),
        });

        if let Err(error) = self.sessions.track(session) {
            warn!(peer = %peer, error = %error, "refusing connection");
            transmitter.close();
            return;
        }

        info!(peer = %peer, "portal connected");

        let inner = self.clone();
        tokio::spawn(async move {
            transmitter.closed().await;
            inner.sessions.untrack_and_dispose(&peer).await;
            inner.end_animations().await;
            info!(peer = %peer, "portal disconnected");
        });
    }
}

fn display(
    displays: &mut BTreeMap<u8, LedstripDisplay>,
    index: u8,
) -> Result<&mut LedstripDisplay, DriverError> {
    displays
        .get_mut(&index)
        .ok_or(DriverError::UnknownIndex(index))
}

/// Driver end of the portal/driver protocol
pub struct Driver {
    inner: Arc<Inner>,
}

impl Driver {
    /// Create the driver, restoring the configuration a portal applied last
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(config: DriverConfig, sinks: Arc<dyn SinkFactory>) -> Result<Self, DriverError> {
        let store = StateStore::new(config.state_path());
        let stored = store.load().await?;

        let inner = Arc::new(Inner {
            config,
            sinks,
            store,
            applied: Mutex::new(None),
            displays: tokio::sync::Mutex::new(BTreeMap::new()),
            sessions: Arc::new(ConnectionRegistry::single()),
        });

        if let Some(state) = stored {
            match inner.open_displays(&state.ports) {
                Ok(displays) => {
                    info!(token = %state.token, applied_at = %state.applied_at, "restored configuration");
                    inner.install(displays, state).await;
                }
                Err(errors) => {
                    warn!(path = %inner.store.path().display(), errors = ?errors, "ignoring stored configuration");
                }
            }
        }

        Ok(Self { inner })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Token of the configuration currently applied
    pub fn applied_token(&self) -> Option<ConcurrencyToken> {
        self.inner.applied_token()
    }

    pub fn is_portal_connected(&self) -> bool {
        !self.inner.sessions.is_empty()
    }

    pub async fn statuses(&self) -> Vec<(LedstripId, DisplayStatus)> {
        self.inner.statuses().await
    }

    /// Close the current portal session, if any
    pub async fn disconnect_portal(&self) {
        self.inner.sessions.dispose_all().await;
    }

    pub async fn bind(&self) -> Result<TcpListener, DriverError> {
        let listener = TcpListener::bind(self.inner.config.bind).await?;
        info!(address = %listener.local_addr()?, "driver listening");
        Ok(listener)
    }

    /// Serve portals on `listener` until `cancel` fires, one at a time
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let (socket, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(error = %error, "accept error");
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };

            self.inner.accept(socket, peer);
        }

        self.inner.sessions.dispose_all().await;
        for display in self.inner.displays.lock().await.values_mut() {
            display.shutdown().await;
        }

        info!("driver stopped");
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DriverError> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await;
        Ok(())
    }
}
