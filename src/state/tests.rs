use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::*;
use crate::{
    api::message::{
        ClearLedstripRequest, ConnectReply, ConnectRequest, DisplayFrameRequest,
        PauseAnimationRequest, StartAnimationRequest, StopAnimationRequest, StreamFrame,
        SuccessReply,
    },
    connection::{ConnectionOptions, DeviceConnection},
    effects::EffectProvider,
    models::{ChipType, Device, DeviceId, Ledstrip, TransmitterOptions},
    transmitter::{HandlerError, Handlers, Transmitter},
};

#[derive(Debug, Clone, PartialEq)]
enum Request {
    Display(Frame),
    Start { frequency: u16, frames: usize },
    Pause,
    Stop,
    Clear,
}

#[derive(Default)]
struct Driver {
    requests: Mutex<Vec<Request>>,
    streamed: AtomicUsize,
}

impl Driver {
    fn record(&self, request: Request) {
        self.requests.lock().unwrap().push(request);
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

fn handlers(driver: Arc<Driver>) -> Handlers {
    let (display, start, pause, stop, clear, stream) = (
        driver.clone(),
        driver.clone(),
        driver.clone(),
        driver.clone(),
        driver.clone(),
        driver,
    );

    Handlers::new()
        .on(|_: ConnectRequest| async move {
            Ok::<_, HandlerError>(ConnectReply {
                is_configuration_valid: true,
            })
        })
        .on(move |request: DisplayFrameRequest| {
            display.record(Request::Display(request.frame.frame));
            async move { Ok::<_, HandlerError>(SuccessReply) }
        })
        .on(move |request: StartAnimationRequest| {
            start.record(Request::Start {
                frequency: request.frequency,
                frames: request.frames.frames.len(),
            });
            async move { Ok::<_, HandlerError>(SuccessReply) }
        })
        .on(move |_: PauseAnimationRequest| {
            pause.record(Request::Pause);
            async move { Ok::<_, HandlerError>(SuccessReply) }
        })
        .on(move |_: StopAnimationRequest| {
            stop.record(Request::Stop);
            async move { Ok::<_, HandlerError>(SuccessReply) }
        })
        .on(move |_: ClearLedstripRequest| {
            clear.record(Request::Clear);
            async move { Ok::<_, HandlerError>(SuccessReply) }
        })
        .on(move |_: StreamFrame| {
            stream.streamed.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, HandlerError>(SuccessReply) }
        })
}

/// Counts how many batches were computed
struct CountingProvider {
    inner: EffectProvider,
    batches: AtomicUsize,
}

impl CountingProvider {
    fn new(name: &str, ledstrip: &Ledstrip) -> Arc<Self> {
        Arc::new(Self {
            inner: EffectProvider::builtin(name, ledstrip, 30).unwrap(),
            batches: AtomicUsize::new(0),
        })
    }

    fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

impl FrameProvider for CountingProvider {
    fn effect_id(&self) -> &str {
        self.inner.effect_id()
    }

    fn provide_frames(&self, count: usize) -> Vec<Frame> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.inner.provide_frames(count)
    }
}

const OPTIONS: PlayerOptions = PlayerOptions {
    capacity: 20,
    threshold: 0.5,
    order: crate::animation::BufferOrder::Fifo,
};

struct Fixture {
    state: LedstripDisplayState,
    driver: Arc<Driver>,
    _connection: DeviceConnection,
    _remote: Transmitter,
}

impl Fixture {
    async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let driver = Arc::new(Driver::default());

        let remote_handlers = handlers(driver.clone());
        let accept = tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            Transmitter::spawn(
                socket,
                peer.to_string(),
                &TransmitterOptions::default(),
                remote_handlers,
            )
        });

        let mut device = Device::new(DeviceId(Uuid::new_v4()), endpoint);
        device
            .attach_ledstrip(
                0,
                Ledstrip {
                    id: LedstripId(Uuid::from_u128(7)),
                    pixel_count: 6,
                    chip_type: ChipType::Ws2812b,
                    name: Some("shelf".to_owned()),
                },
            )
            .unwrap();

        let connection = DeviceConnection::new(device, ConnectionOptions::default());
        assert!(connection.connect(&CancellationToken::new()).await.unwrap());

        let ledstrip = connection.ledstrips().next().cloned().unwrap();
        Self {
            state: LedstripDisplayState::new(ledstrip, OPTIONS),
            driver,
            _connection: connection,
            _remote: accept.await.unwrap(),
        }
    }

    fn ledstrip(&self) -> Ledstrip {
        self.state.ledstrip.ledstrip().clone()
    }

    fn provider(&self, name: &str) -> Arc<CountingProvider> {
        CountingProvider::new(name, &self.ledstrip())
    }
}

fn rejected(result: Result<(), StateError>, expected: DisplayStatus) {
    match result {
        Err(StateError::InvalidOperation { status, .. }) => assert_eq!(status, expected),
        other => panic!("expected an invalid operation, got {:?}", other),
    }
}

#[tokio::test]
async fn idle_transitions() {
    let mut fixture = Fixture::new().await;
    let state = &mut fixture.state;
    assert_eq!(state.status(), DisplayStatus::Idle);

    rejected(state.start_animation().await, DisplayStatus::Idle);
    rejected(state.resume().await, DisplayStatus::Idle);
    rejected(state.pause().await, DisplayStatus::Idle);
    rejected(state.stop().await, DisplayStatus::Idle);
    assert!(fixture.driver.requests().is_empty());
}

#[tokio::test]
async fn color_transitions() {
    let mut fixture = Fixture::new().await;
    let provider = fixture.provider("rainbow");
    let state = &mut fixture.state;

    let color = PixelColor::rgb(255, 128, 0);
    state.set_solid_color(color).await.unwrap();
    assert_eq!(state.status(), DisplayStatus::DisplayingColor);
    assert_eq!(state.color(), Some(color));

    rejected(state.start_animation().await, DisplayStatus::DisplayingColor);
    rejected(state.pause().await, DisplayStatus::DisplayingColor);
    rejected(
        state
            .attach_effect(provider, 30, AnimationMode::Buffered)
            .await,
        DisplayStatus::DisplayingColor,
    );

    // Recoloring is allowed
    state.set_solid_color(PixelColor::BLACK).await.unwrap();

    state.stop().await.unwrap();
    assert_eq!(state.status(), DisplayStatus::Idle);
    assert_eq!(state.color(), None);

    assert_eq!(
        fixture.driver.requests(),
        vec![
            Request::Display(Frame::solid(6, color)),
            Request::Display(Frame::black(6)),
            Request::Clear,
        ]
    );
}

#[tokio::test]
async fn buffered_animation_transitions() {
    let mut fixture = Fixture::new().await;
    let provider = fixture.provider("rainbow");
    let pulse = fixture.provider("pulse");
    let state = &mut fixture.state;

    state
        .attach_effect(provider.clone(), 25, AnimationMode::Buffered)
        .await
        .unwrap();
    assert_eq!(state.status(), DisplayStatus::PausedAnimation);
    assert_eq!(state.effect_id(), Some("rainbow"));
    assert_eq!(provider.batches(), 0);

    state.start_animation().await.unwrap();
    assert_eq!(state.status(), DisplayStatus::PlayingAnimation);

    rejected(state.start_animation().await, DisplayStatus::PlayingAnimation);
    rejected(
        state.set_solid_color(PixelColor::BLACK).await,
        DisplayStatus::PlayingAnimation,
    );
    rejected(
        state
            .attach_effect(pulse, 25, AnimationMode::Buffered)
            .await,
        DisplayStatus::PlayingAnimation,
    );

    state.pause().await.unwrap();
    assert_eq!(state.status(), DisplayStatus::PausedAnimation);
    rejected(state.pause().await, DisplayStatus::PausedAnimation);

    state.resume().await.unwrap();
    assert_eq!(state.status(), DisplayStatus::PlayingAnimation);

    state.stop().await.unwrap();
    assert_eq!(state.status(), DisplayStatus::Idle);
    assert_eq!(state.effect_id(), None);

    // Resuming reuses the frames the driver kept
    assert_eq!(provider.batches(), 1);
    assert_eq!(
        fixture.driver.requests(),
        vec![
            Request::Start {
                frequency: 25,
                frames: 20
            },
            Request::Pause,
            Request::Start {
                frequency: 25,
                frames: 0
            },
            Request::Stop,
        ]
    );
}

#[tokio::test]
async fn attaching_replaces_paused_effect() {
    let mut fixture = Fixture::new().await;
    let rainbow = fixture.provider("rainbow");
    let state = &mut fixture.state;

    state
        .attach_effect(rainbow.clone(), 30, AnimationMode::Buffered)
        .await
        .unwrap();
    state.start_animation().await.unwrap();
    state.pause().await.unwrap();

    // Same effect: nothing happens
    state
        .attach_effect(rainbow.clone(), 30, AnimationMode::Buffered)
        .await
        .unwrap();
    assert_eq!(fixture.driver.requests().len(), 2);

    let pulse = fixture.provider("pulse");
    let state = &mut fixture.state;
    state
        .attach_effect(pulse, 30, AnimationMode::Buffered)
        .await
        .unwrap();
    assert_eq!(state.status(), DisplayStatus::PausedAnimation);
    assert_eq!(state.effect_id(), Some("pulse"));
    assert_eq!(fixture.driver.requests().last(), Some(&Request::Stop));
}

#[tokio::test]
async fn color_replaces_paused_animation() {
    let mut fixture = Fixture::new().await;
    let provider = fixture.provider("rainbow");
    let state = &mut fixture.state;

    state
        .attach_effect(provider, 30, AnimationMode::Buffered)
        .await
        .unwrap();
    state.start_animation().await.unwrap();
    state.pause().await.unwrap();

    let color = PixelColor::rgb(0, 0, 255);
    state.set_solid_color(color).await.unwrap();
    assert_eq!(state.status(), DisplayStatus::DisplayingColor);

    let requests = fixture.driver.requests();
    assert_eq!(
        &requests[requests.len() - 2..],
        &[Request::Stop, Request::Display(Frame::solid(6, color))]
    );
}

#[tokio::test]
async fn attach_checks_frequency() {
    let mut fixture = Fixture::new().await;
    let provider = fixture.provider("rainbow");

    assert!(matches!(
        fixture
            .state
            .attach_effect(provider, 0, AnimationMode::Streamed)
            .await,
        Err(StateError::Player(PlayerError::InvalidFrequency(0)))
    ));
    assert_eq!(fixture.state.status(), DisplayStatus::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_animation_transitions() {
    let mut fixture = Fixture::new().await;
    let provider = fixture.provider("pulse");
    let state = &mut fixture.state;

    state
        .attach_effect(provider, 100, AnimationMode::Streamed)
        .await
        .unwrap();
    assert_eq!(state.status(), DisplayStatus::PausedAnimation);

    state.start_animation().await.unwrap();
    assert_eq!(state.status(), DisplayStatus::PlayingAnimation);

    tokio::time::sleep(Duration::from_millis(100)).await;
    state.pause().await.unwrap();
    assert_eq!(state.status(), DisplayStatus::PausedAnimation);

    let streamed = fixture.driver.streamed.load(Ordering::SeqCst);
    assert!(streamed > 0, "no frame was streamed");

    let state = &mut fixture.state;
    state.resume().await.unwrap();
    assert_eq!(state.status(), DisplayStatus::PlayingAnimation);

    state.stop().await.unwrap();
    assert_eq!(state.status(), DisplayStatus::Idle);

    // Streamed animations never use the driver-side player
    assert!(fixture
        .driver
        .requests()
        .iter()
        .all(|request| !matches!(request, Request::Start { .. })));
}
