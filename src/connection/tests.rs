use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::{net::TcpListener, sync::oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::*;
use crate::{
    api::message::{
        AnimationBufferReply, AnimationBufferRequest, ConnectReply, ConnectRequest,
        DisplayFrameRequest, GetStatusReply, GetStatusRequest, SetConfigurationReply,
        SetConfigurationRequest, StreamFrame, SuccessReply,
    },
    color::{ColorSpectrum, Frame, FrameError, PixelColor},
    effects::EffectProvider,
    models::{
        ChipType, ConcurrencyToken, Device, DeviceId, Ledstrip, LedstripId,
        TransmitterOptions,
    },
    transmitter::{HandlerError, Handlers, Transmitter, TransmitterError},
};

#[derive(Debug, Error)]
#[error("bus {0} is overheating")]
struct Overheated(u8);

fn ledstrip(id: u128, pixel_count: u16, chip_type: ChipType) -> Ledstrip {
    Ledstrip {
        id: LedstripId(Uuid::from_u128(id)),
        pixel_count,
        chip_type,
        name: None,
    }
}

fn device(endpoint: &str) -> Device {
    let mut device = Device::new(DeviceId(Uuid::new_v4()), endpoint);
    device.attach_ledstrip(0, ledstrip(1, 4, ChipType::Ws2812b)).unwrap();
    device.attach_ledstrip(1, ledstrip(2, 3, ChipType::Sk6812Rgbw)).unwrap();
    device
}

/// Accepts one connection and serves it with `handlers`
async fn fake_driver(handlers: Handlers) -> (String, oneshot::Receiver<Transmitter>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (socket, peer) = listener.accept().await.unwrap();
        let transmitter = Transmitter::spawn(
            socket,
            peer.to_string(),
            &TransmitterOptions::default(),
            handlers,
        );
        let _ = tx.send(transmitter);
    });

    (endpoint, rx)
}

#[derive(Default)]
struct Recorded {
    displayed: Mutex<Vec<(u8, Frame)>>,
    streamed: Mutex<Vec<(u8, Frame)>>,
}

fn driver_handlers(token: Option<ConcurrencyToken>, recorded: Arc<Recorded>) -> Handlers {
    let streamed = recorded.clone();

    Handlers::new()
        .on(move |request: ConnectRequest| {
            let valid = Some(&request.token) == token.as_ref();
            async move {
                Ok::<_, HandlerError>(ConnectReply {
                    is_configuration_valid: valid,
                })
            }
        })
        .on(|request: SetConfigurationRequest| async move {
            let errors = request
                .ports
                .iter()
                .filter(|port| port.bus > 0 && port.ledstrip.chip_type == ChipType::Sk6812Rgbw)
                .map(|port| format!("bus {} does not support RGBW", port.bus))
                .collect();

            Ok::<_, HandlerError>(SetConfigurationReply { errors })
        })
        .on(|_: GetStatusRequest| async move {
            Ok::<_, HandlerError>(GetStatusReply {
                statuses: Vec::new(),
            })
        })
        .on(move |request: DisplayFrameRequest| {
            let recorded = recorded.clone();
            async move {
                if request.index == 1 {
                    return Err(HandlerError::from(Overheated(request.index)));
                }

                recorded
                    .displayed
                    .lock()
                    .unwrap()
                    .push((request.index, request.frame.frame));
                Ok(SuccessReply)
            }
        })
        .on(move |request: StreamFrame| {
            let recorded = streamed.clone();
            async move {
                recorded
                    .streamed
                    .lock()
                    .unwrap()
                    .push((request.index, request.frame.frame));
                Ok::<_, HandlerError>(SuccessReply)
            }
        })
}

async fn connected(
    token: Option<ConcurrencyToken>,
) -> (DeviceConnection, Transmitter, Arc<Recorded>, bool) {
    let recorded = Arc::new(Recorded::default());
    let (endpoint, driver) = fake_driver(driver_handlers(token, recorded.clone())).await;

    let connection = DeviceConnection::new(device(&endpoint), ConnectionOptions::default());
    let valid = connection
        .connect(&CancellationToken::new())
        .await
        .expect("failed to connect");

    (connection, driver.await.unwrap(), recorded, valid)
}

fn strip(connection: &DeviceConnection, index: u8) -> Arc<LedstripConnection> {
    connection
        .ledstrips()
        .find(|ledstrip| ledstrip.index() == index)
        .cloned()
        .expect("missing ledstrip")
}

#[tokio::test]
async fn handshake_reports_configuration_validity() {
    let (connection, _driver, _, valid) = connected(None).await;
    assert!(!valid);
    assert!(connection.is_connected());

    assert!(matches!(
        connection.connect(&CancellationToken::new()).await,
        Err(ConnectionError::AlreadyConnected)
    ));

    let token = connection.device().token().clone();
    let (_connection, _driver, _, valid) = connected(Some(token)).await;
    assert!(valid);
}

#[tokio::test]
async fn upload_configuration_reports_rejections() {
    let (connection, _driver, _, _) = connected(None).await;

    match connection.upload_configuration().await {
        Err(ConnectionError::InvalidConfiguration(errors)) => {
            assert_eq!(errors, vec!["bus 1 does not support RGBW".to_owned()]);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    assert!(connection.request_status().await.unwrap().is_empty());
}

#[tokio::test]
async fn remote_failure_keeps_connection_usable() {
    let (connection, _driver, recorded, _) = connected(None).await;

    match strip(&connection, 1)
        .set_single_frame(Frame::black(3))
        .await
    {
        Err(ConnectionError::Transmitter(TransmitterError::Remote(reply))) => {
            assert!(reply.type_name.ends_with("Overheated"), "{}", reply.type_name);
            assert_eq!(reply.message, "bus 1 is overheating");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let frame = Frame::solid(4, PixelColor::rgb(10, 20, 30));
    strip(&connection, 0)
        .set_single_frame(frame.clone())
        .await
        .expect("call after a remote failure failed");

    assert_eq!(*recorded.displayed.lock().unwrap(), vec![(0, frame)]);
}

#[tokio::test]
async fn frames_are_checked_locally() {
    let (connection, _driver, _, _) = connected(None).await;
    let strip = strip(&connection, 0);

    assert!(matches!(
        strip.set_single_frame(Frame::black(5)).await,
        Err(ConnectionError::Frame(FrameError::PixelCount {
            expected: 4,
            actual: 5
        }))
    ));
    assert!(matches!(
        strip.send_frame(Frame::black(3)),
        Err(ConnectionError::Frame(_))
    ));
}

#[tokio::test]
async fn streamed_frames_are_unacknowledged() {
    let (connection, _driver, recorded, _) = connected(None).await;
    let strip = strip(&connection, 1);

    let frame = Frame::solid(3, PixelColor::rgbw(0, 0, 0, 9));
    strip.send_frame(frame.clone()).unwrap();

    // Calls are ordered after the frames written before them
    connection.request_status().await.unwrap();
    assert_eq!(*recorded.streamed.lock().unwrap(), vec![(1, frame)]);
}

#[tokio::test]
async fn refill_requests_use_the_registered_provider() {
    let (connection, driver, _, _) = connected(None).await;

    let rgbw = strip(&connection, 1);
    let provider = EffectProvider::builtin("pulse", rgbw.ledstrip(), 30).unwrap();
    rgbw.set_frame_buffer_request_handler(Arc::new(provider))
        .unwrap();

    let reply: AnimationBufferReply = driver
        .call(&AnimationBufferRequest { index: 1, count: 5 })
        .await
        .expect("refill failed");
    assert_eq!(reply.frames.spectrum, ColorSpectrum::Rgbw);
    assert_eq!(reply.frames.frames.len(), 5);
    assert!(reply.frames.frames.iter().all(|f| f.pixel_count() == 3));

    rgbw.clear_frame_buffer_request_handler();
    match driver
        .call::<_, AnimationBufferReply>(&AnimationBufferRequest { index: 1, count: 5 })
        .await
    {
        Err(TransmitterError::Remote(reply)) => {
            assert!(reply.type_name.ends_with("ConnectionError"));
            assert_eq!(reply.message, "no frame provider for ledstrip 1");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn dispose_closes_everything() {
    let (connection, driver, _, _) = connected(None).await;
    let strip = strip(&connection, 0);

    connection.dispose().await;
    connection.dispose().await;

    assert!(!connection.is_connected());
    assert!(matches!(
        strip.clear().await,
        Err(ConnectionError::Disposed)
    ));
    assert!(matches!(
        strip.set_frame_buffer_request_handler(Arc::new(
            EffectProvider::builtin("rainbow", strip.ledstrip(), 30).unwrap()
        )),
        Err(ConnectionError::Disposed)
    ));

    tokio::time::timeout(std::time::Duration::from_secs(1), driver.closed())
        .await
        .expect("driver should observe the disconnection");
}

#[tokio::test]
async fn cancelled_connect_leaves_nothing_behind() {
    // Accepts connections but never answers the handshake
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();

    let connection = DeviceConnection::new(device(&endpoint), ConnectionOptions::default());
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        canceller.cancel();
    });

    assert!(matches!(
        connection.connect(&cancel).await,
        Err(ConnectionError::Cancelled)
    ));
    assert!(!connection.is_connected());
    drop(listener);
}

#[tokio::test]
async fn unreachable_device() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);

    let connection = DeviceConnection::new(device(&endpoint), ConnectionOptions::default());
    assert!(matches!(
        connection.connect(&CancellationToken::new()).await,
        Err(ConnectionError::Connect { .. })
    ));
}

#[tokio::test]
async fn disconnected_operations_fail() {
    let connection = DeviceConnection::new(device("127.0.0.1:1"), ConnectionOptions::default());

    assert!(matches!(
        connection.request_status().await,
        Err(ConnectionError::NotConnected)
    ));
    assert!(matches!(
        strip(&connection, 0).pause_animation().await,
        Err(ConnectionError::NotConnected)
    ));
}
