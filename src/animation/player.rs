use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self as std_mpsc, RecvTimeoutError},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};

use super::{FrameBuffer, PixelSink};
use crate::{
    color::{Frame, FrameError},
    models::PlayerOptions,
    transmitter::TransmitterError,
};

/// How long stopping waits for the pacing thread before giving up on it
const STOP_TIMEOUT: Duration = Duration::from_millis(500);

pub const MIN_FREQUENCY: u16 = 1;
pub const MAX_FREQUENCY: u16 = 1000;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("animation is already running")]
    AlreadyRunning,
    #[error("invalid frequency: {0} Hz")]
    InvalidFrequency(u16),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to start pacing thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Transmitter(#[from] TransmitterError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("frame computation failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Where a player gets more frames from when its buffer runs low
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn request_frames(&self, count: usize) -> Result<Vec<Frame>, SourceError>;
}

enum LoopSignal {
    Stop,
    Fail,
}

struct Running {
    signals: std_mpsc::Sender<LoopSignal>,
    exited: oneshot::Receiver<()>,
}

type SharedSink = Arc<Mutex<Box<dyn PixelSink>>>;

fn render(sink: &SharedSink, frame: &Frame) -> Result<(), super::SinkError> {
    sink.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .render(frame)
}

/// Plays buffered frames at a fixed frequency on a dedicated thread
///
/// The pacing thread asks the [`FrameSource`] for more frames, through a task on the runtime
/// the player was created on, whenever the buffer drains below its low-water mark.
pub struct AnimationPlayer {
    name: String,
    pixel_count: usize,
    frequency: u16,
    buffer: Arc<FrameBuffer>,
    sink: SharedSink,
    source: Arc<dyn FrameSource>,
    runtime: Handle,
    alive: Arc<AtomicBool>,
    refill_in_flight: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    running: Option<Running>,
}

impl AnimationPlayer {
    /// Create a stopped player
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        pixel_count: usize,
        options: &PlayerOptions,
        source: Arc<dyn FrameSource>,
        sink: Box<dyn PixelSink>,
    ) -> Self {
        Self {
            name: name.into(),
            pixel_count,
            frequency: 0,
            buffer: Arc::new(FrameBuffer::new(options)),
            sink: Arc::new(Mutex::new(sink)),
            source,
            runtime: Handle::current(),
            alive: Arc::new(AtomicBool::new(false)),
            refill_in_flight: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn frequency(&self) -> u16 {
        self.frequency
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Start playing at `frequency` Hz after appending `initial_frames` to the buffer
    ///
    /// Frames retained by a previous [`pause`](Self::pause) play first.
    pub fn start(&mut self, frequency: u16, initial_frames: Vec<Frame>) -> Result<(), PlayerError> {
        if !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&frequency) {
            return Err(PlayerError::InvalidFrequency(frequency));
        }

        if self.is_running() {
            return Err(PlayerError::AlreadyRunning);
        }

        for frame in &initial_frames {
            check_pixel_count(self.pixel_count, frame)?;
        }

        let offered = initial_frames.len();
        let stored = self.buffer.push_many(initial_frames);
        if stored < offered {
            debug!(player = %self.name, offered, stored, "initial frames exceed buffer capacity");
        }

        let (signal_tx, signal_rx) = std_mpsc::channel();
        let (refill_tx, refill_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        self.runtime.spawn(refill_loop(Refill {
            name: self.name.clone(),
            pixel_count: self.pixel_count,
            buffer: self.buffer.clone(),
            source: self.source.clone(),
            in_flight: self.refill_in_flight.clone(),
            generation: self.generation.clone(),
            started_generation: self.generation.load(Ordering::SeqCst),
            requests: refill_rx,
            signals: signal_tx.clone(),
        }));

        let pacing = Pacing {
            name: self.name.clone(),
            interval: Duration::from_secs(1) / frequency as u32,
            pixel_count: self.pixel_count,
            buffer: self.buffer.clone(),
            sink: self.sink.clone(),
            alive: self.alive.clone(),
            refill_in_flight: self.refill_in_flight.clone(),
            refills: refill_tx,
            signals: signal_rx,
            exited: Some(exited_tx),
        };

        self.alive.store(true, Ordering::SeqCst);
        if let Err(error) = std::thread::Builder::new()
            .name(format!("pacing-{}", self.name))
            .spawn(move || pacing.run())
        {
            self.alive.store(false, Ordering::SeqCst);
            return Err(error.into());
        }

        info!(player = %self.name, frequency, buffered = self.buffer.len(), "animation started");

        self.frequency = frequency;
        self.running = Some(Running {
            signals: signal_tx,
            exited: exited_rx,
        });

        Ok(())
    }

    async fn halt(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.signals.send(LoopSignal::Stop);

            if tokio::time::timeout(STOP_TIMEOUT, running.exited)
                .await
                .is_err()
            {
                warn!(player = %self.name, "pacing thread did not stop in time");
            }
        }
    }

    /// Stop the pacing loop, keeping the buffered frames for the next start
    pub async fn pause(&mut self) {
        self.halt().await;
        debug!(player = %self.name, buffered = self.buffer.len(), "animation paused");
    }

    /// Stop the pacing loop, blank the output and drop the buffered frames
    pub async fn stop(&mut self) {
        self.halt().await;

        // Refills still in flight must not land in the next run
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.buffer.clear();

        if let Err(error) = render(&self.sink, &Frame::black(self.pixel_count)) {
            warn!(player = %self.name, error = %error, "failed to blank output");
        }

        debug!(player = %self.name, "animation stopped");
    }
}

impl Drop for AnimationPlayer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.signals.send(LoopSignal::Stop);
        }
    }
}

fn check_pixel_count(pixel_count: usize, frame: &Frame) -> Result<(), FrameError> {
    if frame.pixel_count() != pixel_count {
        return Err(FrameError::PixelCount {
            expected: pixel_count,
            actual: frame.pixel_count(),
        });
    }

    Ok(())
}

struct Pacing {
    name: String,
    interval: Duration,
    pixel_count: usize,
    buffer: Arc<FrameBuffer>,
    sink: SharedSink,
    alive: Arc<AtomicBool>,
    refill_in_flight: Arc<AtomicBool>,
    refills: mpsc::UnboundedSender<usize>,
    signals: std_mpsc::Receiver<LoopSignal>,
    exited: Option<oneshot::Sender<()>>,
}

impl Pacing {
    fn run(self) {
        let mut next_tick = Instant::now();

        loop {
            let frame = match self.buffer.pop() {
                Some(frame) => frame,
                None => {
                    warn!(player = %self.name, "frame buffer underrun");
                    self.blank();
                    break;
                }
            };

            if let Err(error) = render(&self.sink, &frame) {
                error!(player = %self.name, error = %error, "failed to render frame");
                break;
            }

            if let Some(count) = self.buffer.refill_count() {
                if !self.refill_in_flight.swap(true, Ordering::SeqCst) {
                    trace!(player = %self.name, count, "requesting frames");

                    if self.refills.send(count).is_err() {
                        self.refill_in_flight.store(false, Ordering::SeqCst);
                    }
                }
            }

            next_tick += self.interval;
            let now = Instant::now();
            if now > next_tick + self.interval {
                // Too far behind to catch up, skip the missed ticks
                trace!(player = %self.name, late = ?(now - next_tick), "pacing loop is late");
                next_tick = now;
            }

            match self
                .signals
                .recv_timeout(next_tick.saturating_duration_since(now))
            {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(LoopSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(LoopSignal::Fail) => {
                    self.blank();
                    break;
                }
            }
        }
    }

    fn blank(&self) {
        if let Err(error) = render(&self.sink, &Frame::black(self.pixel_count)) {
            warn!(player = %self.name, error = %error, "failed to blank output");
        }
    }
}

impl Drop for Pacing {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);

        if let Some(exited) = self.exited.take() {
            let _ = exited.send(());
        }
    }
}

struct Refill {
    name: String,
    pixel_count: usize,
    buffer: Arc<FrameBuffer>,
    source: Arc<dyn FrameSource>,
    in_flight: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    started_generation: u64,
    requests: mpsc::UnboundedReceiver<usize>,
    signals: std_mpsc::Sender<LoopSignal>,
}

async fn refill_loop(mut refill: Refill) {
    while let Some(count) = refill.requests.recv().await {
        let result = refill
            .source
            .request_frames(count)
            .await
            .and_then(|frames| {
                for frame in &frames {
                    check_pixel_count(refill.pixel_count, frame)?;
                }

                Ok(frames)
            });

        match result {
            Ok(frames) => {
                if refill.generation.load(Ordering::SeqCst) == refill.started_generation {
                    let received = frames.len();
                    let stored = refill.buffer.push_many(frames);
                    debug!(player = %refill.name, requested = count, received, stored, "buffer refilled");
                }

                refill.in_flight.store(false, Ordering::SeqCst);
            }
            Err(error) => {
                error!(player = %refill.name, error = %error, "failed to refill frame buffer");
                refill.in_flight.store(false, Ordering::SeqCst);
                let _ = refill.signals.send(LoopSignal::Fail);
                break;
            }
        }
    }
}
