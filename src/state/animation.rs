use std::sync::Arc;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};

use super::StateError;
use crate::{
    animation::{AnimationPlayer, PixelSink, SinkError},
    color::Frame,
    connection::LedstripConnection,
    effects::{compute_frames, FrameProvider, ProviderSource},
    models::PlayerOptions,
};

/// Where the frames of an animation are paced
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationMode {
    /// The driver paces frames and asks for more when its buffer runs low
    #[default]
    Buffered,
    /// The portal paces frames and streams them to the driver
    Streamed,
}

/// An effect attached to a ledstrip
#[async_trait]
pub trait Animation: Send {
    fn effect_id(&self) -> &str;

    fn is_playing(&self) -> bool;

    async fn play(&mut self, frequency: u16) -> Result<(), StateError>;

    async fn pause(&mut self) -> Result<(), StateError>;

    /// Stop playing and blank the ledstrip
    async fn dispose(&mut self);
}

/// Animation played by the driver, refilled from `provider`
pub struct BufferedAnimation {
    ledstrip: Arc<LedstripConnection>,
    provider: Arc<dyn FrameProvider>,
    capacity: usize,
    started: bool,
    playing: bool,
}

impl BufferedAnimation {
    pub fn new(
        ledstrip: Arc<LedstripConnection>,
        provider: Arc<dyn FrameProvider>,
        options: &PlayerOptions,
    ) -> Result<Self, StateError> {
        ledstrip.set_frame_buffer_request_handler(provider.clone())?;

        Ok(Self {
            ledstrip,
            provider,
            capacity: options.capacity,
            started: false,
            playing: false,
        })
    }
}

#[async_trait]
impl Animation for BufferedAnimation {
    fn effect_id(&self) -> &str {
        self.provider.effect_id()
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    async fn play(&mut self, frequency: u16) -> Result<(), StateError> {
        // A paused driver-side player resumes with the frames it kept
        let initial_frames = if self.started {
            Vec::new()
        } else {
            compute_frames(&self.provider, self.capacity).await?
        };

        self.ledstrip
            .start_animation(frequency, initial_frames)
            .await?;

        self.started = true;
        self.playing = true;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), StateError> {
        self.ledstrip.pause_animation().await?;
        self.playing = false;
        Ok(())
    }

    async fn dispose(&mut self) {
        self.ledstrip.clear_frame_buffer_request_handler();

        if self.started {
            if let Err(error) = self.ledstrip.stop_animation().await {
                warn!(ledstrip = %self.ledstrip.ledstrip(), error = %error, "failed to stop animation");
            }
        }

        self.started = false;
        self.playing = false;
    }
}

/// Sink pushing frames to a remote ledstrip without acknowledgement
struct StreamSink {
    ledstrip: Arc<LedstripConnection>,
}

impl PixelSink for StreamSink {
    fn render(&mut self, frame: &Frame) -> Result<(), SinkError> {
        Ok(self.ledstrip.send_frame(frame.clone())?)
    }
}

/// Animation paced locally, streaming every frame to the driver
pub struct StreamedAnimation {
    ledstrip: Arc<LedstripConnection>,
    provider: Arc<dyn FrameProvider>,
    capacity: usize,
    player: AnimationPlayer,
}

impl StreamedAnimation {
    /// Must be called from within a tokio runtime.
    pub fn new(
        ledstrip: Arc<LedstripConnection>,
        provider: Arc<dyn FrameProvider>,
        options: &PlayerOptions,
    ) -> Self {
        let player = AnimationPlayer::new(
            ledstrip.ledstrip().to_string(),
            ledstrip.ledstrip().pixel_count(),
            options,
            Arc::new(ProviderSource::new(provider.clone())),
            Box::new(StreamSink {
                ledstrip: ledstrip.clone(),
            }),
        );

        Self {
            ledstrip,
            provider,
            capacity: options.capacity,
            player,
        }
    }
}

#[async_trait]
impl Animation for StreamedAnimation {
    fn effect_id(&self) -> &str {
        self.provider.effect_id()
    }

    fn is_playing(&self) -> bool {
        self.player.is_running()
    }

    async fn play(&mut self, frequency: u16) -> Result<(), StateError> {
        let initial_frames = if self.player.buffered() == 0 {
            compute_frames(&self.provider, self.capacity).await?
        } else {
            Vec::new()
        };

        Ok(self.player.start(frequency, initial_frames)?)
    }

    async fn pause(&mut self) -> Result<(), StateError> {
        self.player.pause().await;
        Ok(())
    }

    async fn dispose(&mut self) {
        self.player.stop().await;
        debug!(ledstrip = %self.ledstrip.ledstrip(), "streamed animation disposed");
    }
}
