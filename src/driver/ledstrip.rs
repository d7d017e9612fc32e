use std::sync::{Arc, Mutex, PoisonError};

use super::DriverError;
use crate::{
    animation::{AnimationPlayer, FrameSource, PixelSink, SinkError},
    color::{ColorSpectrum, Frame},
    models::{DisplayStatus, Ledstrip, PlayerOptions},
};

/// Output shared by the animation player and direct frame display
#[derive(Clone)]
struct SharedSink(Arc<Mutex<Box<dyn PixelSink>>>);

impl PixelSink for SharedSink {
    fn render(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .render(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shown {
    Nothing,
    Frame,
    Animation,
}

/// Local output of one configured bus
pub struct LedstripDisplay {
    bus: u8,
    ledstrip: Ledstrip,
    sink: SharedSink,
    player: AnimationPlayer,
    shown: Shown,
}

impl LedstripDisplay {
    /// Must be called from within a tokio runtime.
    pub fn new(
        bus: u8,
        ledstrip: Ledstrip,
        sink: Box<dyn PixelSink>,
        options: &PlayerOptions,
        source: Arc<dyn FrameSource>,
    ) -> Self {
        let sink = SharedSink(Arc::new(Mutex::new(sink)));
        let player = AnimationPlayer::new(
            format!("bus{}", bus),
            ledstrip.pixel_count(),
            options,
            source,
            Box::new(sink.clone()),
        );

        Self {
            bus,
            ledstrip,
            sink,
            player,
            shown: Shown::Nothing,
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn ledstrip(&self) -> &Ledstrip {
        &self.ledstrip
    }

    pub fn status(&self) -> DisplayStatus {
        if self.player.is_running() {
            return DisplayStatus::PlayingAnimation;
        }

        match self.shown {
            Shown::Nothing => DisplayStatus::Idle,
            Shown::Frame => DisplayStatus::DisplayingColor,
            Shown::Animation => DisplayStatus::PausedAnimation,
        }
    }

    fn check_spectrum(&self, spectrum: ColorSpectrum) -> Result<(), DriverError> {
        let expected = self.ledstrip.spectrum();
        if spectrum != expected {
            return Err(DriverError::SpectrumMismatch {
                bus: self.bus,
                expected,
                actual: spectrum,
            });
        }

        Ok(())
    }

    fn check(&self, spectrum: ColorSpectrum, frame: &Frame) -> Result<(), DriverError> {
        self.check_spectrum(spectrum)?;
        Ok(self.ledstrip.check_frame(frame)?)
    }

    async fn end_animation(&mut self) {
        if self.shown == Shown::Animation {
            self.player.stop().await;
        }
    }

    /// Show `frame` until told otherwise, ending any animation
    pub async fn display_frame(
        &mut self,
        spectrum: ColorSpectrum,
        frame: Frame,
    ) -> Result<(), DriverError> {
        self.check(spectrum, &frame)?;
        self.end_animation().await;

        self.sink.render(&frame)?;
        self.shown = Shown::Frame;
        Ok(())
    }

    /// Render a frame paced by the portal
    pub fn stream_frame(&mut self, spectrum: ColorSpectrum, frame: Frame) -> Result<(), DriverError> {
        self.check(spectrum, &frame)?;

        if self.player.is_running() {
            return Err(DriverError::Busy(self.bus));
        }

        self.sink.render(&frame)?;
        if self.shown == Shown::Nothing {
            self.shown = Shown::Frame;
        }

        Ok(())
    }

    pub fn start_animation(
        &mut self,
        frequency: u16,
        spectrum: ColorSpectrum,
        frames: Vec<Frame>,
    ) -> Result<(), DriverError> {
        self.check_spectrum(spectrum)?;

        // A displayed frame does not carry over into the animation
        if self.shown == Shown::Frame {
            self.shown = Shown::Nothing;
        }

        self.player.start(frequency, frames)?;
        self.shown = Shown::Animation;
        Ok(())
    }

    pub async fn pause_animation(&mut self) -> Result<(), DriverError> {
        if self.shown != Shown::Animation {
            return Err(DriverError::NoAnimation(self.bus));
        }

        self.player.pause().await;
        Ok(())
    }

    pub async fn stop_animation(&mut self) -> Result<(), DriverError> {
        if self.shown != Shown::Animation {
            return Err(DriverError::NoAnimation(self.bus));
        }

        self.player.stop().await;
        self.shown = Shown::Nothing;
        Ok(())
    }

    /// Blank the ledstrip, ending any animation
    pub async fn clear(&mut self) -> Result<(), DriverError> {
        if self.shown == Shown::Animation {
            // Stopping renders the black frame
            self.player.stop().await;
        } else {
            self.sink
                .render(&Frame::black(self.ledstrip.pixel_count()))?;
        }

        self.shown = Shown::Nothing;
        Ok(())
    }

    /// Clear the ledstrip, logging failures
    pub async fn shutdown(&mut self) {
        if let Err(error) = self.clear().await {
            warn!(bus = self.bus, error = %error, "failed to clear ledstrip");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::{
        animation::SourceError,
        color::PixelColor,
        models::{ChipType, LedstripId},
    };

    struct Recorder(Arc<Mutex<Vec<Frame>>>);

    impl PixelSink for Recorder {
        fn render(&mut self, frame: &Frame) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    struct Solid;

    #[async_trait]
    impl FrameSource for Solid {
        async fn request_frames(&self, count: usize) -> Result<Vec<Frame>, SourceError> {
            Ok(vec![Frame::solid(2, PixelColor::rgbw(0, 0, 0, 50)); count])
        }
    }

    fn display() -> (LedstripDisplay, Arc<Mutex<Vec<Frame>>>) {
        let rendered = Arc::new(Mutex::new(Vec::new()));
        let ledstrip = Ledstrip {
            id: LedstripId(Uuid::new_v4()),
            pixel_count: 2,
            chip_type: ChipType::Sk6812Rgbw,
            name: None,
        };

        let display = LedstripDisplay::new(
            4,
            ledstrip,
            Box::new(Recorder(rendered.clone())),
            &PlayerOptions::default(),
            Arc::new(Solid),
        );

        (display, rendered)
    }

    #[tokio::test]
    async fn frames_are_checked() {
        let (mut display, rendered) = display();

        assert!(matches!(
            display
                .display_frame(ColorSpectrum::Rgb, Frame::black(2))
                .await,
            Err(DriverError::SpectrumMismatch { bus: 4, .. })
        ));
        assert!(matches!(
            display.stream_frame(ColorSpectrum::Rgbw, Frame::black(3)),
            Err(DriverError::Frame(_))
        ));
        assert!(rendered.lock().unwrap().is_empty());
        assert_eq!(display.status(), DisplayStatus::Idle);
    }

    #[tokio::test]
    async fn displayed_frame_then_clear() {
        let (mut display, rendered) = display();
        let frame = Frame::solid(2, PixelColor::rgbw(1, 2, 3, 4));

        display
            .display_frame(ColorSpectrum::Rgbw, frame.clone())
            .await
            .unwrap();
        assert_eq!(display.status(), DisplayStatus::DisplayingColor);

        display.clear().await.unwrap();
        assert_eq!(display.status(), DisplayStatus::Idle);
        assert_eq!(*rendered.lock().unwrap(), vec![frame, Frame::black(2)]);

        assert!(matches!(
            display.pause_animation().await,
            Err(DriverError::NoAnimation(4))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn animation_lifecycle() {
        let (mut display, rendered) = display();

        let frames = vec![Frame::solid(2, PixelColor::rgbw(9, 9, 9, 9)); 10];
        display
            .start_animation(100, ColorSpectrum::Rgbw, frames)
            .unwrap();
        assert_eq!(display.status(), DisplayStatus::PlayingAnimation);
        assert!(matches!(
            display.stream_frame(ColorSpectrum::Rgbw, Frame::black(2)),
            Err(DriverError::Busy(4))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        display.pause_animation().await.unwrap();
        assert_eq!(display.status(), DisplayStatus::PausedAnimation);

        display.stop_animation().await.unwrap();
        assert_eq!(display.status(), DisplayStatus::Idle);

        let rendered = rendered.lock().unwrap();
        assert!(rendered.len() > 1);
        assert_eq!(rendered.last(), Some(&Frame::black(2)));
    }
}
