//! Frame-generating effects
//!
//! Effects compute one frame at a time. A [`FrameProvider`] wraps an effect so batches of frames
//! can be requested from any thread, which is how animations refill their buffers.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use palette::{FromColor, Hsv, Srgb};
use thiserror::Error;

use crate::{
    animation::{FrameSource, SourceError},
    color::{ColorSpectrum, Frame, PixelColor},
    models::Ledstrip,
};

#[derive(Debug, Error)]
pub enum EffectError {
    #[error("unknown effect: {0}")]
    UnknownEffect(String),
}

/// A source of successive frames for one ledstrip
pub trait Effect: Send {
    fn next_frame(&mut self) -> Frame;
}

/// Computes batches of frames on request
pub trait FrameProvider: Send + Sync {
    /// Name of the effect behind this provider
    fn effect_id(&self) -> &str;

    /// Compute the next `count` frames. May block for a while.
    fn provide_frames(&self, count: usize) -> Vec<Frame>;
}

/// Compute frames on the blocking thread pool
pub async fn compute_frames(
    provider: &Arc<dyn FrameProvider>,
    count: usize,
) -> Result<Vec<Frame>, tokio::task::JoinError> {
    let provider = provider.clone();
    tokio::task::spawn_blocking(move || provider.provide_frames(count)).await
}

/// [`FrameProvider`] running an [`Effect`]
pub struct EffectProvider {
    id: String,
    effect: Mutex<Box<dyn Effect>>,
}

impl EffectProvider {
    pub fn new(id: impl Into<String>, effect: Box<dyn Effect>) -> Self {
        Self {
            id: id.into(),
            effect: Mutex::new(effect),
        }
    }

    /// Instantiate the built-in effect called `name` for `ledstrip`
    pub fn builtin(name: &str, ledstrip: &Ledstrip, frequency: u16) -> Result<Self, EffectError> {
        let pixel_count = ledstrip.pixel_count();
        let effect: Box<dyn Effect> = match name {
            "rainbow" => Box::new(Rainbow::new(pixel_count, frequency)),
            "pulse" => Box::new(Pulse::new(pixel_count, ledstrip.spectrum(), frequency)),
            other => return Err(EffectError::UnknownEffect(other.to_owned())),
        };

        Ok(Self::new(name, effect))
    }
}

impl FrameProvider for EffectProvider {
    fn effect_id(&self) -> &str {
        &self.id
    }

    fn provide_frames(&self, count: usize) -> Vec<Frame> {
        let mut effect = self.effect.lock().unwrap_or_else(PoisonError::into_inner);
        (0..count).map(|_| effect.next_frame()).collect()
    }
}

/// Feeds a player directly from a [`FrameProvider`]
pub struct ProviderSource {
    provider: Arc<dyn FrameProvider>,
}

impl ProviderSource {
    pub fn new(provider: Arc<dyn FrameProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl FrameSource for ProviderSource {
    async fn request_frames(&self, count: usize) -> Result<Vec<Frame>, SourceError> {
        Ok(compute_frames(&self.provider, count).await?)
    }
}

/// Seconds for a full hue cycle
const RAINBOW_PERIOD: f32 = 5.0;

/// Hue gradient along the strip, scrolling over time
pub struct Rainbow {
    pixel_count: usize,
    hue: f32,
    step: f32,
}

impl Rainbow {
    pub fn new(pixel_count: usize, frequency: u16) -> Self {
        Self {
            pixel_count,
            hue: 0.0,
            step: 360.0 / (RAINBOW_PERIOD * frequency.max(1) as f32),
        }
    }
}

impl Effect for Rainbow {
    fn next_frame(&mut self) -> Frame {
        let spread = 360.0 / self.pixel_count.max(1) as f32;

        let frame = (0..self.pixel_count)
            .map(|i| {
                let hsv: Hsv = Hsv::new(self.hue + spread * i as f32, 1.0, 1.0);
                let rgb: Srgb = Srgb::from_color(hsv);
                PixelColor::from(rgb.into_format::<u8>())
            })
            .collect::<Vec<_>>()
            .into();

        self.hue = (self.hue + self.step) % 360.0;
        frame
    }
}

/// Seconds for a full brightness cycle
const PULSE_PERIOD: f32 = 2.0;

/// Whole-strip breathing, on the white channel when the strip has one
pub struct Pulse {
    pixel_count: usize,
    spectrum: ColorSpectrum,
    phase: f32,
    step: f32,
}

impl Pulse {
    pub fn new(pixel_count: usize, spectrum: ColorSpectrum, frequency: u16) -> Self {
        Self {
            pixel_count,
            spectrum,
            phase: 0.0,
            step: std::f32::consts::TAU / (PULSE_PERIOD * frequency.max(1) as f32),
        }
    }
}

impl Effect for Pulse {
    fn next_frame(&mut self) -> Frame {
        let level = ((1.0 - self.phase.cos()) / 2.0 * 255.0).round() as u8;
        self.phase = (self.phase + self.step) % std::f32::consts::TAU;

        let color = match self.spectrum {
            ColorSpectrum::Rgb => PixelColor::rgb(level, level, level),
            ColorSpectrum::Rgbw | ColorSpectrum::Rgbww => PixelColor::rgbw(0, 0, 0, level),
        };

        Frame::solid(self.pixel_count, color)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::models::{ChipType, LedstripId};

    fn ledstrip(chip_type: ChipType) -> Ledstrip {
        Ledstrip {
            id: LedstripId(Uuid::new_v4()),
            pixel_count: 12,
            chip_type,
            name: None,
        }
    }

    #[test]
    fn rainbow_frames() {
        let provider = EffectProvider::builtin("rainbow", &ledstrip(ChipType::Ws2812b), 30).unwrap();
        assert_eq!(provider.effect_id(), "rainbow");

        let frames = provider.provide_frames(3);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|frame| frame.pixel_count() == 12));

        // Pure red at hue 0, and the gradient scrolls between frames
        assert_eq!(frames[0][0], PixelColor::rgb(255, 0, 0));
        assert_ne!(frames[0], frames[1]);
    }

    #[test]
    fn pulse_uses_white_channel() {
        let provider = EffectProvider::builtin("pulse", &ledstrip(ChipType::Sk6812Rgbw), 10).unwrap();

        let frames = provider.provide_frames(11);
        assert!(frames[0].is_black());

        // Half a period in, at full brightness
        let peak = frames[10][0];
        assert_eq!(peak, PixelColor::rgbw(0, 0, 0, 255));
    }

    #[test]
    fn unknown_effect() {
        assert!(matches!(
            EffectProvider::builtin("fireworks", &ledstrip(ChipType::Ws2812b), 30),
            Err(EffectError::UnknownEffect(name)) if name == "fireworks"
        ));
    }

    #[tokio::test]
    async fn provider_source_computes_in_background() {
        let provider: Arc<dyn FrameProvider> =
            Arc::new(EffectProvider::builtin("rainbow", &ledstrip(ChipType::Ws2812b), 30).unwrap());
        let source = ProviderSource::new(provider);

        assert_eq!(source.request_frames(7).await.unwrap().len(), 7);
    }
}
