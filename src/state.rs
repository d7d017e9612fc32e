//! What each ledstrip is showing, and the transitions between those states

use std::sync::Arc;

use thiserror::Error;

use crate::{
    animation::{PlayerError, MAX_FREQUENCY, MIN_FREQUENCY},
    color::{Frame, PixelColor},
    connection::{ConnectionError, LedstripConnection},
    effects::FrameProvider,
    models::{DisplayStatus, LedstripId, PlayerOptions},
};

mod animation;
pub use animation::*;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot {operation} while the ledstrip is {status}")]
    InvalidOperation {
        operation: &'static str,
        status: DisplayStatus,
    },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Player(#[from] PlayerError),
    #[error("frame computation failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

enum Display {
    Idle,
    Color(PixelColor),
    Animation {
        animation: Box<dyn Animation>,
        frequency: u16,
    },
}

/// Display state machine of one ledstrip
///
/// The status is derived from what is displayed: an attached animation is playing only while its
/// player runs. Callers serialize access, every operation takes `&mut self`.
pub struct LedstripDisplayState {
    ledstrip: Arc<LedstripConnection>,
    options: PlayerOptions,
    display: Display,
}

impl LedstripDisplayState {
    pub fn new(ledstrip: Arc<LedstripConnection>, options: PlayerOptions) -> Self {
        Self {
            ledstrip,
            options,
            display: Display::Idle,
        }
    }

    pub fn ledstrip_id(&self) -> LedstripId {
        self.ledstrip.ledstrip().id
    }

    pub fn status(&self) -> DisplayStatus {
        match &self.display {
            Display::Idle => DisplayStatus::Idle,
            Display::Color(_) => DisplayStatus::DisplayingColor,
            Display::Animation { animation, .. } => {
                if animation.is_playing() {
                    DisplayStatus::PlayingAnimation
                } else {
                    DisplayStatus::PausedAnimation
                }
            }
        }
    }

    pub fn color(&self) -> Option<PixelColor> {
        match &self.display {
            Display::Color(color) => Some(*color),
            _ => None,
        }
    }

    pub fn effect_id(&self) -> Option<&str> {
        match &self.display {
            Display::Animation { animation, .. } => Some(animation.effect_id()),
            _ => None,
        }
    }

    fn reject(&self, operation: &'static str) -> StateError {
        StateError::InvalidOperation {
            operation,
            status: self.status(),
        }
    }

    /// Dispose the current animation, if any, leaving the state idle
    async fn release(&mut self) {
        if let Display::Animation { mut animation, .. } =
            std::mem::replace(&mut self.display, Display::Idle)
        {
            animation.dispose().await;
        }
    }

    pub async fn set_solid_color(&mut self, color: PixelColor) -> Result<(), StateError> {
        match self.status() {
            DisplayStatus::Idle | DisplayStatus::DisplayingColor => {}
            DisplayStatus::PausedAnimation => self.release().await,
            DisplayStatus::PlayingAnimation => return Err(self.reject("set a solid color")),
        }

        let ledstrip = self.ledstrip.ledstrip();
        let frame = Frame::solid(ledstrip.pixel_count(), color.restrict(ledstrip.spectrum()));

        if let Err(error) = self.ledstrip.set_single_frame(frame).await {
            self.display = Display::Idle;
            return Err(error.into());
        }

        self.display = Display::Color(color);
        Ok(())
    }

    /// Attach an effect, paused, in place of any paused animation
    ///
    /// Attaching the effect that is already attached does nothing.
    pub async fn attach_effect(
        &mut self,
        provider: Arc<dyn FrameProvider>,
        frequency: u16,
        mode: AnimationMode,
    ) -> Result<(), StateError> {
        match self.status() {
            DisplayStatus::Idle => {}
            DisplayStatus::PausedAnimation => {
                if self.effect_id() == Some(provider.effect_id()) {
                    return Ok(());
                }

                self.release().await;
            }
            DisplayStatus::DisplayingColor | DisplayStatus::PlayingAnimation => {
                return Err(self.reject("attach an effect"));
            }
        }

        if !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&frequency) {
            return Err(PlayerError::InvalidFrequency(frequency).into());
        }

        let animation: Box<dyn Animation> = match mode {
            AnimationMode::Buffered => Box::new(BufferedAnimation::new(
                self.ledstrip.clone(),
                provider,
                &self.options,
            )?),
            AnimationMode::Streamed => Box::new(StreamedAnimation::new(
                self.ledstrip.clone(),
                provider,
                &self.options,
            )),
        };

        debug!(ledstrip = %self.ledstrip.ledstrip(), effect = animation.effect_id(), ?mode, "effect attached");
        self.display = Display::Animation {
            animation,
            frequency,
        };

        Ok(())
    }

    async fn play(&mut self, operation: &'static str) -> Result<(), StateError> {
        if self.status() != DisplayStatus::PausedAnimation {
            return Err(self.reject(operation));
        }

        if let Display::Animation {
            animation,
            frequency,
        } = &mut self.display
        {
            animation.play(*frequency).await?;
        }

        Ok(())
    }

    pub async fn start_animation(&mut self) -> Result<(), StateError> {
        self.play("start an animation").await
    }

    pub async fn resume(&mut self) -> Result<(), StateError> {
        self.play("resume an animation").await
    }

    pub async fn pause(&mut self) -> Result<(), StateError> {
        if self.status() != DisplayStatus::PlayingAnimation {
            return Err(self.reject("pause an animation"));
        }

        if let Display::Animation { animation, .. } = &mut self.display {
            animation.pause().await?;
        }

        Ok(())
    }

    /// Blank the ledstrip, disposing any animation
    pub async fn stop(&mut self) -> Result<(), StateError> {
        match self.status() {
            DisplayStatus::Idle => Err(self.reject("stop")),
            DisplayStatus::DisplayingColor => {
                self.display = Display::Idle;
                Ok(self.ledstrip.clear().await?)
            }
            DisplayStatus::PausedAnimation | DisplayStatus::PlayingAnimation => {
                self.release().await;
                Ok(())
            }
        }
    }

    /// Return to idle whatever the current state, logging failures
    pub async fn dispose(&mut self) {
        self.release().await;
        self.display = Display::Idle;
    }
}

#[cfg(test)]
mod tests;
