use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::{device::Link, ConnectionError};
use crate::{
    api::message::{
        ClearLedstripRequest, DisplayFrameRequest, FrameBatch, FramePayload,
        PauseAnimationRequest, StartAnimationRequest, StopAnimationRequest, StreamFrame,
        SuccessReply,
    },
    color::Frame,
    effects::FrameProvider,
    models::{DeviceId, Ledstrip},
};

/// Channel to one ledstrip of a connected device, addressed by its bus
pub struct LedstripConnection {
    device_id: DeviceId,
    index: u8,
    ledstrip: Ledstrip,
    link: Arc<Link>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for LedstripConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedstripConnection")
            .field("device_id", &self.device_id)
            .field("index", &self.index)
            .field("ledstrip", &self.ledstrip.id)
            .finish()
    }
}

impl LedstripConnection {
    pub(super) fn new(device_id: DeviceId, index: u8, ledstrip: Ledstrip, link: Arc<Link>) -> Self {
        Self {
            device_id,
            index,
            ledstrip,
            link,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn ledstrip(&self) -> &Ledstrip {
        &self.ledstrip
    }

    fn check_open(&self) -> Result<(), ConnectionError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Disposed);
        }

        Ok(())
    }

    fn payload(&self, frame: Frame) -> Result<FramePayload, ConnectionError> {
        self.ledstrip.check_frame(&frame)?;

        Ok(FramePayload {
            spectrum: self.ledstrip.spectrum(),
            frame,
        })
    }

    async fn call_success<M: crate::api::Message>(&self, request: &M) -> Result<(), ConnectionError> {
        self.check_open()?;
        self.link
            .transmitter()?
            .call::<_, SuccessReply>(request)
            .await?;
        Ok(())
    }

    /// Push `frame` without waiting for an acknowledgement
    pub fn send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.check_open()?;

        let frame = self.payload(frame)?;
        self.link.transmitter()?.send(&StreamFrame {
            index: self.index,
            frame,
        })?;

        Ok(())
    }

    /// Show `frame` until told otherwise
    pub async fn set_single_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        let frame = self.payload(frame)?;
        self.call_success(&DisplayFrameRequest {
            index: self.index,
            frame,
        })
        .await
    }

    /// Start the driver-side player, seeded with `initial_frames`
    pub async fn start_animation(
        &self,
        frequency: u16,
        initial_frames: Vec<Frame>,
    ) -> Result<(), ConnectionError> {
        for frame in &initial_frames {
            self.ledstrip.check_frame(frame)?;
        }

        self.call_success(&StartAnimationRequest {
            index: self.index,
            frequency,
            frames: FrameBatch::new(self.ledstrip.spectrum(), initial_frames),
        })
        .await
    }

    pub async fn pause_animation(&self) -> Result<(), ConnectionError> {
        self.call_success(&PauseAnimationRequest { index: self.index })
            .await
    }

    pub async fn stop_animation(&self) -> Result<(), ConnectionError> {
        self.call_success(&StopAnimationRequest { index: self.index })
            .await
    }

    /// Blank the ledstrip
    pub async fn clear(&self) -> Result<(), ConnectionError> {
        self.call_success(&ClearLedstripRequest { index: self.index })
            .await
    }

    /// Serve the driver's buffer refill requests for this ledstrip from `provider`
    pub fn set_frame_buffer_request_handler(
        &self,
        provider: Arc<dyn FrameProvider>,
    ) -> Result<(), ConnectionError> {
        self.check_open()?;
        self.link.set_provider(self.index, provider);
        Ok(())
    }

    pub fn clear_frame_buffer_request_handler(&self) {
        self.link.clear_provider(self.index);
    }

    pub(super) fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.clear_frame_buffer_request_handler();
            debug!(device = %self.device_id, index = self.index, "disposed ledstrip connection");
        }
    }
}
