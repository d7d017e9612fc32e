use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    color::{ColorSpectrum, Frame},
    connection::ConnectionError,
    models::Ledstrip,
};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame has {actual} pixels, sink expects {expected}")]
    PixelCount { expected: usize, actual: usize },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("no output for bus {0}")]
    UnknownBus(u8),
}

/// Synchronous pixel output, called from pacing threads
pub trait PixelSink: Send {
    fn render(&mut self, frame: &Frame) -> Result<(), SinkError>;
}

/// Opens the output of a bus for a given ledstrip
pub trait SinkFactory: Send + Sync {
    fn open(&self, bus: u8, ledstrip: &Ledstrip) -> Result<Box<dyn PixelSink>, SinkError>;
}

/// Output of the dummy sink
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DummySinkMode {
    /// One log line per pixel
    Text,
    /// One truecolor log line per frame
    #[default]
    Ansi,
    /// Discard frames
    Null,
}

/// Sink logging frames instead of driving hardware
pub struct DummySink {
    bus: u8,
    pixel_count: usize,
    spectrum: ColorSpectrum,
    mode: DummySinkMode,
    ansi_buf: String,
}

impl DummySink {
    pub fn new(bus: u8, ledstrip: &Ledstrip, mode: DummySinkMode) -> Self {
        Self {
            bus,
            pixel_count: ledstrip.pixel_count(),
            spectrum: ledstrip.spectrum(),
            mode,
            ansi_buf: String::new(),
        }
    }
}

impl PixelSink for DummySink {
    fn render(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if frame.pixel_count() != self.pixel_count {
            return Err(SinkError::PixelCount {
                expected: self.pixel_count,
                actual: frame.pixel_count(),
            });
        }

        match self.mode {
            DummySinkMode::Text => {
                for (i, px) in frame.iter().enumerate() {
                    let px = px.restrict(self.spectrum);
                    trace!(
                        bus = self.bus,
                        led = %format_args!("{:3}", i),
                        red = %format_args!("{:3}", px.red),
                        green = %format_args!("{:3}", px.green),
                        blue = %format_args!("{:3}", px.blue),
                        white = %format_args!("{:3}", px.white),
                        warm_white = %format_args!("{:3}", px.warm_white),
                    );
                }
            }

            DummySinkMode::Ansi => {
                self.ansi_buf.clear();
                frame.to_ansi_truecolor(&mut self.ansi_buf);
                trace!(bus = self.bus, "{}", &self.ansi_buf);
            }

            DummySinkMode::Null => {}
        }

        Ok(())
    }
}

/// Opens a [`DummySink`] on every bus this host exposes
pub struct DummySinkFactory {
    buses: Vec<u8>,
    mode: DummySinkMode,
}

impl DummySinkFactory {
    pub fn new(buses: Vec<u8>, mode: DummySinkMode) -> Self {
        Self { buses, mode }
    }
}

impl SinkFactory for DummySinkFactory {
    fn open(&self, bus: u8, ledstrip: &Ledstrip) -> Result<Box<dyn PixelSink>, SinkError> {
        if !self.buses.contains(&bus) {
            return Err(SinkError::UnknownBus(bus));
        }

        Ok(Box::new(DummySink::new(bus, ledstrip, self.mode)))
    }
}
