use std::fmt::Write;

use bytes::BufMut;
use derive_more::{Deref, DerefMut, From};
use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, FromRepr};
use thiserror::Error;

/// Color of a single pixel
///
/// Channels the ledstrip spectrum cannot represent are ignored when the pixel is serialized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    #[serde(default)]
    pub white: u8,
    #[serde(default)]
    pub warm_white: u8,
}

impl PixelColor {
    pub const BLACK: Self = Self::rgb(0, 0, 0);

    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self::rgbww(red, green, blue, 0, 0)
    }

    pub const fn rgbw(red: u8, green: u8, blue: u8, white: u8) -> Self {
        Self::rgbww(red, green, blue, white, 0)
    }

    pub const fn rgbww(red: u8, green: u8, blue: u8, white: u8, warm_white: u8) -> Self {
        Self {
            red,
            green,
            blue,
            white,
            warm_white,
        }
    }

    fn channels(&self) -> [u8; 5] {
        [
            self.red,
            self.green,
            self.blue,
            self.white,
            self.warm_white,
        ]
    }

    /// Zero the channels `spectrum` does not carry
    pub fn restrict(self, spectrum: ColorSpectrum) -> Self {
        let mut channels = self.channels();
        for channel in channels.iter_mut().skip(spectrum.channel_count()) {
            *channel = 0;
        }

        Self::from(channels)
    }
}

impl From<[u8; 5]> for PixelColor {
    fn from(c: [u8; 5]) -> Self {
        Self::rgbww(c[0], c[1], c[2], c[3], c[4])
    }
}

impl From<palette::Srgb<u8>> for PixelColor {
    fn from(color: palette::Srgb<u8>) -> Self {
        Self::rgb(color.red, color.green, color.blue)
    }
}

/// Channel layout of a ledstrip, the discriminant is the channel count
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpectrum {
    Rgb = 3,
    Rgbw = 4,
    Rgbww = 5,
}

impl ColorSpectrum {
    pub fn channel_count(self) -> usize {
        self as usize
    }

    pub fn frame_len(self, pixel_count: usize) -> usize {
        pixel_count * self.channel_count()
    }
}

/// One complete set of pixel colors for a ledstrip
#[derive(Debug, Default, Clone, PartialEq, Eq, Deref, DerefMut, From)]
pub struct Frame(Vec<PixelColor>);

impl Frame {
    pub fn solid(pixel_count: usize, color: PixelColor) -> Self {
        Self(vec![color; pixel_count])
    }

    pub fn black(pixel_count: usize) -> Self {
        Self::solid(pixel_count, PixelColor::BLACK)
    }

    pub fn pixel_count(&self) -> usize {
        self.0.len()
    }

    pub fn is_black(&self) -> bool {
        self.0.iter().all(|px| *px == PixelColor::BLACK)
    }

    pub fn into_inner(self) -> Vec<PixelColor> {
        self.0
    }

    /// Render the frame as a truecolor ANSI string
    pub fn to_ansi_truecolor(&self, buf: &mut String) {
        for px in self.0.iter() {
            let _ = write!(
                buf,
                "\x1B[38;2;{red};{green};{blue}m█",
                red = px.red,
                green = px.green,
                blue = px.blue
            );
        }

        buf.push_str("\x1B[0m");
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{len} bytes of pixel data do not divide into {channels} channels")]
    Misaligned { len: usize, channels: usize },
    #[error("unknown channel count: {0}")]
    UnknownSpectrum(u8),
    #[error("frame has {actual} pixels, ledstrip has {expected}")]
    PixelCount { expected: usize, actual: usize },
}

/// Write the raw pixel bytes of `frame`, channels in R, G, B, W, WW order
pub fn serialize_frame(frame: &Frame, spectrum: ColorSpectrum, dst: &mut impl BufMut) {
    let channel_count = spectrum.channel_count();

    for px in frame.iter() {
        dst.put_slice(&px.channels()[..channel_count]);
    }
}

/// Parse raw pixel bytes laid out according to `spectrum`
pub fn deserialize_frame(src: &[u8], spectrum: ColorSpectrum) -> Result<Frame, FrameError> {
    let channel_count = spectrum.channel_count();

    if src.len() % channel_count != 0 {
        return Err(FrameError::Misaligned {
            len: src.len(),
            channels: channel_count,
        });
    }

    Ok(src
        .chunks_exact(channel_count)
        .map(|chunk| {
            let mut channels = [0u8; 5];
            channels[..channel_count].copy_from_slice(chunk);
            PixelColor::from(channels)
        })
        .collect::<Vec<_>>()
        .into())
}
