use std::collections::BTreeMap;

use derive_more::From;
use parse_display::Display;
use serde_derive::{Deserialize, Serialize};
use strum_macros::{FromRepr, IntoStaticStr};
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use crate::color::{ColorSpectrum, Frame, FrameError};

mod config;
pub use config::*;

/// Maximum length in bytes of a concurrency token
pub const MAX_TOKEN_LEN: usize = 64;

/// Namespace for wiring-derived concurrency tokens
const TOKEN_NAMESPACE: Uuid = Uuid::from_u128(0x6c65_6468_7562_4a8e_9f3c_2b7d_10e4_aa51);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("concurrency token is {0} bytes long, at most {MAX_TOKEN_LEN} are allowed")]
    TokenTooLong(usize),
    #[error("ledstrip {ledstrip} is already wired to bus {bus}")]
    DuplicateLedstrip { ledstrip: LedstripId, bus: u8 },
    #[error("bus {0} is declared twice")]
    DuplicateBus(u8),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Serialize, Deserialize)]
#[display("{0}")]
#[serde(transparent)]
pub struct DeviceId(pub Uuid);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Serialize, Deserialize)]
#[display("{0}")]
#[serde(transparent)]
pub struct LedstripId(pub Uuid);

impl LedstripId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

/// Opaque value identifying one revision of a device's wiring
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display("{0}")]
#[serde(try_from = "String", into = "String")]
pub struct ConcurrencyToken(String);

impl ConcurrencyToken {
    pub fn new(token: impl Into<String>) -> Result<Self, ModelError> {
        let token = token.into();

        if token.len() > MAX_TOKEN_LEN {
            return Err(ModelError::TokenTooLong(token.len()));
        }

        Ok(Self(token))
    }

    /// Derive a token from the wired ports. Identical wiring always yields the same token, so a
    /// restarted portal does not needlessly invalidate the driver's configuration.
    pub fn from_wiring<'l>(ports: impl IntoIterator<Item = (u8, &'l Ledstrip)>) -> Self {
        let mut canonical = String::new();
        for (bus, ledstrip) in ports {
            canonical.push_str(&format!(
                "{}:{}:{}:{};",
                bus, ledstrip.id, ledstrip.pixel_count, ledstrip.chip_type as u8
            ));
        }

        Self(
            Uuid::new_v5(&TOKEN_NAMESPACE, canonical.as_bytes())
                .simple()
                .to_string(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::convert::TryFrom<String> for ConcurrencyToken {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConcurrencyToken> for String {
    fn from(token: ConcurrencyToken) -> Self {
        token.0
    }
}

/// LED controller chip, determines the channel layout of frames
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, Serialize, Deserialize,
)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
#[display(style = "lowercase")]
pub enum ChipType {
    Ws2812b = 0,
    Ws2815 = 1,
    Sk6812Rgbw = 2,
    Ws2805 = 3,
}

impl ChipType {
    pub fn spectrum(self) -> ColorSpectrum {
        match self {
            ChipType::Ws2812b | ChipType::Ws2815 => ColorSpectrum::Rgb,
            ChipType::Sk6812Rgbw => ColorSpectrum::Rgbw,
            ChipType::Ws2805 => ColorSpectrum::Rgbww,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Ledstrip {
    pub id: LedstripId,
    #[validate(range(min = 1))]
    pub pixel_count: u16,
    pub chip_type: ChipType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Ledstrip {
    pub fn spectrum(&self) -> ColorSpectrum {
        self.chip_type.spectrum()
    }

    pub fn pixel_count(&self) -> usize {
        self.pixel_count as usize
    }

    pub fn check_frame(&self, frame: &Frame) -> Result<(), FrameError> {
        if frame.pixel_count() != self.pixel_count() {
            return Err(FrameError::PixelCount {
                expected: self.pixel_count(),
                actual: frame.pixel_count(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Display for Ledstrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "`{}` ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// One bus-to-ledstrip assignment, as exchanged with and persisted by drivers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub bus: u8,
    pub ledstrip: Ledstrip,
}

/// A driver host and its wiring
#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub endpoint: String,
    ports: BTreeMap<u8, Option<Ledstrip>>,
    token: ConcurrencyToken,
}

impl Device {
    pub fn new(id: DeviceId, endpoint: impl Into<String>) -> Self {
        let mut this = Self {
            id,
            endpoint: endpoint.into(),
            ports: Default::default(),
            token: ConcurrencyToken(String::new()),
        };

        this.regenerate_token();
        this
    }

    fn regenerate_token(&mut self) {
        self.token = ConcurrencyToken::from_wiring(self.wired_ports());
    }

    /// Declare a bus without anything attached to it
    pub fn add_port(&mut self, bus: u8) {
        self.ports.entry(bus).or_insert(None);
    }

    /// Wire `ledstrip` to `bus`, returning the ledstrip previously wired there
    pub fn attach_ledstrip(
        &mut self,
        bus: u8,
        ledstrip: Ledstrip,
    ) -> Result<Option<Ledstrip>, ModelError> {
        if let Some((other_bus, _)) = self
            .wired_ports()
            .find(|(other_bus, other)| *other_bus != bus && other.id == ledstrip.id)
        {
            return Err(ModelError::DuplicateLedstrip {
                ledstrip: ledstrip.id,
                bus: other_bus,
            });
        }

        let previous = self.ports.insert(bus, Some(ledstrip)).flatten();
        self.regenerate_token();
        Ok(previous)
    }

    pub fn detach_ledstrip(&mut self, bus: u8) -> Option<Ledstrip> {
        let previous = self.ports.get_mut(&bus).and_then(Option::take);

        if previous.is_some() {
            self.regenerate_token();
        }

        previous
    }

    pub fn ports(&self) -> impl Iterator<Item = (u8, Option<&Ledstrip>)> {
        self.ports.iter().map(|(bus, ls)| (*bus, ls.as_ref()))
    }

    pub fn wired_ports(&self) -> impl Iterator<Item = (u8, &Ledstrip)> {
        self.ports
            .iter()
            .filter_map(|(bus, ls)| ls.as_ref().map(|ls| (*bus, ls)))
    }

    pub fn port_mappings(&self) -> Vec<PortMapping> {
        self.wired_ports()
            .map(|(bus, ledstrip)| PortMapping {
                bus,
                ledstrip: ledstrip.clone(),
            })
            .collect()
    }

    pub fn token(&self) -> &ConcurrencyToken {
        &self.token
    }
}

/// What a ledstrip is currently showing
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum DisplayStatus {
    Idle = 0,
    DisplayingColor = 1,
    PlayingAnimation = 2,
    PausedAnimation = 3,
}
