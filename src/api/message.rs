//! Typed packet payloads

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use super::{Packet, PacketId};
use crate::{
    color::{deserialize_frame, serialize_frame, ColorSpectrum, Frame, FrameError},
    models::{
        ChipType, ConcurrencyToken, DisplayStatus, Ledstrip, LedstripId, ModelError, PortMapping,
    },
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("expected a {expected} packet, got {actual}")]
    UnexpectedPacket {
        expected: PacketId,
        actual: PacketId,
    },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("invalid utf-8 string")]
    InvalidUtf8,
    #[error("unknown chip type: {0}")]
    UnknownChipType(u8),
    #[error("unknown display status: {0}")]
    UnknownStatus(u8),
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// A payload carried by packets of a single identifier
pub trait Message: Sized {
    const ID: PacketId;

    fn encode(&self, dst: &mut BytesMut);

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError>;

    fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        Packet::new(Self::ID, buf.freeze())
    }

    fn from_packet(packet: Packet) -> Result<Self, DecodeError> {
        if packet.id != Self::ID {
            return Err(DecodeError::UnexpectedPacket {
                expected: Self::ID,
                actual: packet.id,
            });
        }

        let mut payload = packet.payload;
        let message = Self::decode(&mut payload)?;

        if payload.has_remaining() {
            return Err(DecodeError::TrailingBytes(payload.remaining()));
        }

        Ok(message)
    }
}

fn ensure(src: &Bytes, len: usize) -> Result<(), DecodeError> {
    if src.remaining() < len {
        Err(DecodeError::NotEnoughData)
    } else {
        Ok(())
    }
}

fn get_u8(src: &mut Bytes) -> Result<u8, DecodeError> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes) -> Result<u16, DecodeError> {
    ensure(src, 2)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut Bytes) -> Result<u32, DecodeError> {
    ensure(src, 4)?;
    Ok(src.get_u32())
}

fn get_bytes(src: &mut Bytes, len: usize) -> Result<Bytes, DecodeError> {
    ensure(src, len)?;
    Ok(src.split_to(len))
}

fn get_uuid(src: &mut Bytes) -> Result<Uuid, DecodeError> {
    ensure(src, 16)?;
    let mut bytes = [0u8; 16];
    src.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

fn put_str(dst: &mut BytesMut, s: &str) {
    // Strings longer than 64k are truncated on a char boundary
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }

    dst.put_u16(end as u16);
    dst.put_slice(&s.as_bytes()[..end]);
}

fn get_str(src: &mut Bytes) -> Result<String, DecodeError> {
    let len = get_u16(src)? as usize;
    let bytes = get_bytes(src, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

fn put_token(dst: &mut BytesMut, token: &ConcurrencyToken) {
    // Tokens are at most MAX_TOKEN_LEN bytes long
    dst.put_u8(token.as_str().len() as u8);
    dst.put_slice(token.as_str().as_bytes());
}

fn get_token(src: &mut Bytes) -> Result<ConcurrencyToken, DecodeError> {
    let len = get_u8(src)? as usize;
    let bytes = get_bytes(src, len)?;
    let token = String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok(ConcurrencyToken::new(token)?)
}

fn put_frame(dst: &mut BytesMut, spectrum: ColorSpectrum, frame: &Frame) {
    dst.put_u16(frame.pixel_count() as u16);
    serialize_frame(frame, spectrum, dst);
}

fn get_frame(src: &mut Bytes, spectrum: ColorSpectrum) -> Result<Frame, DecodeError> {
    let pixel_count = get_u16(src)? as usize;
    let data = get_bytes(src, spectrum.frame_len(pixel_count))?;
    Ok(deserialize_frame(&data, spectrum)?)
}

fn get_spectrum(src: &mut Bytes) -> Result<ColorSpectrum, DecodeError> {
    let channels = get_u8(src)?;
    Ok(ColorSpectrum::from_repr(channels).ok_or(FrameError::UnknownSpectrum(channels))?)
}

/// A single frame along with its channel layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload {
    pub spectrum: ColorSpectrum,
    pub frame: Frame,
}

impl FramePayload {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.spectrum as u8);
        put_frame(dst, self.spectrum, &self.frame);
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let spectrum = get_spectrum(src)?;
        let frame = get_frame(src, spectrum)?;
        Ok(Self { spectrum, frame })
    }
}

/// A run of frames sharing one channel layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    pub spectrum: ColorSpectrum,
    pub frames: Vec<Frame>,
}

impl FrameBatch {
    pub fn new(spectrum: ColorSpectrum, frames: Vec<Frame>) -> Self {
        Self { spectrum, frames }
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.spectrum as u8);
        dst.put_u32(self.frames.len() as u32);

        if let Some(first) = self.frames.first() {
            dst.reserve(self.frames.len() * (2 + self.spectrum.frame_len(first.pixel_count())));
        }

        for frame in &self.frames {
            put_frame(dst, self.spectrum, frame);
        }
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let spectrum = get_spectrum(src)?;
        let count = get_u32(src)? as usize;

        // Every frame takes at least its 2-byte pixel count
        ensure(src, count.saturating_mul(2))?;

        let frames = (0..count)
            .map(|_| get_frame(src, spectrum))
            .collect::<Result<_, _>>()?;

        Ok(Self { spectrum, frames })
    }
}

macro_rules! empty_message {
    ($($name:ident),*) => {
        $(
            #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
            pub struct $name;

            impl Message for $name {
                const ID: PacketId = PacketId::$name;

                fn encode(&self, _dst: &mut BytesMut) {}

                fn decode(_src: &mut Bytes) -> Result<Self, DecodeError> {
                    Ok(Self)
                }
            }
        )*
    };
}

empty_message!(GetStatusRequest, KeepAliveRequest, KeepAliveReply, SuccessReply);

macro_rules! ledstrip_message {
    ($($name:ident),*) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub struct $name {
                pub index: u8,
            }

            impl Message for $name {
                const ID: PacketId = PacketId::$name;

                fn encode(&self, dst: &mut BytesMut) {
                    dst.put_u8(self.index);
                }

                fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
                    Ok(Self { index: get_u8(src)? })
                }
            }
        )*
    };
}

ledstrip_message!(
    PauseAnimationRequest,
    StopAnimationRequest,
    ClearLedstripRequest
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub token: ConcurrencyToken,
}

impl Message for ConnectRequest {
    const ID: PacketId = PacketId::ConnectRequest;

    fn encode(&self, dst: &mut BytesMut) {
        put_token(dst, &self.token);
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            token: get_token(src)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReply {
    pub is_configuration_valid: bool,
}

impl Message for ConnectReply {
    const ID: PacketId = PacketId::ConnectReply;

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.is_configuration_valid as u8);
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            is_configuration_valid: get_u8(src)? != 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetConfigurationRequest {
    pub token: ConcurrencyToken,
    pub ports: Vec<PortMapping>,
}

impl Message for SetConfigurationRequest {
    const ID: PacketId = PacketId::SetConfigurationRequest;

    fn encode(&self, dst: &mut BytesMut) {
        put_token(dst, &self.token);

        // At most one ledstrip per bus, so at most 256 ports
        dst.put_u8(self.ports.len() as u8);
        for port in &self.ports {
            dst.put_u8(port.bus);
            dst.put_slice(port.ledstrip.id.as_bytes());
            dst.put_u16(port.ledstrip.pixel_count);
            dst.put_u8(port.ledstrip.chip_type as u8);
        }
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let token = get_token(src)?;
        let count = get_u8(src)?;

        let ports = (0..count)
            .map(|_| {
                let bus = get_u8(src)?;
                let id = get_uuid(src)?;
                let pixel_count = get_u16(src)?;
                let chip_type = get_u8(src)?;

                Ok(PortMapping {
                    bus,
                    ledstrip: Ledstrip {
                        id: LedstripId(id),
                        pixel_count,
                        chip_type: ChipType::from_repr(chip_type)
                            .ok_or(DecodeError::UnknownChipType(chip_type))?,
                        name: None,
                    },
                })
            })
            .collect::<Result<_, DecodeError>>()?;

        Ok(Self { token, ports })
    }
}

/// Empty `errors` means the configuration was applied
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetConfigurationReply {
    pub errors: Vec<String>,
}

impl Message for SetConfigurationReply {
    const ID: PacketId = PacketId::SetConfigurationReply;

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.errors.len().min(u16::MAX as usize) as u16);
        for error in self.errors.iter().take(u16::MAX as usize) {
            put_str(dst, error);
        }
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let count = get_u16(src)?;
        let errors = (0..count)
            .map(|_| get_str(src))
            .collect::<Result<_, _>>()?;

        Ok(Self { errors })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetStatusReply {
    pub statuses: Vec<(LedstripId, DisplayStatus)>,
}

impl Message for GetStatusReply {
    const ID: PacketId = PacketId::GetStatusReply;

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.statuses.len() as u8);
        for (id, status) in &self.statuses {
            dst.put_slice(id.as_bytes());
            dst.put_u8(*status as u8);
        }
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let count = get_u8(src)?;
        let statuses = (0..count)
            .map(|_| {
                let id = get_uuid(src)?;
                let status = get_u8(src)?;

                Ok((
                    LedstripId(id),
                    DisplayStatus::from_repr(status).ok_or(DecodeError::UnknownStatus(status))?,
                ))
            })
            .collect::<Result<_, DecodeError>>()?;

        Ok(Self { statuses })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAnimationRequest {
    pub index: u8,
    pub frequency: u16,
    pub frames: FrameBatch,
}

impl Message for StartAnimationRequest {
    const ID: PacketId = PacketId::StartAnimationRequest;

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.index);
        dst.put_u16(self.frequency);
        self.frames.encode(dst);
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            index: get_u8(src)?,
            frequency: get_u16(src)?,
            frames: FrameBatch::decode(src)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationBufferRequest {
    pub index: u8,
    pub count: u32,
}

impl Message for AnimationBufferRequest {
    const ID: PacketId = PacketId::AnimationBufferRequest;

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.index);
        dst.put_u32(self.count);
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            index: get_u8(src)?,
            count: get_u32(src)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnimationBufferReply {
    pub frames: FrameBatch,
}

impl Message for AnimationBufferReply {
    const ID: PacketId = PacketId::AnimationBufferReply;

    fn encode(&self, dst: &mut BytesMut) {
        self.frames.encode(dst);
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            frames: FrameBatch::decode(src)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrameRequest {
    pub index: u8,
    pub frame: FramePayload,
}

/// Unacknowledged frame, rendered as soon as it arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub index: u8,
    pub frame: FramePayload,
}

macro_rules! frame_message {
    ($($name:ident),*) => {
        $(
            impl Message for $name {
                const ID: PacketId = PacketId::$name;

                fn encode(&self, dst: &mut BytesMut) {
                    dst.put_u8(self.index);
                    self.frame.encode(dst);
                }

                fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
                    Ok(Self {
                        index: get_u8(src)?,
                        frame: FramePayload::decode(src)?,
                    })
                }
            }
        )*
    };
}

frame_message!(DisplayFrameRequest, StreamFrame);

/// Failure of a request handler on the remote side
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{type_name}: {message}")]
pub struct ErrorReply {
    pub type_name: String,
    pub message: String,
    pub cause: Option<String>,
}

impl Message for ErrorReply {
    const ID: PacketId = PacketId::ErrorReply;

    fn encode(&self, dst: &mut BytesMut) {
        put_str(dst, &self.type_name);
        put_str(dst, &self.message);

        match &self.cause {
            Some(cause) => {
                dst.put_u8(1);
                put_str(dst, cause);
            }
            None => dst.put_u8(0),
        }
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let type_name = get_str(src)?;
        let message = get_str(src)?;
        let cause = if get_u8(src)? != 0 {
            Some(get_str(src)?)
        } else {
            None
        };

        Ok(Self {
            type_name,
            message,
            cause,
        })
    }
}
