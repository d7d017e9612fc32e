use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::{Packet, PacketError};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Length-prefixed packet codec
pub struct PacketCodec {
    /// Length prefix framing
    inner: LengthDelimitedCodec,
}

impl PacketCodec {
    /// Create a new PacketCodec rejecting packets longer than `max_frame_length`
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src) {
            Ok(inner_result) => Ok(match inner_result {
                Some(data) => Some(Packet::decode(data.freeze())?),
                None => None,
            }),
            Err(error) => Err(error.into()),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(self.inner.encode(item.to_bytes(), dst)?)
    }
}
