use bytes::{BufMut, Bytes, BytesMut};
use strum_macros::{Display, FromRepr, IntoStaticStr};
use thiserror::Error;

/// Packet identifiers, the byte values are part of the wire contract
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum PacketId {
    ConnectRequest = 1,
    ConnectReply = 2,
    SetConfigurationRequest = 10,
    SetConfigurationReply = 11,
    GetStatusRequest = 20,
    GetStatusReply = 21,
    StartAnimationRequest = 100,
    PauseAnimationRequest = 105,
    StopAnimationRequest = 110,
    AnimationBufferRequest = 120,
    AnimationBufferReply = 121,
    DisplayFrameRequest = 130,
    StreamFrame = 140,
    ClearLedstripRequest = 150,
    KeepAliveRequest = 250,
    KeepAliveReply = 251,
    SuccessReply = 254,
    ErrorReply = 255,
}

impl PacketId {
    /// Replies complete the call currently waiting on the receiving side
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            PacketId::ConnectReply
                | PacketId::SetConfigurationReply
                | PacketId::GetStatusReply
                | PacketId::AnimationBufferReply
                | PacketId::KeepAliveReply
                | PacketId::SuccessReply
                | PacketId::ErrorReply
        )
    }

    /// Requests the receiver must answer. Frame streaming is fire-and-forget.
    pub fn expects_reply(self) -> bool {
        !self.is_reply() && self != PacketId::StreamFrame
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed packet: empty buffer")]
    MalformedPacket,
    #[error("unknown packet identifier: {0}")]
    UnknownIdentifier(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: PacketId,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(id: PacketId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    pub fn empty(id: PacketId) -> Self {
        Self::new(id, Bytes::new())
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.id as u8);
        dst.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self, PacketError> {
        if src.is_empty() {
            return Err(PacketError::MalformedPacket);
        }

        let payload = src.split_off(1);
        let id = PacketId::from_repr(src[0]).ok_or(PacketError::UnknownIdentifier(src[0]))?;

        Ok(Self { id, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let packets = [
            Packet::empty(PacketId::GetStatusRequest),
            Packet::new(PacketId::DisplayFrameRequest, vec![3u8, 0, 1, 255, 0, 0]),
            Packet::new(PacketId::ErrorReply, &b"\x00\x03boom"[..]),
        ];

        for packet in packets.iter() {
            let encoded = packet.to_bytes();
            assert_eq!(encoded.len(), packet.encoded_len());
            assert_eq!(encoded[0], packet.id as u8);
            assert_eq!(&Packet::decode(encoded).unwrap(), packet);
        }
    }

    #[test]
    fn decode_empty_buffer() {
        assert_eq!(
            Packet::decode(Bytes::new()),
            Err(PacketError::MalformedPacket)
        );
    }

    #[test]
    fn decode_unknown_identifier() {
        assert_eq!(
            Packet::decode(Bytes::from_static(&[42, 1, 2])),
            Err(PacketError::UnknownIdentifier(42))
        );
    }

    #[test]
    fn reply_classification() {
        assert!(PacketId::ConnectReply.is_reply());
        assert!(PacketId::ErrorReply.is_reply());
        assert!(!PacketId::AnimationBufferRequest.is_reply());
        assert!(PacketId::AnimationBufferRequest.expects_reply());
        assert!(!PacketId::StreamFrame.expects_reply());
        assert!(!PacketId::KeepAliveReply.expects_reply());
    }
}
