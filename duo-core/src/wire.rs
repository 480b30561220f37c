//! Short-range framing: 6-byte packed header + payload.
//!
//! Layout (little-endian, byte-identical on both paired devices):
//! `type (1) | identifier (2) | payload length (1) | checksum (2) | payload`.

use crate::integrity;

pub const HEADER_LEN: usize = 6;

/// Hardware frame ceiling of the short-range link.
pub const MAX_FRAME_LEN: usize = 250;

/// Same bound as a chat message; header + payload stays under [`MAX_FRAME_LEN`].
pub const MAX_PAYLOAD_LEN: usize = crate::message::MAX_MESSAGE_LEN;

const _: () = assert!(HEADER_LEN + MAX_PAYLOAD_LEN <= MAX_FRAME_LEN);

/// Frame type tags. Spread-out constants so line noise is unlikely to look like a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Message = 0x15,
    Ack = 0x84,
    Ping = 0xB1,
}

impl TryFrom<u8> for PacketType {
    type Error = FrameDecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x15 => Ok(PacketType::Message),
            0x84 => Ok(PacketType::Ack),
            0xB1 => Ok(PacketType::Ping),
            other => Err(FrameDecodeError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub identifier: u16,
    pub payload_len: u8,
    pub checksum: u16,
}

impl PacketHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let id = self.identifier.to_le_bytes();
        let crc = self.checksum.to_le_bytes();
        [
            self.packet_type as u8,
            id[0],
            id[1],
            self.payload_len,
            crc[0],
            crc[1],
        ]
    }

    /// Parse the header at the front of `bytes`; does not look at the payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameDecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameDecodeError::TooShort(bytes.len()));
        }
        Ok(Self {
            packet_type: PacketType::try_from(bytes[0])?,
            identifier: u16::from_le_bytes([bytes[1], bytes[2]]),
            payload_len: bytes[3],
            checksum: u16::from_le_bytes([bytes[4], bytes[5]]),
        })
    }
}

/// Build a message frame: header with checksum over `payload`, then the payload.
pub fn encode_frame(identifier: u16, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let header = PacketHeader {
        packet_type: PacketType::Message,
        identifier,
        payload_len: payload.len() as u8,
        checksum: integrity::checksum(payload),
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Header-only frame for acks and pings: zero-length payload, zero checksum.
pub fn encode_control(packet_type: PacketType, identifier: u16) -> [u8; HEADER_LEN] {
    PacketHeader {
        packet_type,
        identifier,
        payload_len: 0,
        checksum: 0,
    }
    .to_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload of {0} bytes exceeds {MAX_PAYLOAD_LEN}")]
    TooLarge(usize),
}

/// Decode a whole received frame. Message frames must carry exactly the declared
/// payload length and a matching checksum; acks and pings only need a valid header.
pub fn decode_frame(bytes: &[u8]) -> Result<(PacketHeader, &[u8]), FrameDecodeError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLong(bytes.len()));
    }
    let header = PacketHeader::from_bytes(bytes)?;
    if header.packet_type != PacketType::Message {
        return Ok((header, &[]));
    }
    let declared = HEADER_LEN + header.payload_len as usize;
    if bytes.len() != declared {
        return Err(FrameDecodeError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    let payload = &bytes[HEADER_LEN..];
    let calculated = integrity::checksum(payload);
    if calculated != header.checksum {
        return Err(FrameDecodeError::ChecksumMismatch {
            packet: header.checksum,
            calculated,
        });
    }
    Ok((header, payload))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame of {0} bytes is smaller than a header")]
    TooShort(usize),
    #[error("frame of {0} bytes exceeds the link maximum")]
    TooLong(usize),
    #[error("unknown packet type 0x{0:02X}")]
    UnknownType(u8),
    #[error("declared length {declared} but received {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch: packet {packet:#06X}, calculated {calculated:#06X}")]
    ChecksumMismatch { packet: u16, calculated: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_packed_little_endian() {
        let header = PacketHeader {
            packet_type: PacketType::Message,
            identifier: 0x1234,
            payload_len: 5,
            checksum: 0xABCD,
        };
        assert_eq!(header.to_bytes(), [0x15, 0x34, 0x12, 5, 0xCD, 0xAB]);
        assert_eq!(PacketHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn message_frame_decodes_with_checksum() {
        let frame = encode_frame(4242, b"hi there").unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 8);
        let (header, payload) = decode_frame(&frame).unwrap();
        assert_eq!(header.packet_type, PacketType::Message);
        assert_eq!(header.identifier, 4242);
        assert_eq!(header.checksum, integrity::checksum(b"hi there"));
        assert_eq!(payload, b"hi there");
    }

    #[test]
    fn max_payload_fits_frame() {
        let payload = vec![b'a'; MAX_PAYLOAD_LEN];
        let frame = encode_frame(1, &payload).unwrap();
        assert!(frame.len() <= MAX_FRAME_LEN);
        assert_eq!(
            encode_frame(1, &vec![b'a'; MAX_PAYLOAD_LEN + 1]),
            Err(FrameEncodeError::TooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn corrupted_payload_rejected() {
        let mut frame = encode_frame(7, b"payload").unwrap();
        frame[HEADER_LEN] ^= 0x01;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn truncated_frame_rejected() {
        let frame = encode_frame(7, b"payload").unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::LengthMismatch { .. })
        ));
        assert_eq!(
            decode_frame(&frame[..3]),
            Err(FrameDecodeError::TooShort(3))
        );
    }

    #[test]
    fn unknown_type_rejected() {
        let mut frame = encode_control(PacketType::Ping, 0);
        frame[0] = 0x42;
        assert_eq!(
            decode_frame(&frame),
            Err(FrameDecodeError::UnknownType(0x42))
        );
    }

    #[test]
    fn control_frames_have_no_payload() {
        let ack = encode_control(PacketType::Ack, 99);
        let (header, payload) = decode_frame(&ack).unwrap();
        assert_eq!(header.packet_type, PacketType::Ack);
        assert_eq!(header.identifier, 99);
        assert_eq!(header.payload_len, 0);
        assert!(payload.is_empty());
    }
}
