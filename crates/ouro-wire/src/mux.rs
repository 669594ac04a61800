//! Mux segment codec for node-to-node connections.
//!
//! Every mini-protocol message travels inside a Segment Data Unit (SDU):
//!
//! ```text
//! +----------------+---+-----------------+----------------+
//! | transmission   | M | mini-protocol   | payload length |
//! | time (4 bytes) |bit| id (15 bits)    | (2 bytes)      |
//! +----------------+---+-----------------+----------------+
//! |                     Payload                           |
//! |                 (length bytes)                        |
//! +-------------------------------------------------------+
//! ```
//!
//! All fields are network byte order. The mode bit is 0 for segments sent
//! by the initiator and 1 for the responder; together with the protocol id
//! it forms the demultiplexing key. Payloads are never fragmented, so one
//! segment always carries a whole mini-protocol message.

use crate::{WireError, MAX_PROTOCOL_ID, MAX_SEGMENT_PAYLOAD};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// SDU header size: time (4) + mode/protocol word (2) + length (2) = 8 bytes.
pub const SDU_HEADER_SIZE: usize = 8;

/// Which side of a mini-protocol a segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Client-originated half of the protocol.
    Initiator,
    /// Server-originated half of the protocol.
    Responder,
}

impl Mode {
    fn from_bit(bit: u16) -> Self {
        if bit == 0 {
            Mode::Initiator
        } else {
            Mode::Responder
        }
    }

    fn bit(self) -> u16 {
        match self {
            Mode::Initiator => 0,
            Mode::Responder => 1,
        }
    }
}

/// A single mux segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Lower 32 bits of the sender's monotonic clock. Zero is accepted.
    pub transmission_time: u32,
    /// Sender role for this mini-protocol.
    pub mode: Mode,
    /// Mini-protocol id (0..32767).
    pub protocol_id: u16,
    /// Complete message payload.
    pub payload: Bytes,
}

impl Segment {
    /// Create a segment with an unstamped transmission time.
    pub fn new(protocol_id: u16, mode: Mode, payload: Bytes) -> Self {
        Self {
            transmission_time: 0,
            mode,
            protocol_id,
            payload,
        }
    }
}

/// Codec framing segments over a byte stream.
#[derive(Debug, Default)]
pub struct SduCodec;

impl SduCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Segment> for SduCodec {
    type Error = WireError;

    fn encode(&mut self, item: Segment, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_SEGMENT_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                size: item.payload.len(),
                max: MAX_SEGMENT_PAYLOAD,
            });
        }
        if item.protocol_id > MAX_PROTOCOL_ID {
            return Err(WireError::Framing(format!(
                "Protocol id out of range: {}",
                item.protocol_id
            )));
        }

        dst.reserve(SDU_HEADER_SIZE + item.payload.len());

        dst.put_u32(item.transmission_time);
        dst.put_u16((item.mode.bit() << 15) | item.protocol_id);
        dst.put_u16(item.payload.len() as u16);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Decoder for SduCodec {
    type Item = Segment;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the full header before the length is known
        if src.len() < SDU_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the declared length without consuming
        let length = u16::from_be_bytes([src[6], src[7]]) as usize;

        let total = SDU_HEADER_SIZE + length;
        if src.len() < total {
            // Reserve space for the rest of the segment
            src.reserve(total - src.len());
            return Ok(None);
        }

        let transmission_time = src.get_u32();
        let word = src.get_u16();
        let mode = Mode::from_bit(word >> 15);
        let protocol_id = word & MAX_PROTOCOL_ID;
        let _length = src.get_u16();

        let payload = src.split_to(length).freeze();

        Ok(Some(Segment {
            transmission_time,
            mode,
            protocol_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(segment: Segment) -> Segment {
        let mut codec = SduCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(segment, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_segment_roundtrip() {
        let segment = Segment {
            transmission_time: 123_456,
            mode: Mode::Initiator,
            protocol_id: 2,
            payload: Bytes::from_static(&[0x82, 0x04, 0x80]),
        };

        let decoded = roundtrip(segment.clone());
        assert_eq!(decoded, segment);
    }

    #[test]
    fn test_header_bytes_exact() {
        let segment = Segment {
            transmission_time: 0,
            mode: Mode::Responder,
            protocol_id: 2,
            payload: Bytes::from_static(&[0xAA]),
        };

        let mut codec = SduCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(segment, &mut buf).unwrap();

        assert_eq!(
            &buf[..],
            &[0x00, 0x00, 0x00, 0x00, 0x80, 0x02, 0x00, 0x01, 0xAA]
        );
    }

    #[test]
    fn test_empty_payload() {
        let segment = Segment::new(10, Mode::Initiator, Bytes::new());
        let decoded = roundtrip(segment);
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.protocol_id, 10);
    }

    #[test]
    fn test_max_payload_accepted() {
        let segment = Segment::new(0, Mode::Initiator, vec![0u8; MAX_SEGMENT_PAYLOAD].into());
        let decoded = roundtrip(segment);
        assert_eq!(decoded.payload.len(), MAX_SEGMENT_PAYLOAD);
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let segment = Segment::new(0, Mode::Initiator, vec![0u8; MAX_SEGMENT_PAYLOAD + 1].into());

        let mut codec = SduCodec::new();
        let mut buf = BytesMut::new();
        let result = codec.encode(segment, &mut buf);

        assert!(matches!(
            result,
            Err(WireError::PayloadTooLarge { size: 65_536, .. })
        ));
        // Nothing was written
        assert!(buf.is_empty());
    }

    #[test]
    fn test_protocol_id_out_of_range() {
        let segment = Segment::new(0x8000, Mode::Initiator, Bytes::new());

        let mut codec = SduCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.encode(segment, &mut buf).is_err());
    }

    #[test]
    fn test_partial_input() {
        let segment = Segment::new(0, Mode::Responder, Bytes::from_static(b"hello"));

        let mut codec = SduCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(segment, &mut buf).unwrap();

        // Header only: not enough for the declared payload
        let mut partial = buf.split_to(SDU_HEADER_SIZE + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Remaining bytes complete the segment
        partial.unsplit(buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn test_multiple_segments() {
        let mut codec = SduCodec::new();
        let mut buf = BytesMut::new();

        for id in [0u16, 2, 10] {
            let segment = Segment::new(id, Mode::Responder, Bytes::from(vec![id as u8; 4]));
            codec.encode(segment, &mut buf).unwrap();
        }

        for id in [0u16, 2, 10] {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.protocol_id, id);
            assert_eq!(&decoded.payload[..], &[id as u8; 4]);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_reencode_preserves_header() {
        let mut codec = SduCodec::new();
        let mut original = BytesMut::new();
        codec
            .encode(
                Segment {
                    transmission_time: 0xDEAD_BEEF,
                    mode: Mode::Initiator,
                    protocol_id: 0x7FFF,
                    payload: Bytes::from_static(&[1, 2, 3]),
                },
                &mut original,
            )
            .unwrap();

        let decoded = codec.decode(&mut original.clone()).unwrap().unwrap();
        let mut reencoded = BytesMut::new();
        codec.encode(decoded, &mut reencoded).unwrap();
        assert_eq!(original, reencoded);
    }
}
