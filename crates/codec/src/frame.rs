//! The fixed ATP segment header.
//!
//! ```text
//!  0        1        2        3
//!  +--------+--------+--------+--------+
//!  |        seq_num (u32)              |
//!  +--------+--------+--------+--------+
//!  |        ack_num (u32)              |
//!  +--------+--------+--------+--------+
//!  | ctrl   | magic  |    window(u16)  |
//!  +--------+--------+--------+--------+
//! ```
//!
//! The magic byte distinguishes ATP segments from stray UDP traffic that
//! happens to share the source endpoint. The payload is capped so that a
//! full segment always fits the IPv4 minimum reassembly buffer.

use crate::Error;

use std::ops::BitOr;

use bytes::{BufMut, BytesMut};

pub const MAGIC: u8 = 0x69;
pub const HEADER_SIZE: usize = 12;

/// 576 - 20 (IP) - 8 (UDP) - 12 (ATP).
pub const MAX_PAYLOAD: usize = 576 - 20 - 8 - HEADER_SIZE;

/// Control bits of a segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Control(u8);

impl Control {
    pub const PUNCH: Control = Control(0b0000_0001);
    pub const THRU: Control = Control(0b0000_0010);
    pub const DATA: Control = Control(0b0000_0100);
    pub const ACK: Control = Control(0b0000_1000);
    pub const RST: Control = Control(0b0001_0000);
    pub const FIN: Control = Control(0b0010_0000);
    pub const KPALIVE: Control = Control(0b0100_0000);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Control) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Control {
    type Output = Control;

    fn bitor(self, rhs: Self) -> Self::Output {
        Control(self.0 | rhs.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub seq_num: u32,
    pub ack_num: u32,
    pub control: Control,
    pub window: u16,
}

/// Whether the buffer is an ATP segment at all: long enough to carry the
/// header and stamped with the magic byte.
pub fn is_segment(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_SIZE && bytes[9] == MAGIC
}

/// Serialize a header and payload into a datagram.
///
/// # Test
///
/// ```
/// use atp_codec::frame::{self, Control, Header};
/// use bytes::BytesMut;
///
/// let header = Header {
///     seq_num: 1,
///     ack_num: 2,
///     control: Control::PUNCH,
///     window: 4096,
/// };
///
/// let mut bytes = BytesMut::new();
/// frame::encode(&header, &[], &mut bytes).unwrap();
///
/// assert_eq!(
///     &bytes[..],
///     &[0, 0, 0, 1, 0, 0, 0, 2, 0x01, 0x69, 0x10, 0x00]
/// );
/// ```
pub fn encode(header: &Header, payload: &[u8], bytes: &mut BytesMut) -> Result<(), Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge);
    }

    bytes.clear();
    bytes.reserve(HEADER_SIZE + payload.len());
    bytes.put_u32(header.seq_num);
    bytes.put_u32(header.ack_num);
    bytes.put_u8(header.control.bits());
    bytes.put_u8(MAGIC);
    bytes.put_u16(header.window);
    bytes.put(payload);

    Ok(())
}

/// Deserialize a datagram into its header and payload.
///
/// Anything shorter than a header or without the magic byte is not an ATP
/// segment and is rejected.
pub fn decode(datagram: &[u8]) -> Result<(Header, &[u8]), Error> {
    if datagram.len() < HEADER_SIZE {
        return Err(Error::InvalidInput);
    }

    if datagram[9] != MAGIC {
        return Err(Error::NotFoundMagicNumber);
    }

    let header = Header {
        seq_num: u32::from_be_bytes(datagram[0..4].try_into()?),
        ack_num: u32::from_be_bytes(datagram[4..8].try_into()?),
        control: Control::from_bits(datagram[8]),
        window: u16::from_be_bytes(datagram[10..12].try_into()?),
    };

    Ok((header, &datagram[HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = Header {
            seq_num: 0xDEADBEEF,
            ack_num: 42,
            control: Control::DATA | Control::ACK,
            window: 4096,
        };

        let payload = b"punch through";
        let mut bytes = BytesMut::new();
        encode(&header, payload, &mut bytes).unwrap();

        let (decoded, body) = decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, payload);
    }

    #[test]
    fn empty_payload_round_trip() {
        let header = Header {
            control: Control::THRU,
            window: 4096,
            ..Default::default()
        };

        let mut bytes = BytesMut::new();
        encode(&header, &[], &mut bytes).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let (decoded, body) = decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(body.is_empty());
    }

    #[test]
    fn short_buffer_rejected() {
        assert_eq!(decode(&[0u8; 11]), Err(Error::InvalidInput));
        assert!(!is_segment(&[0u8; 11]));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = BytesMut::new();
        encode(&Header::default(), &[], &mut bytes).unwrap();
        bytes[9] = 0x42;

        assert_eq!(decode(&bytes), Err(Error::NotFoundMagicNumber));
        assert!(!is_segment(&bytes));
    }

    #[test]
    fn payload_capped_at_reassembly_buffer() {
        let mut bytes = BytesMut::new();
        let payload = vec![0u8; MAX_PAYLOAD];
        encode(&Header::default(), &payload, &mut bytes).unwrap();
        assert_eq!(bytes.len(), 576 - 20 - 8);

        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            encode(&Header::default(), &payload, &mut bytes),
            Err(Error::PayloadTooLarge)
        );
    }

    #[test]
    fn control_bits_classify() {
        let control = Control::PUNCH | Control::KPALIVE;
        assert!(control.contains(Control::PUNCH));
        assert!(control.contains(Control::KPALIVE));
        assert!(!control.contains(Control::THRU));
        assert!(!control.contains(Control::FIN));
        assert!(Control::default().is_empty());
    }
}
