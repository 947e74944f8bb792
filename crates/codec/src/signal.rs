//! The signal envelope carried over the signalling channel.
//!
//! A signal introduces one peer's reflexive endpoint to the other. It is a
//! fixed 12-byte record:
//!
//! ```text
//! magic=0xF6F9 (u16) | zero (u8) | flags (u8) | addr_family (u16)
//!                    | addr_port (u16) | addr_ipv4 (u32)
//! ```
//!
//! Exactly one of the request/response flag bits must be set.

use crate::Error;

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, BytesMut};

pub const MAGIC: u16 = 0xF6F9;
pub const SIGNAL_SIZE: usize = 12;

/// AF_INET, the only address family a signal may carry.
const FAMILY_INET: u16 = 2;

const FLAG_REQUEST: u8 = 0b01;
const FLAG_RESPONSE: u8 = 0b10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub kind: Kind,
    pub endpoint: SocketAddrV4,
}

impl Signal {
    pub fn request(endpoint: SocketAddrV4) -> Self {
        Self {
            kind: Kind::Request,
            endpoint,
        }
    }

    pub fn response(endpoint: SocketAddrV4) -> Self {
        Self {
            kind: Kind::Response,
            endpoint,
        }
    }

    /// # Test
    ///
    /// ```
    /// use atp_codec::signal::Signal;
    /// use bytes::BytesMut;
    ///
    /// let signal = Signal::request("203.0.113.5:40000".parse().unwrap());
    ///
    /// let mut bytes = BytesMut::new();
    /// signal.encode(&mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[0xF6, 0xF9, 0, 0x01, 0, 2, 0x9C, 0x40, 203, 0, 113, 5]
    /// );
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.reserve(SIGNAL_SIZE);
        bytes.put_u16(MAGIC);
        bytes.put_u8(0);
        bytes.put_u8(match self.kind {
            Kind::Request => FLAG_REQUEST,
            Kind::Response => FLAG_RESPONSE,
        });
        bytes.put_u16(FAMILY_INET);
        bytes.put_u16(self.endpoint.port());
        bytes.put_u32((*self.endpoint.ip()).into());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != SIGNAL_SIZE {
            return Err(Error::InvalidInput);
        }

        if u16::from_be_bytes(bytes[0..2].try_into()?) != MAGIC {
            return Err(Error::NotFoundMagicNumber);
        }

        if bytes[2] != 0 {
            return Err(Error::InvalidInput);
        }

        let kind = match bytes[3] {
            FLAG_REQUEST => Kind::Request,
            FLAG_RESPONSE => Kind::Response,
            _ => return Err(Error::InvalidInput),
        };

        if u16::from_be_bytes(bytes[4..6].try_into()?) != FAMILY_INET {
            return Err(Error::InvalidInput);
        }

        let port = u16::from_be_bytes(bytes[6..8].try_into()?);
        let ip = Ipv4Addr::from(u32::from_be_bytes(bytes[8..12].try_into()?));

        Ok(Self {
            kind,
            endpoint: SocketAddrV4::new(ip, port),
        })
    }
}

/// Whether the buffer looks like a signal envelope.
pub fn is_signal(bytes: &[u8]) -> bool {
    bytes.len() == SIGNAL_SIZE && bytes[0..2] == MAGIC.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for signal in [
            Signal::request("203.0.113.5:40000".parse().unwrap()),
            Signal::response("10.0.0.1:1".parse().unwrap()),
        ] {
            let mut bytes = BytesMut::new();
            signal.encode(&mut bytes);
            assert!(is_signal(&bytes));
            assert_eq!(Signal::decode(&bytes).unwrap(), signal);
        }
    }

    #[test]
    fn malformed_rejected() {
        let mut bytes = BytesMut::new();
        Signal::request("203.0.113.5:40000".parse().unwrap()).encode(&mut bytes);

        // Wrong length.
        assert_eq!(Signal::decode(&bytes[..11]), Err(Error::InvalidInput));

        // Wrong magic.
        let mut bad = bytes.clone();
        bad[0] = 0;
        assert_eq!(Signal::decode(&bad), Err(Error::NotFoundMagicNumber));

        // Non-zero pad byte.
        let mut bad = bytes.clone();
        bad[2] = 1;
        assert_eq!(Signal::decode(&bad), Err(Error::InvalidInput));

        // Both flags at once, then neither.
        let mut bad = bytes.clone();
        bad[3] = 0b11;
        assert_eq!(Signal::decode(&bad), Err(Error::InvalidInput));
        bad[3] = 0;
        assert_eq!(Signal::decode(&bad), Err(Error::InvalidInput));

        // Not IPv4.
        let mut bad = bytes.clone();
        bad[5] = 10;
        assert_eq!(Signal::decode(&bad), Err(Error::InvalidInput));
    }
}
