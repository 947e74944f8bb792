use crate::Error;

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use super::MAGIC_NUMBER;

/// RFC 5389 18.2: attributes from 0x0000-0x7FFF are comprehension required,
/// attributes from 0x8000-0xFFFF are comprehension optional.
pub const COMPREHENSION_REQUIRED_MAX: u16 = 0x7FFF;

/// Attribute types this implementation knows about.
///
/// Only XOR-MAPPED-ADDRESS and ERROR-CODE are ever consumed; the rest are
/// recognised so that their presence does not reject an otherwise valid
/// response.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorMappedAddress = 0x0020,
    Software = 0x8022,
    AlternateServer = 0x8023,
    Fingerprint = 0x8028,
}

pub trait Attribute<'a> {
    type Item;

    const TYPE: AttributeType;

    fn serialize(value: Self::Item, bytes: &mut BytesMut);

    fn deserialize(bytes: &'a [u8]) -> Result<Self::Item, Error>;
}

/// The address family byte inside a (XOR-)MAPPED-ADDRESS value.
const ADDRESS_FAMILY_IPV4: u8 = 0x01;

/// XOR-MAPPED-ADDRESS, the reflexive transport address.
///
/// The port is XOR'ed with the most significant 16 bits of the magic
/// number, the IPv4 address with the magic number itself.
pub struct XorMappedAddress;

impl<'a> Attribute<'a> for XorMappedAddress {
    type Item = SocketAddrV4;

    const TYPE: AttributeType = AttributeType::XorMappedAddress;

    fn serialize(value: Self::Item, bytes: &mut BytesMut) {
        bytes.put_u8(0);
        bytes.put_u8(ADDRESS_FAMILY_IPV4);
        bytes.put_u16(value.port() ^ (MAGIC_NUMBER >> 16) as u16);
        bytes.put_u32(u32::from(*value.ip()) ^ MAGIC_NUMBER);
    }

    fn deserialize(bytes: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.len() != 8 || bytes[0] != 0 {
            return Err(Error::InvalidInput);
        }

        if bytes[1] != ADDRESS_FAMILY_IPV4 {
            return Err(Error::InvalidInput);
        }

        let port = u16::from_be_bytes(bytes[2..4].try_into()?) ^ (MAGIC_NUMBER >> 16) as u16;
        let ip = u32::from_be_bytes(bytes[4..8].try_into()?) ^ MAGIC_NUMBER;

        Ok(SocketAddrV4::new(Ipv4Addr::from(ip), port))
    }
}

/// ERROR-CODE: a numeric code in the 300-699 range plus a reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: u16,
}

impl<'a> Attribute<'a> for ErrorCode {
    type Item = ErrorCode;

    const TYPE: AttributeType = AttributeType::ErrorCode;

    fn serialize(value: Self::Item, bytes: &mut BytesMut) {
        bytes.put_u16(0);
        bytes.put_u8((value.code / 100) as u8);
        bytes.put_u8((value.code % 100) as u8);
    }

    fn deserialize(bytes: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let class = (bytes[2] & 0x07) as u16;
        let number = bytes[3] as u16;

        Ok(ErrorCode {
            code: class * 100 + number,
        })
    }
}
