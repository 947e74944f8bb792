pub mod attributes;
pub mod methods;

use crate::{Error, alignment_32};

use self::{
    attributes::{Attribute, AttributeType, COMPREHENSION_REQUIRED_MAX},
    methods::Method,
};

use std::ops::Range;

use bytes::{BufMut, BytesMut};

pub const MAGIC_NUMBER: u32 = 0x2112A442;
pub const HEADER_SIZE: usize = 20;

/// The 96-bit transaction identifier echoed back by the server.
///
/// Ordering is lexicographic over the raw bytes so ids can live in ordered
/// collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl From<[u8; 12]> for TransactionId {
    fn from(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }
}

/// Whether the buffer is a well-formed STUN message: the two most
/// significant bits of the first byte are zero, the magic number matches,
/// and the length field is a multiple of 4 that covers the rest of the
/// buffer exactly.
///
/// # Test
///
/// ```
/// use atp_codec::message::is_message;
///
/// let buffer = [
///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
/// ];
///
/// assert!(is_message(&buffer));
/// assert!(!is_message(&buffer[..19]));
/// ```
pub fn is_message(bytes: &[u8]) -> bool {
    if bytes.len() < HEADER_SIZE {
        return false;
    }

    if bytes[0] >> 6 != 0 {
        return false;
    }

    if bytes[4..8] != MAGIC_NUMBER.to_be_bytes() {
        return false;
    }

    let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    length % 4 == 0 && length == bytes.len() - HEADER_SIZE
}

pub struct MessageEncoder<'a> {
    bytes: &'a mut BytesMut,
}

impl<'a> MessageEncoder<'a> {
    pub fn new(method: Method, token: &TransactionId, bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(token.as_bytes().as_slice());

        Self { bytes }
    }

    /// append attribute.
    ///
    /// append attribute to message attribute list.
    pub fn append<'c, T: Attribute<'c>>(&mut self, value: T::Item) {
        self.bytes.put_u16(T::TYPE as u16);

        // Reserve the length field, serialize, then write the size back.
        let os = self.bytes.len();
        self.bytes.put_u16(0);
        T::serialize(value, self.bytes);

        let size = self.bytes.len() - os - 2;
        self.bytes[os..os + 2].copy_from_slice(&(size as u16).to_be_bytes());

        let psize = alignment_32(size);
        if psize > 0 {
            self.bytes.put(&[0u8; 4][0..psize]);
        }
    }

    /// Write the final attribute-list size into the header.
    pub fn flush(self) {
        let len = self.bytes.len() - HEADER_SIZE;
        self.bytes[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    }
}

pub struct Message<'a> {
    method: Method,
    bytes: &'a [u8],
    attributes: Vec<(AttributeType, Range<usize>)>,
}

impl<'a> Message<'a> {
    /// message method.
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// message transaction id.
    #[inline]
    pub fn token(&self) -> TransactionId {
        let mut token = [0u8; 12];
        token.copy_from_slice(&self.bytes[8..20]);
        TransactionId::from(token)
    }

    /// get attribute.
    ///
    /// get attribute from message attribute list.
    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let range = self
            .attributes
            .iter()
            .find(|(kind, _)| *kind == T::TYPE)
            .map(|(_, range)| range.clone())?;

        T::deserialize(&self.bytes[range]).ok()
    }

    /// Decode a message and index its attribute list.
    ///
    /// An unknown comprehension-required attribute rejects the whole
    /// message; unknown comprehension-optional attributes are skipped.
    ///
    /// # Test
    ///
    /// ```
    /// use atp_codec::message::{Message, methods::Method};
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let message = Message::decode(&buffer[..]).unwrap();
    ///
    /// assert_eq!(message.method(), Method::BindingRequest);
    /// assert_eq!(message.token().as_bytes()[0], 0x72);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if !is_message(bytes) {
            return Err(Error::InvalidInput);
        }

        let method = Method::try_from(u16::from_be_bytes(bytes[..2].try_into()?))
            .map_err(|_| Error::UnknownMethod)?;

        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;

        while bytes.len() - offset >= 4 {
            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            offset += 4;
            if bytes.len() - offset < size {
                return Err(Error::InvalidInput);
            }

            let range = offset..(offset + size);
            offset += size + alignment_32(size);

            match AttributeType::try_from(key) {
                Ok(kind) => attributes.push((kind, range)),
                Err(_) if key <= COMPREHENSION_REQUIRED_MAX => {
                    return Err(Error::UnknownRequiredAttribute(key));
                }
                Err(_) => continue,
            }
        }

        Ok(Self {
            method,
            bytes,
            attributes,
        })
    }
}
