pub mod attributes;
pub mod methods;

use crate::{
    Attributes, Error,
    crypto::{fingerprint, hmac_sha1},
    message::{
        attributes::{Attribute, AttributeType, MessageIntegrity},
        methods::Method,
    },
};

use bytes::{BufMut, BytesMut};

pub const MAGIC_NUMBER: u32 = 0x2112A442;

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 20;

pub struct MessageEncoder<'a> {
    transaction_id: &'a [u8; 12],
    bytes: &'a mut BytesMut,
}

impl<'a> MessageEncoder<'a> {
    pub fn new(method: Method, transaction_id: &'a [u8; 12], bytes: &'a mut BytesMut) -> Self {
        Self::raw(method.into(), transaction_id, bytes)
    }

    /// Starts a message from a raw message type, used to answer requests
    /// whose method is not known.
    pub fn raw(kind: u16, transaction_id: &'a [u8; 12], bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(kind);
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(transaction_id.as_slice());

        Self {
            transaction_id,
            bytes,
        }
    }

    /// rely on old message to create new message.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::message::methods::*;
    /// use turn_relay_codec::message::*;
    /// use turn_relay_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let mut buf = BytesMut::new();
    /// let old = Message::decode(&buffer[..], &mut attributes).unwrap();
    /// MessageEncoder::extend(BINDING_REQUEST, &old, &mut buf);
    ///
    /// assert_eq!(&buf[..], &buffer[..]);
    /// ```
    pub fn extend(method: Method, reader: &Message<'a>, bytes: &'a mut BytesMut) -> Self {
        Self::new(method, reader.transaction_id(), bytes)
    }

    /// append attribute.
    ///
    /// The value is zero padded to a multiple of four bytes, the length
    /// field carries the unpadded size.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::message::attributes::*;
    /// use turn_relay_codec::message::methods::*;
    /// use turn_relay_codec::message::*;
    ///
    /// let transaction_id = [
    ///     0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let new_buf = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06, 0x00,
    ///     0x05, 0x70, 0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// let mut buf = BytesMut::new();
    /// let mut message = MessageEncoder::new(BINDING_REQUEST, &transaction_id, &mut buf);
    /// message.append::<UserName>("panda");
    ///
    /// assert_eq!(&new_buf[..], &buf[..]);
    /// ```
    pub fn append<'c, T: Attribute<'c>>(&mut self, value: T::Item)
    where
        'a: 'c,
    {
        self.bytes.put_u16(T::TYPE as u16);

        // reserve the length field, it is patched once the value is written.
        let os = self.bytes.len();
        self.bytes.put_u16(0);
        T::serialize(value, self.bytes, self.transaction_id);

        let size = self.bytes.len() - os - 2;
        self.bytes[os..os + 2].copy_from_slice(&(size as u16).to_be_bytes());
        self.bytes.put_bytes(0, alignment_32(size));
    }

    /// Finishes the message.
    ///
    /// With a key the message is signed with MESSAGE-INTEGRITY, a
    /// FINGERPRINT is always appended last.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::crypto::long_term_key;
    /// use turn_relay_codec::message::methods::*;
    /// use turn_relay_codec::message::*;
    ///
    /// let transaction_id = [
    ///     0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let result = [
    ///     0, 1, 0, 32, 33, 18, 164, 66, 114, 109, 73, 66, 114, 82, 100, 72, 87,
    ///     98, 75, 43, 0, 8, 0, 20, 69, 14, 110, 68, 82, 30, 232, 222, 44, 240,
    ///     250, 182, 156, 92, 25, 23, 152, 198, 217, 222, 128, 40, 0, 4, 74, 165,
    ///     171, 86,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// MessageEncoder::new(BINDING_REQUEST, &transaction_id, &mut buf)
    ///     .flush(Some(&long_term_key("panda", "panda", "raspberry")))
    ///     .unwrap();
    ///
    /// assert_eq!(&buf[..], &result);
    /// ```
    pub fn flush(&mut self, key: Option<&[u8; 16]>) -> Result<(), Error> {
        if let Some(key) = key {
            self.integrity(key)?;
        }

        self.fingerprint();
        Ok(())
    }

    // The header length must already count the integrity attribute when the
    // digest is computed.
    fn integrity(&mut self, key: &[u8; 16]) -> Result<(), Error> {
        let len = self.bytes.len();
        self.set_len(len - HEADER_SIZE + 24);

        let hmac = hmac_sha1(key, &[&self.bytes[..]])?;
        self.bytes.put_u16(AttributeType::MessageIntegrity as u16);
        self.bytes.put_u16(20);
        self.bytes.put(hmac.as_slice());

        Ok(())
    }

    fn fingerprint(&mut self) {
        let len = self.bytes.len();
        self.set_len(len - HEADER_SIZE + 8);

        let crc = fingerprint(&self.bytes[..]);
        self.bytes.put_u16(AttributeType::Fingerprint as u16);
        self.bytes.put_u16(4);
        self.bytes.put_u32(crc);
    }

    // set stun message header size.
    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    }
}

pub struct Message<'a> {
    /// message method.
    method: Method,
    /// message source bytes.
    bytes: &'a [u8],
    transaction_id: &'a [u8; 12],
    /// offset of the MESSAGE-INTEGRITY attribute header, if any.
    integrity: Option<usize>,
    // message attribute list.
    attributes: &'a Attributes,
}

impl<'a> Message<'a> {
    /// message method.
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// message transaction id.
    #[inline]
    pub fn transaction_id(&self) -> &'a [u8; 12] {
        self.transaction_id
    }

    /// get attribute.
    ///
    /// get attribute from message attribute list.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::attributes::*;
    /// use turn_relay_codec::message::*;
    /// use turn_relay_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert!(message.get::<UserName>().is_none());
    /// ```
    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let range = self.attributes.get(&T::TYPE)?;
        T::deserialize(&self.bytes[range], self.transaction_id).ok()
    }

    /// Gets all the values of an attribute from a list.
    ///
    /// Normally a stun message can have multiple attributes with the same name,
    /// and this function will all the values of the current attribute. A value
    /// that does not decode is yielded as an error, not skipped.
    pub fn get_all<T: Attribute<'a>>(&self) -> impl Iterator<Item = Result<T::Item, Error>> + '_ {
        self.attributes
            .get_all(&T::TYPE)
            .map(|it| T::deserialize(&self.bytes[it.clone()], self.transaction_id))
    }

    /// Whether the attribute is present, whatever its value.
    pub fn contains(&self, kind: AttributeType) -> bool {
        self.attributes.get(&kind).is_some()
    }

    /// Raw value of an attribute.
    pub fn raw(&self, kind: AttributeType) -> Option<&'a [u8]> {
        self.attributes.get(&kind).map(|range| &self.bytes[range])
    }

    /// Comprehension-required attribute types this codec does not know.
    pub fn unknown_attributes(&self) -> &[u16] {
        self.attributes.unknown()
    }

    /// Whether the message carries a MESSAGE-INTEGRITY attribute.
    pub fn has_integrity(&self) -> bool {
        self.integrity.is_some()
    }

    /// check MessageIntegrity attribute.
    ///
    /// The digest covers the message up to the integrity attribute, with the
    /// header length rewritten as if the message ended right after it.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::crypto::long_term_key;
    /// use turn_relay_codec::message::*;
    /// use turn_relay_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x03, 0x00, 0x50, 0x21, 0x12, 0xa4, 0x42, 0x64, 0x4f, 0x5a,
    ///     0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31, 0x00, 0x19, 0x00,
    ///     0x04, 0x11, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x05, 0x70, 0x61, 0x6e,
    ///     0x64, 0x61, 0x00, 0x00, 0x00, 0x00, 0x14, 0x00, 0x09, 0x72, 0x61, 0x73,
    ///     0x70, 0x62, 0x65, 0x72, 0x72, 0x79, 0x00, 0x00, 0x00, 0x00, 0x15, 0x00,
    ///     0x10, 0x31, 0x63, 0x31, 0x33, 0x64, 0x32, 0x62, 0x32, 0x34, 0x35, 0x62,
    ///     0x33, 0x61, 0x37, 0x33, 0x34, 0x00, 0x08, 0x00, 0x14, 0xd6, 0x78, 0x26,
    ///     0x99, 0x0e, 0x15, 0x56, 0x15, 0xe5, 0xf4, 0x24, 0x74, 0xe2, 0x3c, 0x26,
    ///     0xc5, 0xb1, 0x03, 0xb2, 0x6d,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert!(message.verify(&long_term_key("panda", "panda", "raspberry")).is_ok());
    /// assert!(message.verify(&long_term_key("panda", "bamboo", "raspberry")).is_err());
    /// ```
    pub fn verify(&self, key: &[u8]) -> Result<(), Error> {
        let offset = self.integrity.ok_or(Error::NotFoundIntegrity)?;
        let integrity = self
            .get::<MessageIntegrity>()
            .ok_or(Error::NotFoundIntegrity)?;

        let size = ((offset - HEADER_SIZE + 24) as u16).to_be_bytes();
        let hmac = hmac_sha1(key, &[&self.bytes[0..2], &size, &self.bytes[4..offset]])?;
        if integrity != hmac.as_slice() {
            return Err(Error::IntegrityFailed);
        }

        Ok(())
    }

    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::attributes::*;
    /// use turn_relay_codec::message::methods::*;
    /// use turn_relay_codec::message::*;
    /// use turn_relay_codec::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert_eq!(message.method(), BINDING_REQUEST);
    /// assert!(message.get::<UserName>().is_none());
    ///
    /// // a declared length longer than the buffer.
    /// let mut truncated = buffer;
    /// truncated[3] = 0x04;
    /// assert!(Message::decode(&truncated[..], &mut Attributes::default()).is_err());
    /// ```
    pub fn decode(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Self, Error> {
        let len = bytes.len();

        // There must be at least a complete header.
        if len < HEADER_SIZE || bytes[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        if bytes[4..8] != MAGIC_NUMBER.to_be_bytes() {
            return Err(Error::NotFoundMagicNumber);
        }

        // The length field excludes the header and is always 4 byte aligned.
        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if size % 4 != 0 || size + HEADER_SIZE != len {
            return Err(Error::InvalidLength);
        }

        let transaction_id: &'a [u8; 12] = bytes[8..20].try_into()?;
        let mut integrity = None;
        let mut offset = HEADER_SIZE;

        while offset < len {
            if len - offset < 4 {
                return Err(Error::AttributeOverflow);
            }

            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            let range = (offset + 4)..(offset + 4 + size);
            let next = range.end + alignment_32(size);
            if next > len {
                return Err(Error::AttributeOverflow);
            }

            if key == AttributeType::Fingerprint as u16 {
                if size != 4 || next != len {
                    return Err(Error::FingerprintFailed);
                }

                let value = u32::from_be_bytes(bytes[range.clone()].try_into()?);
                if value != fingerprint(&bytes[..offset]) {
                    return Err(Error::FingerprintFailed);
                }

                attributes.append(AttributeType::Fingerprint, range);
                break;
            }

            // anything after MESSAGE-INTEGRITY, apart from FINGERPRINT, is
            // not covered by the digest and must be ignored.
            if integrity.is_none() {
                match AttributeType::try_from(key) {
                    Ok(kind) => {
                        if kind == AttributeType::MessageIntegrity {
                            integrity = Some(offset);
                        }

                        attributes.append(kind, range);
                    }
                    Err(_) => {
                        if key < 0x8000 {
                            attributes.append_unknown(key);
                        }
                    }
                }
            }

            offset = next;
        }

        let method = Method::try_from(u16::from_be_bytes(bytes[..2].try_into()?))?;

        Ok(Self {
            transaction_id,
            attributes,
            integrity,
            method,
            bytes,
        })
    }

    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// assert_eq!(Message::message_size(&buffer[..]).unwrap(), 20);
    /// assert!(Message::message_size(&buffer[..2]).is_err());
    /// ```
    pub fn message_size(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < 4 || bytes[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes(bytes[2..4].try_into()?) as usize + HEADER_SIZE)
    }
}

/// compute padding size.
///
/// RFC5766 stipulates that the attribute content is a multiple of 4.
///
/// # Test
///
/// ```
/// use turn_relay_codec::message::alignment_32;
///
/// assert_eq!(alignment_32(4), 0);
/// assert_eq!(alignment_32(0), 0);
/// assert_eq!(alignment_32(5), 3);
/// ```
#[inline(always)]
pub fn alignment_32(size: usize) -> usize {
    (4 - size % 4) % 4
}
