pub mod address;
pub mod error;

use std::net::SocketAddr;

use bytes::BufMut;
use num_enum::TryFromPrimitive;

use crate::Error;

pub use self::{
    address::{IpFamily, XAddress},
    error::ErrorType,
};

/// STUN Attributes Registry
///
/// [RFC8489]: https://datatracker.ietf.org/doc/html/rfc8489
/// [RFC8656]: https://datatracker.ietf.org/doc/html/rfc8656
///
/// Attribute types in 0x0000-0x7FFF are comprehension-required: a request
/// carrying one the server does not understand is answered with 420.
/// Types in 0x8000-0xFFFF are comprehension-optional and silently skipped
/// when unknown.
///
/// Only the attributes used by STUN Binding and by TURN relaying over UDP
/// are listed here, plus the two ICE attributes that show up in Binding
/// requests sent by browsers.
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, TryFromPrimitive)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedAddressFamily = 0x0017,
    EvenPort = 0x0018,
    RequestedTransport = 0x0019,
    DontFragment = 0x001A,
    XorMappedAddress = 0x0020,
    ReservationToken = 0x0022,
    Priority = 0x0024,
    UseCandidate = 0x0025,
    Software = 0x8022,
    Fingerprint = 0x8028,
    IceControlled = 0x8029,
    IceControlling = 0x802A,
    ResponseOrigin = 0x802B,
}

/// dyn stun/turn message attribute.
pub trait Attribute<'a> {
    /// current attribute inner type.
    type Item;

    /// current attribute type.
    const TYPE: AttributeType;

    /// write the current attribute to the buffer.
    #[allow(unused_variables)]
    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, transaction_id: &'a [u8]) {}

    /// convert buffer to current attribute.
    fn deserialize(bytes: &'a [u8], transaction_id: &'a [u8]) -> Result<Self::Item, Error>;
}

/// UTF-8 attributes: the value is the raw string without terminator.
macro_rules! text_attribute {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            type Item = &'a str;

            const TYPE: AttributeType = AttributeType::$name;

            fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
                bytes.put(value.as_bytes());
            }

            fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
                Ok(std::str::from_utf8(bytes)?)
            }
        }
    };
}

/// Address attributes, all sharing the MAPPED-ADDRESS layout.
macro_rules! address_attribute {
    ($(#[$meta:meta])* $name:ident, $is_xor:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            type Item = SocketAddr;

            const TYPE: AttributeType = AttributeType::$name;

            fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, transaction_id: &'a [u8]) {
                XAddress::serialize(&value, transaction_id, bytes, $is_xor)
            }

            fn deserialize(bytes: &'a [u8], transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
                XAddress::deserialize(bytes, transaction_id, $is_xor)
            }
        }
    };
}

text_attribute!(
    /// The USERNAME attribute identifies the long-term credential used for
    /// the message-integrity check.
    UserName
);

text_attribute!(
    /// The REALM attribute names the credential scope. Present in error
    /// responses it asks the client to authenticate in that realm.
    Realm
);

text_attribute!(
    /// The NONCE attribute is an opaque server-issued value the client
    /// echoes back in authenticated requests.
    Nonce
);

text_attribute!(
    /// Free-form description of the software that sent the message.
    Software
);

address_attribute!(
    /// Reflexive transport address in clear, kept for RFC 3489 clients.
    MappedAddress,
    false
);

address_attribute!(
    /// Reflexive transport address of the client, XOR encoded.
    XorMappedAddress,
    true
);

address_attribute!(
    /// Address of the peer as seen from the server, XOR encoded.
    XorPeerAddress,
    true
);

address_attribute!(
    /// Address the server allocated on behalf of the client, XOR encoded.
    XorRelayedAddress,
    true
);

address_attribute!(
    /// Address the response was sent from.
    ResponseOrigin,
    false
);

/// The DATA attribute carries the application payload of Send and Data
/// indications.
#[derive(Debug, Clone, Copy)]
pub struct Data;

impl<'a> Attribute<'a> for Data {
    type Item = &'a [u8];

    const TYPE: AttributeType = AttributeType::Data;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(bytes)
    }
}

/// HMAC-SHA1 of the message, 20 bytes.
#[derive(Debug, Clone, Copy)]
pub struct MessageIntegrity;

impl<'a> Attribute<'a> for MessageIntegrity {
    type Item = &'a [u8];

    const TYPE: AttributeType = AttributeType::MessageIntegrity;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.len() != 20 {
            return Err(Error::InvalidInput);
        }

        Ok(bytes)
    }
}

/// The ERROR-CODE attribute.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Reserved, should be 0         |Class|     Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Reason Phrase (variable)                                ..
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// `code` holds the wire form, `class << 8 | number`. Two error codes are
/// equal when their codes are, whatever the reason phrase.
#[derive(Debug, Clone, Copy)]
pub struct ErrorCode<'a> {
    pub code: u16,
    pub message: &'a str,
}

impl<'a> Attribute<'a> for ErrorCode<'a> {
    type Item = Self;

    const TYPE: AttributeType = AttributeType::ErrorCode;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        value.serialize(bytes);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Self::try_from(bytes)
    }
}

impl From<ErrorType> for ErrorCode<'_> {
    fn from(value: ErrorType) -> Self {
        Self {
            code: value as u16,
            message: value.into(),
        }
    }
}

impl<'a> ErrorCode<'a> {
    /// Same code as `kind` with a custom reason phrase.
    pub fn with_message(kind: ErrorType, message: &'a str) -> Self {
        Self {
            code: kind as u16,
            message,
        }
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::message::attributes::{ErrorCode, ErrorType};
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x04, 0x25, 0x41, 0x6c, 0x6c, 0x6f, 0x63, 0x61, 0x74,
    ///     0x69, 0x6f, 0x6e, 0x20, 0x4d, 0x69, 0x73, 0x6d, 0x61, 0x74, 0x63,
    ///     0x68,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// ErrorCode::from(ErrorType::AllocationMismatch).serialize(&mut buf);
    /// assert_eq!(&buf[..], &buffer);
    /// ```
    pub fn serialize<B: BufMut>(self, bytes: &mut B) {
        bytes.put_u16(0x0000);
        bytes.put_u16(self.code);
        bytes.put(self.message.as_bytes());
    }
}

impl<'a> TryFrom<&'a [u8]> for ErrorCode<'a> {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::attributes::{ErrorCode, ErrorType};
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x04, 0x26, 0x53, 0x74, 0x61, 0x6c, 0x65, 0x20, 0x4e,
    ///     0x6f, 0x6e, 0x63, 0x65,
    /// ];
    ///
    /// let error = ErrorCode::try_from(&buffer[..]).unwrap();
    /// assert_eq!(error.code, ErrorType::StaleNonce as u16);
    /// assert_eq!(error.message, "Stale Nonce");
    /// ```
    fn try_from(packet: &'a [u8]) -> Result<Self, Self::Error> {
        if packet.len() < 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            code: u16::from_be_bytes(packet[2..4].try_into()?) & 0x07FF,
            message: std::str::from_utf8(&packet[4..])?,
        })
    }
}

impl Eq for ErrorCode<'_> {}
impl PartialEq for ErrorCode<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

/// The UNKNOWN-ATTRIBUTES attribute lists the comprehension-required
/// attribute types that caused a 420 response, 16 bits each.
#[derive(Debug, Clone, Copy)]
pub struct UnknownAttributes;

impl<'a> Attribute<'a> for UnknownAttributes {
    type Item = &'a [u16];

    const TYPE: AttributeType = AttributeType::UnknownAttributes;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        for kind in value {
            bytes.put_u16(*kind);
        }
    }

    /// Decoding a borrowed list of `u16` out of a byte buffer is not
    /// possible, use [`Message::unknown_attributes`] on the request side
    /// and [`unknown_attributes`] on the response side.
    ///
    /// [`Message::unknown_attributes`]: crate::message::Message::unknown_attributes
    fn deserialize(_: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Err(Error::InvalidInput)
    }
}

/// Parses the value of an UNKNOWN-ATTRIBUTES attribute.
///
/// # Test
///
/// ```
/// use turn_relay_codec::message::attributes::unknown_attributes;
///
/// assert_eq!(unknown_attributes(&[0x00, 0x30, 0x7f, 0xff]).unwrap(), vec![0x0030, 0x7fff]);
/// assert!(unknown_attributes(&[0x00]).is_err());
/// ```
pub fn unknown_attributes(bytes: &[u8]) -> Result<Vec<u16>, Error> {
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidInput);
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|it| u16::from_be_bytes([it[0], it[1]]))
        .collect())
}

/// Seconds remaining until the allocation expires, 32 bits.
#[derive(Debug, Clone, Copy)]
pub struct Lifetime;

impl<'a> Attribute<'a> for Lifetime {
    type Item = u32;

    const TYPE: AttributeType = AttributeType::Lifetime;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u32(value)
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u32::from_be_bytes(bytes.try_into()?))
    }
}

/// The protocol of the relayed transport address, as an IP protocol
/// number in the first byte followed by three RFFU bytes. Only UDP (17)
/// can be relayed.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum RequestedTransport {
    Tcp = 0x06000000,
    Udp = 0x11000000,
}

impl<'a> Attribute<'a> for RequestedTransport {
    type Item = Self;

    const TYPE: AttributeType = AttributeType::RequestedTransport;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u32(value as u32)
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Self::try_from(u32::from_be_bytes(bytes.try_into()?)).map_err(|_| Error::InvalidInput)
    }
}

/// The address family the client wants the relayed address in, one byte
/// followed by three RFFU bytes.
#[derive(Debug, Clone, Copy)]
pub struct RequestedAddressFamily;

impl<'a> Attribute<'a> for RequestedAddressFamily {
    type Item = IpFamily;

    const TYPE: AttributeType = AttributeType::RequestedAddressFamily;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u8(value as u8);
        bytes.put_bytes(0, 3);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.len() != 4 {
            return Err(Error::InvalidInput);
        }

        IpFamily::try_from(bytes[0]).map_err(|_| Error::InvalidInput)
    }
}

/// The EVEN-PORT attribute asks for an even relayed port. When the R bit
/// is set the next-higher port is reserved as well.
///
/// ```text
/// 0
/// 0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |R|    RFFU     |
/// +-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy)]
pub struct EvenPort;

impl<'a> Attribute<'a> for EvenPort {
    type Item = bool;

    const TYPE: AttributeType = AttributeType::EvenPort;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u8(if value { 0x80 } else { 0x00 });
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        let flags = bytes.first().ok_or(Error::InvalidInput)?;
        Ok(flags & 0x80 != 0)
    }
}

/// Opaque 8 byte token naming a relayed port reserved by a previous
/// Allocate with EVEN-PORT.
#[derive(Debug, Clone, Copy)]
pub struct ReservationToken;

impl<'a> Attribute<'a> for ReservationToken {
    type Item = u64;

    const TYPE: AttributeType = AttributeType::ReservationToken;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u64(value)
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u64::from_be_bytes(bytes.try_into()?))
    }
}

/// Asks the server to set the DF bit on relayed packets. It has no value.
#[derive(Debug, Clone, Copy)]
pub struct DontFragment;

impl<'a> Attribute<'a> for DontFragment {
    type Item = ();

    const TYPE: AttributeType = AttributeType::DontFragment;

    fn deserialize(_: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(())
    }
}

/// The channel number, 16 bits followed by a two byte RFFU field.
#[derive(Debug, Clone, Copy)]
pub struct ChannelNumber;

impl<'a> Attribute<'a> for ChannelNumber {
    type Item = u16;

    const TYPE: AttributeType = AttributeType::ChannelNumber;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u16(value);
        bytes.put_u16(0);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.len() != 4 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// CRC-32 of the message up to this attribute, XOR'ed with 0x5354554e. It
/// is always the last attribute.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprint;

impl<'a> Attribute<'a> for Fingerprint {
    type Item = u32;

    const TYPE: AttributeType = AttributeType::Fingerprint;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u32(value)
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u32::from_be_bytes(bytes.try_into()?))
    }
}

/// ICE candidate priority carried in Binding requests.
#[derive(Debug, Clone, Copy)]
pub struct Priority;

impl<'a> Attribute<'a> for Priority {
    type Item = u32;

    const TYPE: AttributeType = AttributeType::Priority;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u32(value)
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u32::from_be_bytes(bytes.try_into()?))
    }
}

/// ICE nomination flag, no value.
#[derive(Debug, Clone, Copy)]
pub struct UseCandidate;

impl<'a> Attribute<'a> for UseCandidate {
    type Item = ();

    const TYPE: AttributeType = AttributeType::UseCandidate;

    fn deserialize(_: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(())
    }
}
