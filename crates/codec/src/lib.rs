//! ## Session Traversal Utilities for NAT (STUN)
//!
//! [RFC8489]: https://tools.ietf.org/html/rfc8489
//! [RFC8656]: https://tools.ietf.org/html/rfc8656
//!
//! STUN is intended to be used in the context of one or more NAT
//! traversal solutions.  TURN [RFC8656] is one of those usages: it
//! extends STUN [RFC8489] with methods and attributes that let a client
//! obtain a relayed transport address on a server and exchange data with
//! peers through it, either wrapped in Send/Data indications or in the
//! compact ChannelData framing.
//!
//! This crate only deals with bytes: it never allocates sockets and keeps no
//! state between calls apart from a reusable attribute index.

pub mod channel_data;
pub mod crypto;
pub mod message;

use self::{
    channel_data::ChannelData,
    message::{Message, attributes::AttributeType},
};

use std::{array::TryFromSliceError, ops::Range, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    /// The buffer is truncated or does not look like STUN or ChannelData.
    InvalidInput,
    /// The header does not carry the fixed magic cookie.
    NotFoundMagicNumber,
    /// The length in the header disagrees with the buffer.
    InvalidLength,
    /// An attribute extends beyond the end of the message.
    AttributeOverflow,
    /// The message type is well formed but not a method this codec knows,
    /// the raw 14 bit message type is kept for error responses.
    UnknownMethod(u16),
    NotFoundIntegrity,
    IntegrityFailed,
    FingerprintFailed,
    SummaryFailed,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

pub enum DecodeResult<'a> {
    Message(Message<'a>),
    ChannelData(ChannelData<'a>),
}

impl<'a> DecodeResult<'a> {
    pub fn into_message(self) -> Option<Message<'a>> {
        match self {
            Self::Message(it) => Some(it),
            Self::ChannelData(_) => None,
        }
    }

    pub fn into_channel_data(self) -> Option<ChannelData<'a>> {
        match self {
            Self::ChannelData(it) => Some(it),
            Self::Message(_) => None,
        }
    }
}

/// A cache of the list of attributes, this is for internal use only.
#[derive(Debug, Clone)]
pub struct Attributes {
    known: Vec<(AttributeType, Range<usize>)>,
    unknown: Vec<u16>,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            known: Vec::with_capacity(20),
            unknown: Vec::new(),
        }
    }
}

impl Attributes {
    /// Adds an attribute to the list.
    pub fn append(&mut self, kind: AttributeType, range: Range<usize>) {
        self.known.push((kind, range));
    }

    /// Records a comprehension-required attribute this codec does not
    /// understand.
    pub fn append_unknown(&mut self, kind: u16) {
        if !self.unknown.contains(&kind) {
            self.unknown.push(kind);
        }
    }

    /// Gets an attribute from the list.
    ///
    /// Note: This function will only look for the first matching property in
    /// the list and return it.
    pub fn get(&self, kind: &AttributeType) -> Option<Range<usize>> {
        self.known
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, v)| v.clone())
    }

    /// Gets all the values of an attribute from a list.
    ///
    /// Normally a stun message can have multiple attributes with the same name,
    /// and this function will all the values of the current attribute.
    pub fn get_all<'a>(
        &'a self,
        kind: &'a AttributeType,
    ) -> impl Iterator<Item = &'a Range<usize>> {
        self.known
            .iter()
            .filter(move |(k, _)| k == kind)
            .map(|(_, v)| v)
    }

    pub fn unknown(&self) -> &[u16] {
        &self.unknown
    }

    pub fn clear(&mut self) {
        self.known.clear();
        self.unknown.clear();
    }
}

#[derive(Default)]
pub struct Decoder(Attributes);

impl Decoder {
    /// Decodes either a STUN message or a ChannelData frame.
    ///
    /// The two leading bits tell them apart: STUN messages always start
    /// with `0b00`, channel numbers live in `0x4000..=0x7FFF` and therefore
    /// start with `0b01`.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::attributes::UserName;
    /// use turn_relay_codec::{Decoder, DecodeResult};
    ///
    /// let buffer = [
    ///     0x00, 0x01, 0x00, 0x0c, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06, 0x00, 0x05,
    ///     0x70, 0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// let mut decoder = Decoder::default();
    /// let payload = decoder.decode(&buffer).unwrap();
    ///
    /// if let DecodeResult::Message(reader) = payload {
    ///     assert_eq!(reader.get::<UserName>(), Some("panda"));
    /// } else {
    ///     panic!("expected a message");
    /// }
    ///
    /// assert!(decoder.decode(&[0x00, 0x01]).is_err());
    /// assert!(decoder.decode(&[0xff, 0xff, 0x00, 0x00]).is_err());
    /// ```
    pub fn decode<'a>(&'a mut self, bytes: &'a [u8]) -> Result<DecodeResult<'a>, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        match bytes[0] >> 6 {
            0 => {
                self.0.clear();

                Ok(DecodeResult::Message(Message::decode(bytes, &mut self.0)?))
            }
            1 => Ok(DecodeResult::ChannelData(ChannelData::decode(bytes)?)),
            _ => Err(Error::InvalidInput),
        }
    }

    /// Size of the frame at the head of a stream buffer.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::Decoder;
    ///
    /// let buffer = [
    ///     0x00, 0x01, 0x00, 0x0c, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06, 0x00, 0x05,
    ///     0x70, 0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// assert_eq!(Decoder::message_size(&buffer, false).unwrap(), 32);
    /// assert_eq!(Decoder::message_size(&[0x40, 0x00, 0x00, 0x05], true).unwrap(), 12);
    /// assert_eq!(Decoder::message_size(&[0x40, 0x00, 0x00, 0x05], false).unwrap(), 9);
    /// ```
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        match bytes[0] >> 6 {
            0 => Message::message_size(bytes),
            1 => ChannelData::message_size(bytes, is_tcp),
            _ => Err(Error::InvalidInput),
        }
    }
}
