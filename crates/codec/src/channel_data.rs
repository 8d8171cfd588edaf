use bytes::{BufMut, BytesMut};

use super::Error;

/// The valid range of channel numbers.
pub const CHANNEL_RANGE: std::ops::RangeInclusive<u16> = 0x4000..=0x7FFF;

/// The ChannelData Message
///
/// The ChannelData message is used to carry application data between the
/// client and the server.
///
/// The Channel Number field specifies the number of the channel on which
/// the data is traveling, and thus, the address of the peer that is
/// sending or is to receive the data.
///
/// The Length field specifies the length in bytes of the application
/// data field (i.e., it does not include the size of the ChannelData
/// header).  Note that 0 is a valid length.
///
/// Over stream transports the frame is padded to a multiple of four bytes,
/// the padding is not counted in the Length field.
pub struct ChannelData<'a> {
    pub bytes: &'a [u8],
    pub number: u16,
}

impl<'a> ChannelData<'a> {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::channel_data::ChannelData;
    ///
    /// let data: [u8; 5] = [0x40, 0x00, 0x00, 0x40, 0x01];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 16384,
    ///     bytes: &data[..],
    /// }
    /// .encode(&mut bytes, false);
    ///
    /// assert_eq!(ChannelData::message_size(&bytes[..], false).unwrap(), 9);
    /// assert_eq!(ChannelData::message_size(&bytes[..], true).unwrap(), 12);
    /// ```
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        if bytes[0] >> 6 != 1 {
            return Err(Error::InvalidInput);
        }

        let mut size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize + 4;
        if is_tcp && (size % 4) > 0 {
            size += 4 - (size % 4);
        }

        Ok(size)
    }

    /// Writes the frame into `bytes`, replacing whatever it held.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::channel_data::ChannelData;
    ///
    /// let data: [u8; 3] = [0x01, 0x02, 0x03];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 0x4001,
    ///     bytes: &data[..],
    /// }
    /// .encode(&mut bytes, true);
    ///
    /// assert_eq!(&bytes[..], &[0x40, 0x01, 0x00, 0x03, 0x01, 0x02, 0x03, 0x00]);
    /// ```
    pub fn encode(self, bytes: &mut BytesMut, padded: bool) {
        bytes.clear();
        bytes.put_u16(self.number);
        bytes.put_u16(self.bytes.len() as u16);
        bytes.extend_from_slice(self.bytes);

        if padded {
            let pad = (4 - self.bytes.len() % 4) % 4;
            bytes.put_bytes(0, pad);
        }
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::channel_data::ChannelData;
    ///
    /// let data: [u8; 4] = [0x40, 0x00, 0x00, 0x40];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 16384,
    ///     bytes: &data[..],
    /// }
    /// .encode(&mut bytes, false);
    ///
    /// let ret = ChannelData::decode(&bytes[..]).unwrap();
    ///
    /// assert_eq!(ret.number, 16384);
    /// assert_eq!(ret.bytes, &data[..]);
    ///
    /// // channel numbers above 0x7FFF are reserved.
    /// assert!(ChannelData::decode(&[0x80, 0x00, 0x00, 0x00]).is_err());
    /// // the length field may not exceed the buffer.
    /// assert!(ChannelData::decode(&[0x40, 0x00, 0x00, 0x08, 0x01]).is_err());
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let number = u16::from_be_bytes(bytes[..2].try_into()?);
        if !CHANNEL_RANGE.contains(&number) {
            return Err(Error::InvalidInput);
        }

        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if size > bytes.len() - 4 {
            return Err(Error::InvalidLength);
        }

        Ok(Self {
            bytes: &bytes[4..4 + size],
            number,
        })
    }
}
