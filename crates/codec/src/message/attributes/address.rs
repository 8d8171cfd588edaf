use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

use crate::Error;

const MAGIC_NUMBER: u32 = 0x2112A442;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum IpFamily {
    V4 = 0x01,
    V6 = 0x02,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Address value shared by MAPPED-ADDRESS, XOR-MAPPED-ADDRESS,
/// XOR-PEER-ADDRESS, XOR-RELAYED-ADDRESS and RESPONSE-ORIGIN.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |0 0 0 0 0 0 0 0|    Family     |         (X-)Port              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                (X-)Address (32 bits or 128 bits)              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The XOR variants obfuscate the port with the high 16 bits of the magic
/// cookie and the address with the magic cookie, followed for IPv6 by the
/// transaction id. NATs that rewrite their own public address inside
/// payloads leave the XOR form alone.
#[derive(Debug, Clone, Copy)]
pub struct XAddress;

impl XAddress {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_relay_codec::message::attributes::address::XAddress;
    ///
    /// let xor_addr_bytes: [u8; 8] =
    ///     [0x00, 0x01, 0xfc, 0xbe, 0xe1, 0xba, 0xa4, 0x29];
    ///
    /// let addr_bytes: [u8; 8] = [0x00, 0x01, 0xdd, 0xac, 0xc0, 0xa8, 0x00, 0x6b];
    ///
    /// let transaction_id: [u8; 12] = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let source = "192.168.0.107:56748".parse().unwrap();
    ///
    /// let mut buffer = BytesMut::with_capacity(1280);
    /// XAddress::serialize(&source, &transaction_id, &mut buffer, true);
    /// assert_eq!(&xor_addr_bytes, &buffer[..]);
    ///
    /// let mut buffer = BytesMut::with_capacity(1280);
    /// XAddress::serialize(&source, &transaction_id, &mut buffer, false);
    /// assert_eq!(&addr_bytes, &buffer[..]);
    /// ```
    pub fn serialize<B: BufMut>(
        addr: &SocketAddr,
        transaction_id: &[u8],
        bytes: &mut B,
        is_xor: bool,
    ) {
        let addr = if is_xor {
            xor(addr, transaction_id)
        } else {
            *addr
        };

        bytes.put_u8(0);
        bytes.put_u8(IpFamily::of(&addr.ip()) as u8);
        bytes.put_u16(addr.port());

        match addr.ip() {
            IpAddr::V4(ip) => bytes.put(&ip.octets()[..]),
            IpAddr::V6(ip) => bytes.put(&ip.octets()[..]),
        }
    }

    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::attributes::address::XAddress;
    ///
    /// let xor_addr_bytes: [u8; 8] =
    ///     [0x00, 0x01, 0xfc, 0xbe, 0xe1, 0xba, 0xa4, 0x29];
    ///
    /// let addr_bytes: [u8; 8] = [0x00, 0x01, 0xdd, 0xac, 0xc0, 0xa8, 0x00, 0x6b];
    ///
    /// let transaction_id: [u8; 12] = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let source = "192.168.0.107:56748".parse().unwrap();
    ///
    /// let addr = XAddress::deserialize(&xor_addr_bytes, &transaction_id, true).unwrap();
    /// assert_eq!(addr, source);
    ///
    /// let addr = XAddress::deserialize(&addr_bytes, &transaction_id, false).unwrap();
    /// assert_eq!(addr, source);
    ///
    /// // unknown family
    /// assert!(XAddress::deserialize(&[0, 3, 0, 0, 1, 2, 3, 4], &transaction_id, true).is_err());
    /// ```
    pub fn deserialize(
        mut bytes: &[u8],
        transaction_id: &[u8],
        is_xor: bool,
    ) -> Result<SocketAddr, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        bytes.advance(1);

        let family = IpFamily::try_from(bytes.get_u8()).map_err(|_| Error::InvalidInput)?;
        let port = bytes.get_u16();
        let ip = match family {
            IpFamily::V4 => IpAddr::V4(<[u8; 4]>::try_from(bytes)?.into()),
            IpFamily::V6 => IpAddr::V6(<[u8; 16]>::try_from(bytes)?.into()),
        };

        let addr = SocketAddr::new(ip, port);
        Ok(if is_xor {
            xor(&addr, transaction_id)
        } else {
            addr
        })
    }
}

/// # Test
///
/// ```
/// use std::net::SocketAddr;
/// use turn_relay_codec::message::attributes::address::xor;
///
/// let source: SocketAddr = "192.168.0.107:1".parse().unwrap();
/// let res: SocketAddr = "225.186.164.41:8467".parse().unwrap();
///
/// let transaction_id: [u8; 12] = [
///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
/// ];
///
/// assert_eq!(xor(&source, &transaction_id), res);
/// assert_eq!(xor(&res, &transaction_id), source);
/// ```
pub fn xor(addr: &SocketAddr, transaction_id: &[u8]) -> SocketAddr {
    let cookie = MAGIC_NUMBER.to_be_bytes();
    let ip = match addr.ip() {
        IpAddr::V4(it) => {
            let mut octets = it.octets();
            for (b, k) in octets.iter_mut().zip(cookie) {
                *b ^= k;
            }

            IpAddr::V4(octets.into())
        }
        IpAddr::V6(it) => {
            let mut octets = it.octets();
            for (b, k) in octets
                .iter_mut()
                .zip(cookie.iter().chain(transaction_id.iter()))
            {
                *b ^= k;
            }

            IpAddr::V6(octets.into())
        }
    };

    SocketAddr::new(ip, addr.port() ^ (MAGIC_NUMBER >> 16) as u16)
}
