use anyhow::{Result, anyhow};
use bytes::{BufMut, BytesMut};
use turn_relay_codec::{
    Attributes, DecodeResult, Decoder, Error,
    channel_data::ChannelData,
    crypto::long_term_key,
    message::{
        Message, MessageEncoder,
        attributes::{error::ErrorType, *},
        methods::*,
    },
};

const TRANSACTION_ID: [u8; 12] = [
    0x64, 0x4f, 0x5a, 0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31,
];

fn fix_length(bytes: &mut BytesMut) {
    let size = (bytes.len() - 20) as u16;
    bytes[2..4].copy_from_slice(&size.to_be_bytes());
}

fn authenticated_allocate(buf: &mut BytesMut, key: &[u8; 16]) -> Result<()> {
    let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TRANSACTION_ID, buf);
    message.append::<RequestedTransport>(RequestedTransport::Udp);
    message.append::<UserName>("user1");
    message.append::<Realm>("localhost");
    message.append::<Nonce>("bm9uY2U=");
    message.flush(Some(key))?;
    Ok(())
}

#[test]
fn binding_response_attributes() -> Result<()> {
    let mut buf = BytesMut::with_capacity(1500);
    {
        let mut message = MessageEncoder::new(BINDING_RESPONSE, &TRANSACTION_ID, &mut buf);
        message.append::<XorMappedAddress>("127.0.0.1:51678".parse()?);
        message.append::<MappedAddress>("127.0.0.1:51678".parse()?);
        message.append::<ResponseOrigin>("127.0.0.1:3478".parse()?);
        message.append::<Software>("turn-relay");
        message.flush(None)?;
    }

    let mut decoder = Decoder::default();
    let DecodeResult::Message(message) = decoder.decode(&buf)? else {
        return Err(anyhow!("expected message"));
    };

    assert_eq!(message.method(), BINDING_RESPONSE);
    assert_eq!(message.transaction_id(), &TRANSACTION_ID);
    assert_eq!(message.get::<XorMappedAddress>(), Some("127.0.0.1:51678".parse()?));
    assert_eq!(message.get::<MappedAddress>(), Some("127.0.0.1:51678".parse()?));
    assert_eq!(message.get::<ResponseOrigin>(), Some("127.0.0.1:3478".parse()?));
    assert_eq!(message.get::<Software>(), Some("turn-relay"));
    assert!(message.contains(AttributeType::Fingerprint));
    assert!(!message.has_integrity());
    Ok(())
}

#[test]
fn integrity_is_verified_with_the_long_term_key() -> Result<()> {
    let key = long_term_key("user1", "test", "localhost");
    let mut buf = BytesMut::with_capacity(1500);
    authenticated_allocate(&mut buf, &key)?;

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes)?;

    assert_eq!(message.method(), ALLOCATE_REQUEST);
    assert_eq!(message.get::<RequestedTransport>(), Some(RequestedTransport::Udp));
    assert_eq!(message.get::<UserName>(), Some("user1"));
    assert_eq!(message.get::<Realm>(), Some("localhost"));
    assert_eq!(message.get::<Nonce>(), Some("bm9uY2U="));
    assert!(message.verify(&key).is_ok());
    assert!(matches!(
        message.verify(&long_term_key("user1", "wrong", "localhost")),
        Err(Error::IntegrityFailed)
    ));

    Ok(())
}

#[test]
fn attributes_after_integrity_are_ignored() -> Result<()> {
    let key = long_term_key("user1", "test", "localhost");
    let mut buf = BytesMut::with_capacity(1500);
    authenticated_allocate(&mut buf, &key)?;

    // drop the fingerprint and smuggle an attribute after the digest.
    buf.truncate(buf.len() - 8);
    buf.put_u16(AttributeType::Software as u16);
    buf.put_u16(4);
    buf.put_slice(b"evil");
    fix_length(&mut buf);

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes)?;

    assert_eq!(message.get::<Software>(), None);
    assert!(message.verify(&key).is_ok());
    Ok(())
}

#[test]
fn corrupted_messages_never_decode() -> Result<()> {
    let key = long_term_key("user1", "test", "localhost");
    let mut buf = BytesMut::with_capacity(1500);
    authenticated_allocate(&mut buf, &key)?;

    for size in 0..buf.len() {
        let mut attributes = Attributes::default();
        assert!(Message::decode(&buf[..size], &mut attributes).is_err());
    }

    for index in 0..buf.len() {
        let mut corrupted = buf.to_vec();
        corrupted[index] ^= 0xff;

        // a damaged FINGERPRINT type turns it into an ignored trailing
        // attribute, everything covered by the digest is still intact.
        let mut attributes = Attributes::default();
        if let Ok(message) = Message::decode(&corrupted, &mut attributes) {
            assert!(index >= buf.len() - 8, "byte {} flipped", index);
            assert_eq!(message.method(), ALLOCATE_REQUEST);
            assert_eq!(message.get::<UserName>(), Some("user1"));
            assert!(message.verify(&key).is_ok());
        }
    }

    Ok(())
}

#[test]
fn overflowing_attribute_is_rejected() -> Result<()> {
    let mut buf = BytesMut::with_capacity(1500);
    {
        let mut message = MessageEncoder::new(BINDING_REQUEST, &TRANSACTION_ID, &mut buf);
        message.append::<UserName>("panda");
    }

    fix_length(&mut buf);
    // claim a value far longer than the message.
    buf[22..24].copy_from_slice(&0x0100u16.to_be_bytes());

    let mut attributes = Attributes::default();
    assert!(matches!(
        Message::decode(&buf, &mut attributes),
        Err(Error::AttributeOverflow)
    ));

    let mut attributes = Attributes::default();
    assert!(matches!(
        Message::decode(&buf[..buf.len() - 4], &mut attributes),
        Err(Error::InvalidLength)
    ));

    Ok(())
}

#[test]
fn unknown_comprehension_required_attributes_are_reported() -> Result<()> {
    let mut buf = BytesMut::with_capacity(1500);
    {
        let mut message = MessageEncoder::new(BINDING_REQUEST, &TRANSACTION_ID, &mut buf);
        message.append::<Priority>(0x6e0001ff);
        message.append::<UseCandidate>(());
    }

    buf.put_u16(0x0030);
    buf.put_u16(4);
    buf.put_u32(0);
    buf.put_u16(0xC001);
    buf.put_u16(0);
    fix_length(&mut buf);

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes)?;

    assert_eq!(message.unknown_attributes(), &[0x0030]);
    assert_eq!(message.get::<Priority>(), Some(0x6e0001ff));
    assert!(message.contains(AttributeType::UseCandidate));
    Ok(())
}

#[test]
fn unknown_method_keeps_the_raw_type() -> Result<()> {
    let mut buf = BytesMut::with_capacity(1500);
    MessageEncoder::raw(0x0002, &TRANSACTION_ID, &mut buf).flush(None)?;

    let mut attributes = Attributes::default();
    assert!(matches!(
        Message::decode(&buf, &mut attributes),
        Err(Error::UnknownMethod(0x0002))
    ));

    assert_eq!(error_kind(0x0002), Some(0x0112));
    Ok(())
}

#[test]
fn error_response_with_unknown_attributes() -> Result<()> {
    let mut buf = BytesMut::with_capacity(1500);
    {
        let mut message = MessageEncoder::new(ALLOCATE_ERROR, &TRANSACTION_ID, &mut buf);
        message.append::<ErrorCode>(ErrorCode::from(ErrorType::UnknownAttribute));
        message.append::<UnknownAttributes>(&[0x0030, 0x0031, 0x0032]);
        message.flush(None)?;
    }

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes)?;

    assert!(message.method().is_error());
    assert_eq!(
        message.get::<ErrorCode>(),
        Some(ErrorCode::from(ErrorType::UnknownAttribute))
    );

    let raw = message
        .raw(AttributeType::UnknownAttributes)
        .ok_or_else(|| anyhow!("missing unknown attributes"))?;
    assert_eq!(unknown_attributes(raw)?, vec![0x0030, 0x0031, 0x0032]);
    Ok(())
}

#[test]
fn turn_attributes() -> Result<()> {
    let mut buf = BytesMut::with_capacity(1500);
    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TRANSACTION_ID, &mut buf);
        message.append::<RequestedTransport>(RequestedTransport::Udp);
        message.append::<RequestedAddressFamily>(IpFamily::V6);
        message.append::<EvenPort>(true);
        message.append::<DontFragment>(());
        message.append::<Lifetime>(1200);
        message.append::<ReservationToken>(0x0102030405060708);
        message.append::<ChannelNumber>(0x4001);
        message.flush(None)?;
    }

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes)?;

    assert_eq!(message.get::<RequestedAddressFamily>(), Some(IpFamily::V6));
    assert_eq!(message.get::<EvenPort>(), Some(true));
    assert_eq!(message.get::<DontFragment>(), Some(()));
    assert_eq!(message.get::<Lifetime>(), Some(1200));
    assert_eq!(message.get::<ReservationToken>(), Some(0x0102030405060708));
    assert_eq!(message.get::<ChannelNumber>(), Some(0x4001));
    Ok(())
}

#[test]
fn data_indication_with_ipv6_peer() -> Result<()> {
    let peer = "[2001:db8::1]:40000".parse()?;
    let mut buf = BytesMut::with_capacity(1500);
    {
        let mut message = MessageEncoder::new(DATA_INDICATION, &TRANSACTION_ID, &mut buf);
        message.append::<XorPeerAddress>(peer);
        message.append::<Data>(b"hello");
        message.flush(None)?;
    }

    let mut decoder = Decoder::default();
    let message = decoder
        .decode(&buf)?
        .into_message()
        .ok_or_else(|| anyhow!("expected message"))?;

    assert_eq!(message.method(), DATA_INDICATION);
    assert_eq!(message.get::<XorPeerAddress>(), Some(peer));
    assert_eq!(message.get::<Data>(), Some(&b"hello"[..]));
    Ok(())
}

#[test]
fn channel_data_framing() -> Result<()> {
    let mut buf = BytesMut::with_capacity(1500);
    ChannelData {
        number: 0x4001,
        bytes: b"hello",
    }
    .encode(&mut buf, true);

    assert_eq!(buf.len(), 12);
    assert_eq!(Decoder::message_size(&buf, true)?, 12);
    assert_eq!(Decoder::message_size(&buf, false)?, 9);

    let mut decoder = Decoder::default();
    let channel = decoder
        .decode(&buf)?
        .into_channel_data()
        .ok_or_else(|| anyhow!("expected channel data"))?;

    assert_eq!(channel.number(), 0x4001);
    assert_eq!(channel.as_bytes(), b"hello");

    assert!(decoder.decode(&[0x40, 0x01, 0x00]).is_err());
    assert!(decoder.decode(&[0xc0, 0x01, 0x00, 0x00]).is_err());
    Ok(())
}
