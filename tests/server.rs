use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow, ensure};
use bytes::BytesMut;
use codec::{
    Attributes, DecodeResult, Decoder,
    channel_data::ChannelData,
    crypto::long_term_key,
    message::{Message, MessageEncoder, attributes::*, methods::*},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use turn_relay::{
    Service,
    config::{Config, Interface, Transport},
    make_service,
    server::{tcp, udp},
};

const REALM: &str = "localhost";
const USERNAME: &str = "user1";
const PASSWORD: &str = "test";

fn config(range: &str) -> Result<Config> {
    Ok(format!(
        r#"{{
            server: {{ realm: "{REALM}" }},
            relay: {{ listen: "127.0.0.1", "port-range": "{range}" }},
            auth: {{ "static-credentials": {{ {USERNAME}: "{PASSWORD}" }} }},
        }}"#
    )
    .parse()?)
}

fn interface(transport: Transport) -> Result<Interface> {
    Ok(Interface {
        listen: "127.0.0.1:0".parse()?,
        external: "127.0.0.1:3478".parse()?,
        transport,
    })
}

/// Encode a request, signed with the long-term key when a nonce is given.
fn request<F>(method: Method, nonce: Option<&str>, build: F) -> Result<Vec<u8>>
where
    F: FnOnce(&mut MessageEncoder<'_>),
{
    let transaction_id: [u8; 12] = rand::random();
    let key = long_term_key(USERNAME, PASSWORD, REALM);
    let mut buf = BytesMut::with_capacity(1500);

    {
        let mut message = MessageEncoder::new(method, &transaction_id, &mut buf);
        build(&mut message);

        if let Some(nonce) = nonce {
            message.append::<UserName>(USERNAME);
            message.append::<Realm>(REALM);
            message.append::<Nonce>(nonce);
        }

        message.flush(nonce.map(|_| &key))?;
    }

    Ok(buf.to_vec())
}

fn allocate(message: &mut MessageEncoder<'_>) {
    message.append::<RequestedTransport>(RequestedTransport::Udp);
}

struct UdpClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl UdpClient {
    async fn call(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.socket.send_to(bytes, self.server).await?;
        self.recv().await
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        let (size, _) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf)).await??;
        Ok(buf[..size].to_vec())
    }
}

async fn udp_server(range: &str) -> Result<(Service, UdpClient)> {
    let service = make_service(&config(range)?);
    let listener = udp::bind(interface(Transport::Udp)?).await?;
    let server = listener.local_addr()?;
    tokio::spawn(listener.serve(service.clone()));

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    Ok((service, UdpClient { socket, server }))
}

fn nonce_of(bytes: &[u8]) -> Result<String> {
    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes)?;
    ensure!(message.method() == ALLOCATE_ERROR);

    Ok(message
        .get::<Nonce>()
        .ok_or_else(|| anyhow!("missing nonce"))?
        .to_string())
}

#[tokio::test]
async fn relay_over_udp() -> Result<()> {
    let (service, client) = udp_server("48000..48099").await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_address = peer.local_addr()?;

    let bytes = client.call(&request(BINDING_REQUEST, None, |_| {})?).await?;
    {
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        assert_eq!(message.method(), BINDING_RESPONSE);
        assert_eq!(
            message.get::<XorMappedAddress>(),
            Some(client.socket.local_addr()?)
        );
    }

    let nonce = nonce_of(&client.call(&request(ALLOCATE_REQUEST, None, allocate)?).await?)?;

    let bytes = client
        .call(&request(ALLOCATE_REQUEST, Some(&nonce), allocate)?)
        .await?;

    let relayed = {
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        assert_eq!(message.method(), ALLOCATE_RESPONSE);
        assert_eq!(message.get::<Lifetime>(), Some(600));
        message.verify(&long_term_key(USERNAME, PASSWORD, REALM))?;

        message
            .get::<XorRelayedAddress>()
            .ok_or_else(|| anyhow!("missing relayed address"))?
    };

    assert!((48000..=48099).contains(&relayed.port()));
    assert_eq!(service.table().len(), 1);

    let bytes = client
        .call(&request(CHANNEL_BIND_REQUEST, Some(&nonce), |message| {
            message.append::<ChannelNumber>(0x4001);
            message.append::<XorPeerAddress>(peer_address);
        })?)
        .await?;

    {
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        assert_eq!(message.method(), CHANNEL_BIND_RESPONSE);
    }

    let mut frame = BytesMut::new();
    ChannelData {
        number: 0x4001,
        bytes: b"ping",
    }
    .encode(&mut frame, false);
    client.socket.send_to(&frame, client.server).await?;

    let mut buf = [0u8; 1500];
    let (size, source) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..size], b"ping");
    assert_eq!(source, relayed);

    peer.send_to(b"pong", relayed).await?;
    let bytes = client.recv().await?;
    {
        let mut decoder = Decoder::default();
        let channel = decoder
            .decode(&bytes)?
            .into_channel_data()
            .ok_or_else(|| anyhow!("expected channel data"))?;

        assert_eq!(channel.number(), 0x4001);
        assert_eq!(channel.as_bytes(), b"pong");
    }

    let bytes = client
        .call(&request(REFRESH_REQUEST, Some(&nonce), |message| {
            message.append::<Lifetime>(0);
        })?)
        .await?;

    {
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        assert_eq!(message.method(), REFRESH_RESPONSE);
    }

    assert!(service.table().is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_users_are_rejected() -> Result<()> {
    let (service, client) = udp_server("48100..48199").await?;

    let nonce = nonce_of(&client.call(&request(ALLOCATE_REQUEST, None, allocate)?).await?)?;

    let transaction_id: [u8; 12] = rand::random();
    let mut buf = BytesMut::new();
    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &transaction_id, &mut buf);
        allocate(&mut message);
        message.append::<UserName>("nobody");
        message.append::<Realm>(REALM);
        message.append::<Nonce>(&nonce);
        message.flush(Some(&long_term_key("nobody", PASSWORD, REALM)))?;
    }

    let bytes = client.call(&buf).await?;
    let mut attributes = Attributes::default();
    let message = Message::decode(&bytes, &mut attributes)?;
    assert_eq!(message.method(), ALLOCATE_ERROR);
    assert_eq!(
        message.get::<ErrorCode>().map(|it| it.code),
        Some(ErrorType::Unauthorized as u16)
    );

    assert!(service.table().is_empty());
    Ok(())
}

/// Read one complete frame off the stream.
async fn read_frame(stream: &mut TcpStream, buffer: &mut BytesMut) -> Result<Vec<u8>> {
    loop {
        if buffer.len() >= 4 {
            let size = Decoder::message_size(buffer, true)?;
            if buffer.len() >= size {
                return Ok(buffer.split_to(size).to_vec());
            }
        }

        let size = timeout(Duration::from_secs(2), stream.read_buf(buffer)).await??;
        ensure!(size > 0, "stream closed");
    }
}

#[tokio::test]
async fn relay_over_tcp() -> Result<()> {
    let service = make_service(&config("48200..48299")?);
    let listener = tcp::bind(interface(Transport::Tcp)?).await?;
    let server = listener.local_addr()?;
    tokio::spawn(listener.serve(service.clone()));

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_address = peer.local_addr()?;

    let mut stream = TcpStream::connect(server).await?;
    let mut buffer = BytesMut::new();

    stream.write_all(&request(ALLOCATE_REQUEST, None, allocate)?).await?;
    let nonce = nonce_of(&read_frame(&mut stream, &mut buffer).await?)?;

    stream
        .write_all(&request(ALLOCATE_REQUEST, Some(&nonce), allocate)?)
        .await?;

    let relayed = {
        let bytes = read_frame(&mut stream, &mut buffer).await?;
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        assert_eq!(message.method(), ALLOCATE_RESPONSE);

        message
            .get::<XorRelayedAddress>()
            .ok_or_else(|| anyhow!("missing relayed address"))?
    };

    stream
        .write_all(&request(CHANNEL_BIND_REQUEST, Some(&nonce), |message| {
            message.append::<ChannelNumber>(0x4000);
            message.append::<XorPeerAddress>(peer_address);
        })?)
        .await?;

    {
        let bytes = read_frame(&mut stream, &mut buffer).await?;
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        assert_eq!(message.method(), CHANNEL_BIND_RESPONSE);
    }

    // an odd payload length makes the frame padded on the stream.
    peer.send_to(b"odd", relayed).await?;
    let frame = read_frame(&mut stream, &mut buffer).await?;
    assert_eq!(frame.len(), 8);
    match Decoder::default().decode(&frame)? {
        DecodeResult::ChannelData(channel) => {
            assert_eq!(channel.number(), 0x4000);
            assert_eq!(channel.as_bytes(), b"odd");
        }
        DecodeResult::Message(_) => return Err(anyhow!("expected channel data")),
    }

    let mut frame = BytesMut::new();
    ChannelData {
        number: 0x4000,
        bytes: b"to the peer",
    }
    .encode(&mut frame, true);
    stream.write_all(&frame).await?;

    let mut buf = [0u8; 1500];
    let (size, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..size], b"to the peer");
    assert_eq!(service.table().len(), 1);

    // closing the stream releases the allocation.
    drop(stream);
    for _ in 0..50 {
        if service.table().is_empty() {
            break;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(service.table().is_empty());
    Ok(())
}
