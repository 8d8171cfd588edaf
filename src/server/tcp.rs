use crate::{
    Service,
    config::Interface,
    server::{MAX_MESSAGE_SIZE, report},
};

use std::{io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use bytes::{Buf, Bytes, BytesMut};
use codec::Decoder;
use service::{Connection, Transport};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener as Listener, TcpStream},
    sync::mpsc::{UnboundedSender, unbounded_channel},
};

/// Writes of one stream are serialized through its writer task.
struct TcpConnection(UnboundedSender<Bytes>);

impl Connection for TcpConnection {
    fn send(&self, bytes: &[u8], _: SocketAddr) -> io::Result<()> {
        self.0
            .send(Bytes::copy_from_slice(bytes))
            .map_err(|_| io::Error::from(io::ErrorKind::NotConnected))
    }
}

pub struct TcpListener {
    listener: Listener,
    interface: Interface,
}

pub async fn bind(interface: Interface) -> Result<TcpListener> {
    let listener = Listener::bind(interface.listen).await?;

    log::info!(
        "turn server listening: listen={}, external={}, transport=TCP",
        interface.listen,
        interface.external
    );

    Ok(TcpListener {
        listener,
        interface,
    })
}

impl TcpListener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// tcp server
    ///
    /// Every accepted stream gets its own router, frames are split out of
    /// the byte stream and handled in order.
    pub async fn serve(self, service: Service) -> Result<()> {
        let local_addr = self.local_addr()?;

        loop {
            let (socket, address) = match self.listener.accept().await {
                Ok(it) => it,
                Err(e) => {
                    log::error!(
                        "tcp server close: interface={local_addr}, external={}, err={e}",
                        self.interface.external
                    );

                    return Err(e.into());
                }
            };

            log::info!("tcp socket accept: addr={address}, interface={local_addr}");

            // Disable the Nagle algorithm, relayed data should leave as soon
            // as it arrives.
            if let Err(e) = socket.set_nodelay(true) {
                log::error!("tcp socket set nodelay failed!: addr={address}, err={e}");
            }

            tokio::spawn(session(socket, address, local_addr, service.clone()));
        }
    }
}

async fn session(socket: TcpStream, address: SocketAddr, local_addr: SocketAddr, service: Service) {
    let (mut reader, mut writer) = socket.into_split();
    let (sender, mut receiver) = unbounded_channel::<Bytes>();

    let writing = tokio::spawn(async move {
        while let Some(bytes) = receiver.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut router = service.make_router(local_addr, Transport::Tcp, Arc::new(TcpConnection(sender)));
    let mut buffer = BytesMut::with_capacity(MAX_MESSAGE_SIZE);

    'a: loop {
        match reader.read_buf(&mut buffer).await {
            // The peer closed the stream.
            Ok(0) | Err(_) => break,
            Ok(_) => (),
        }

        while buffer.len() >= 4 {
            let size = match Decoder::message_size(&buffer, true) {
                Ok(size) if size <= MAX_MESSAGE_SIZE => size,
                Ok(size) => {
                    log::warn!(
                        "tcp message size too large: size={size}, max={MAX_MESSAGE_SIZE}, addr={address}"
                    );

                    break 'a;
                }
                // Neither a STUN message nor ChannelData, the stream can not
                // be resynchronized.
                Err(_) => break 'a,
            };

            if size > buffer.len() {
                break;
            }

            report(router.route(&buffer[..size], address).await, address);
            buffer.advance(size);
        }
    }

    // The allocation lives as long as the stream carrying it.
    service.table().delete(&router.five_tuple(address));

    drop(router);
    writing.abort();

    log::info!("tcp socket disconnect: addr={address}, interface={local_addr}");
}
