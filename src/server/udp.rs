use crate::{Service, config::Interface, server::report};

use std::{
    io::{self, ErrorKind::ConnectionReset},
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Result;
use service::{Connection, Transport, allocation::MAX_DATAGRAM_SIZE};
use tokio::net::UdpSocket;

/// Responses leave through the listening socket itself.
struct UdpConnection(Arc<UdpSocket>);

impl Connection for UdpConnection {
    fn send(&self, bytes: &[u8], target: SocketAddr) -> io::Result<()> {
        match self.0.try_send_to(bytes, target) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("udp socket busy, datagram dropped: addr={target}");
                Ok(())
            }
            ret => ret.map(|_| ()),
        }
    }
}

pub struct UdpListener {
    socket: Arc<UdpSocket>,
    interface: Interface,
}

pub async fn bind(interface: Interface) -> Result<UdpListener> {
    let socket = UdpSocket::bind(interface.listen).await?;

    log::info!(
        "turn server listening: listen={}, external={}, transport=UDP",
        interface.listen,
        interface.external
    );

    Ok(UdpListener {
        socket: Arc::new(socket),
        interface,
    })
}

impl UdpListener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// udp server
    ///
    /// read the data packet from the UDP socket and hand it to the router,
    /// every datagram is handled in arrival order.
    pub async fn serve(self, service: Service) -> Result<()> {
        let local_addr = self.local_addr()?;
        let mut router = service.make_router(
            local_addr,
            Transport::Udp,
            Arc::new(UdpConnection(self.socket.clone())),
        );

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            // An error is also reported when the remote host is gone, which
            // must not take the listener down.
            let (size, address) = match self.socket.recv_from(&mut buffer).await {
                Ok(it) => it,
                Err(e) if e.kind() == ConnectionReset => continue,
                Err(e) => {
                    log::error!(
                        "udp server close: interface={local_addr}, external={}, err={e}",
                        self.interface.external
                    );

                    return Err(e.into());
                }
            };

            // The smallest message is a ChannelData header.
            if size < 4 {
                continue;
            }

            report(router.route(&buffer[..size], address).await, address);
        }
    }
}
