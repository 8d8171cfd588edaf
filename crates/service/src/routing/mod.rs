pub(crate) mod request;
pub(crate) mod router;

use crate::{
    Connection, Error, Service, ServiceHandler, Transport,
    allocation::FiveTuple,
    routing::{request::Request, router::*},
};

use std::{net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use codec::{DecodeResult, Decoder};

/// Request dispatcher of one client-facing path.
///
/// A listener owns one router per socket or stream and feeds it every
/// datagram or frame in arrival order. Responses are written through the
/// router's [`Connection`], relayed data leaves through the allocation's
/// relay socket.
pub struct Router<T>
where
    T: ServiceHandler,
{
    service: Service<T>,
    interface: SocketAddr,
    protocol: Transport,
    connection: Arc<dyn Connection>,
    decoder: Decoder,
    bytes: BytesMut,
}

impl<T> Router<T>
where
    T: ServiceHandler + Clone,
{
    pub fn new(
        service: Service<T>,
        interface: SocketAddr,
        protocol: Transport,
        connection: Arc<dyn Connection>,
    ) -> Self {
        Self {
            bytes: BytesMut::with_capacity(4096),
            decoder: Decoder::default(),
            connection,
            interface,
            protocol,
            service,
        }
    }

    pub fn five_tuple(&self, source: SocketAddr) -> FiveTuple {
        FiveTuple {
            server: self.interface,
            protocol: self.protocol,
            client: source,
        }
    }

    /// Handle one message from `source`.
    ///
    /// A failed request is answered with its error response and the error is
    /// returned for logging; indications and ChannelData are never answered.
    pub async fn route(&mut self, bytes: &[u8], source: SocketAddr) -> Result<(), Error> {
        let five_tuple = self.five_tuple(source);

        match self.decoder.decode(bytes) {
            Ok(DecodeResult::ChannelData(channel)) => channel_data(&self.service, &five_tuple, channel),
            Ok(DecodeResult::Message(message)) => {
                let req = Request {
                    service: &self.service,
                    connection: &self.connection,
                    encode_buffer: &mut self.bytes,
                    payload: &message,
                    five_tuple,
                };

                dispatch(req).await
            }
            Err(e) => malformed(
                &self.service,
                &self.connection,
                &five_tuple,
                bytes,
                &mut self.bytes,
                e,
            ),
        }
    }
}
