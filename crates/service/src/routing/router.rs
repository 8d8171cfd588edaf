use crate::{
    Connection, Error, Service, ServiceHandler,
    allocation::{Allocation, AllocationError, FiveTuple, clamp_lifetime, ports::RelayRequest},
    routing::request::{Request, reject},
};

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use codec::{
    channel_data::{CHANNEL_RANGE, ChannelData},
    message::{
        HEADER_SIZE, MAGIC_NUMBER, MessageEncoder,
        attributes::{address::IpFamily, error::ErrorType, *},
        methods::*,
    },
};

pub(crate) async fn dispatch<T>(req: Request<'_, '_, T>) -> Result<(), Error>
where
    T: ServiceHandler,
{
    let method = req.payload.method();
    if method.is_indication() {
        return match method {
            SEND_INDICATION => indication(req),
            _ => Ok(()),
        };
    }

    // responses are never answered.
    if !method.is_request() {
        return Ok(());
    }

    if !req.payload.unknown_attributes().is_empty() {
        return reject(req, ErrorType::UnknownAttribute.into(), None);
    }

    match method {
        BINDING_REQUEST => binding(req),
        ALLOCATE_REQUEST => allocate(req).await,
        CREATE_PERMISSION_REQUEST => create_permission(req).await,
        CHANNEL_BIND_REQUEST => channel_bind(req).await,
        REFRESH_REQUEST => refresh(req).await,
        _ => Ok(()),
    }
}

/// Answer what can still be answered of a message that failed to decode.
///
/// Only requests are answered: an unknown method gets 400 "Not Implemented"
/// and any other broken request with a valid header gets 400.
pub(crate) fn malformed<T>(
    service: &Service<T>,
    connection: &Arc<dyn Connection>,
    five_tuple: &FiveTuple,
    bytes: &[u8],
    encode_buffer: &mut BytesMut,
    error: codec::Error,
) -> Result<(), Error>
where
    T: ServiceHandler,
{
    if bytes.len() < HEADER_SIZE || bytes[0] >> 6 != 0 || bytes[4..8] != MAGIC_NUMBER.to_be_bytes() {
        return Err(error.into());
    }

    let Some(kind) = error_kind(u16::from_be_bytes([bytes[0], bytes[1]])) else {
        return Err(error.into());
    };

    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&bytes[8..HEADER_SIZE]);

    let reason = match error {
        codec::Error::UnknownMethod(_) => "Not Implemented",
        _ => "Bad Request",
    };

    {
        let mut message = MessageEncoder::raw(kind, &transaction_id, encode_buffer);
        message.append::<ErrorCode>(ErrorCode::with_message(ErrorType::BadRequest, reason));
        message.append::<Software>(&service.software);
        message.flush(None)?;
    }

    connection.send(&encode_buffer[..], five_tuple.client)?;
    Err(error.into())
}

/// [rfc8489](https://tools.ietf.org/html/rfc8489)
///
/// The STUN server copies the source transport address of the Binding
/// request into an XOR-MAPPED-ADDRESS attribute in the Binding response
/// and sends the Binding response back to the STUN client. Binding needs no
/// credentials.
fn binding<T>(req: Request<'_, '_, T>) -> Result<(), Error>
where
    T: ServiceHandler,
{
    {
        let mut message = MessageEncoder::extend(BINDING_RESPONSE, req.payload, req.encode_buffer);
        message.append::<XorMappedAddress>(req.five_tuple.client);
        message.append::<MappedAddress>(req.five_tuple.client);
        message.append::<ResponseOrigin>(req.five_tuple.server);
        message.append::<Software>(&req.service.software);
        message.flush(None)?;
    }

    req.send()
}

/// [rfc8656](https://tools.ietf.org/html/rfc8656#section-7.2)
///
/// If the 5-tuple is already in use by an existing allocation and the
/// request is a retransmission of the transaction that created it, the
/// server replies with the original success response, otherwise with a 437
/// (Allocation Mismatch) error.
///
/// The request must carry REQUESTED-TRANSPORT and only UDP relaying is
/// offered. EVEN-PORT and REQUESTED-ADDRESS-FAMILY may not be combined with
/// RESERVATION-TOKEN.
async fn allocate<T>(req: Request<'_, '_, T>) -> Result<(), Error>
where
    T: ServiceHandler,
{
    let credentials = match req.authenticate().await {
        Ok(it) => it,
        Err(e) => return reject(req, e, None),
    };

    let key = Some(&credentials.key);
    let table = &req.service.table;
    if let Some(allocation) = table.get(&req.five_tuple) {
        return match allocation.cached_response(req.payload.transaction_id()) {
            Some(bytes) => req.send_bytes(&bytes),
            None => reject(req, AllocationError::AlreadyExists.into(), key),
        };
    }

    match req.payload.get::<RequestedTransport>() {
        Some(RequestedTransport::Udp) => (),
        Some(_) => return reject(req, ErrorType::UnsupportedTransportAddress.into(), key),
        None if req.payload.contains(AttributeType::RequestedTransport) => {
            return reject(req, ErrorType::UnsupportedTransportAddress.into(), key);
        }
        None => return reject(req, ErrorType::BadRequest.into(), key),
    }

    let request = RelayRequest {
        family: req.payload.get::<RequestedAddressFamily>(),
        even_port: req.payload.get::<EvenPort>(),
        reservation: req.payload.get::<ReservationToken>(),
    };

    if request.reservation.is_some() && (request.even_port.is_some() || request.family.is_some()) {
        return reject(req, ErrorType::BadRequest.into(), key);
    }

    if request.family.is_none() && req.payload.contains(AttributeType::RequestedAddressFamily) {
        return reject(req, AllocationError::AddressFamilyNotSupported.into(), key);
    }

    let lifetime = clamp_lifetime(req.payload.get::<Lifetime>());
    let created = table.get_or_create(req.five_tuple, || {
        let endpoint = table.allocator().allocate(&request)?;
        Ok(Allocation::new(
            req.five_tuple,
            endpoint,
            req.connection.clone(),
            credentials.username.clone(),
            lifetime,
        ))
    });

    let allocation = match created {
        Ok(it) => it,
        // lost a race against a retransmission of the same request.
        Err(AllocationError::AlreadyExists) => {
            let cached = table
                .get(&req.five_tuple)
                .and_then(|it| it.cached_response(req.payload.transaction_id()));

            return match cached {
                Some(bytes) => req.send_bytes(&bytes),
                None => reject(req, AllocationError::AlreadyExists.into(), key),
            };
        }
        Err(e) => return reject(req, e.into(), key),
    };

    req.service
        .handler
        .on_allocated(&req.five_tuple, &credentials.username, allocation.relayed());

    {
        let mut message = MessageEncoder::extend(ALLOCATE_RESPONSE, req.payload, req.encode_buffer);
        message.append::<XorRelayedAddress>(allocation.relayed());
        message.append::<XorMappedAddress>(req.five_tuple.client);
        message.append::<Lifetime>(lifetime.as_secs() as u32);

        if let Some(token) = allocation.reservation() {
            message.append::<ReservationToken>(token);
        }

        message.append::<Software>(&req.service.software);
        message.flush(key)?;
    }

    allocation.cache_response(
        *req.payload.transaction_id(),
        Bytes::copy_from_slice(&req.encode_buffer[..]),
    );

    req.send()
}

/// [rfc8656](https://tools.ietf.org/html/rfc8656#section-7.3)
///
/// If the request contains a LIFETIME attribute and the attribute value is
/// zero, the request succeeds and the allocation is deleted. Otherwise the
/// allocation's time-to-expiry is set to the desired lifetime and the
/// success response carries it in a LIFETIME attribute.
///
/// A retransmitted Refresh with a zero lifetime causes a 437 (Allocation
/// Mismatch) response once the allocation is gone, clients treat that as
/// success.
async fn refresh<T>(req: Request<'_, '_, T>) -> Result<(), Error>
where
    T: ServiceHandler,
{
    let credentials = match req.authenticate().await {
        Ok(it) => it,
        Err(e) => return reject(req, e, None),
    };

    let key = Some(&credentials.key);
    let allocation = match req.allocation(&credentials) {
        Ok(it) => it,
        Err(e) => return reject(req, e, key),
    };

    if let Some(family) = req.payload.get::<RequestedAddressFamily>() {
        if family != IpFamily::of(&allocation.relayed().ip()) {
            return reject(req, ErrorType::PeerAddressFamilyMismatch.into(), key);
        }
    }

    let lifetime = match req
        .service
        .table
        .refresh(&req.five_tuple, req.payload.get::<Lifetime>())
    {
        Ok(it) => it,
        Err(e) => return reject(req, e.into(), key),
    };

    req.service
        .handler
        .on_refresh(&req.five_tuple, &credentials.username, lifetime);

    {
        let mut message = MessageEncoder::extend(REFRESH_RESPONSE, req.payload, req.encode_buffer);
        message.append::<Lifetime>(lifetime);
        message.append::<Software>(&req.service.software);
        message.flush(key)?;
    }

    req.send()
}

/// [rfc8656](https://tools.ietf.org/html/rfc8656#section-9.2)
///
/// The CreatePermission request MUST contain at least one XOR-PEER-ADDRESS
/// attribute and MAY contain multiple such attributes. If an
/// XOR-PEER-ADDRESS attribute contains an address of an address family that
/// is not the same as that of the relayed transport address, the server
/// responds with 443 (Peer Address Family Mismatch).
///
/// The port portion of each attribute is ignored. Retransmitted requests
/// simply refresh the permissions.
async fn create_permission<T>(req: Request<'_, '_, T>) -> Result<(), Error>
where
    T: ServiceHandler,
{
    let credentials = match req.authenticate().await {
        Ok(it) => it,
        Err(e) => return reject(req, e, None),
    };

    let key = Some(&credentials.key);
    let allocation = match req.allocation(&credentials) {
        Ok(it) => it,
        Err(e) => return reject(req, e, key),
    };

    // every XOR-PEER-ADDRESS has to decode, not just some of them.
    let peers = match req
        .payload
        .get_all::<XorPeerAddress>()
        .map(|it| it.map(|addr| addr.ip()))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(it) if !it.is_empty() => it,
        _ => return reject(req, ErrorType::BadRequest.into(), key),
    };

    let family = IpFamily::of(&allocation.relayed().ip());
    if peers.iter().any(|it| IpFamily::of(it) != family) {
        return reject(req, ErrorType::PeerAddressFamilyMismatch.into(), key);
    }

    for peer in &peers {
        allocation.create_permission(*peer);
    }

    req.service
        .handler
        .on_create_permission(&req.five_tuple, &credentials.username, &peers);

    {
        let mut message = MessageEncoder::extend(CREATE_PERMISSION_RESPONSE, req.payload, req.encode_buffer);
        message.append::<Software>(&req.service.software);
        message.flush(key)?;
    }

    req.send()
}

/// [rfc8656](https://tools.ietf.org/html/rfc8656#section-11.2)
///
/// The request must carry a CHANNEL-NUMBER in 0x4000 through 0x7FFF and an
/// XOR-PEER-ADDRESS of the relayed address family. The channel number may
/// not be bound to another peer and the peer may not be bound to another
/// channel, either is a 400 (Bad Request).
///
/// A successful request creates or refreshes the channel binding and
/// installs or refreshes a permission for the peer's IP address.
async fn channel_bind<T>(req: Request<'_, '_, T>) -> Result<(), Error>
where
    T: ServiceHandler,
{
    let credentials = match req.authenticate().await {
        Ok(it) => it,
        Err(e) => return reject(req, e, None),
    };

    let key = Some(&credentials.key);
    let allocation = match req.allocation(&credentials) {
        Ok(it) => it,
        Err(e) => return reject(req, e, key),
    };

    let (Some(number), Some(peer)) = (
        req.payload.get::<ChannelNumber>(),
        req.payload.get::<XorPeerAddress>(),
    ) else {
        return reject(req, ErrorType::BadRequest.into(), key);
    };

    if !CHANNEL_RANGE.contains(&number) {
        return reject(req, ErrorType::BadRequest.into(), key);
    }

    if IpFamily::of(&peer.ip()) != IpFamily::of(&allocation.relayed().ip()) {
        return reject(req, ErrorType::PeerAddressFamilyMismatch.into(), key);
    }

    if let Err(e) = allocation.bind_channel(number, peer, req.service.channel_binding_lifetime) {
        return reject(req, e, key);
    }

    req.service
        .handler
        .on_channel_bind(&req.five_tuple, &credentials.username, number, peer);

    {
        let mut message = MessageEncoder::extend(CHANNEL_BIND_RESPONSE, req.payload, req.encode_buffer);
        message.append::<Software>(&req.service.software);
        message.flush(key)?;
    }

    req.send()
}

/// [rfc8656](https://tools.ietf.org/html/rfc8656#section-10.2)
///
/// A Send indication is relayed to the peer in its XOR-PEER-ADDRESS when a
/// permission for that address exists, otherwise it is silently discarded.
/// Indications are never answered.
fn indication<T>(req: Request<'_, '_, T>) -> Result<(), Error>
where
    T: ServiceHandler,
{
    if !req.payload.unknown_attributes().is_empty() {
        return Ok(());
    }

    let (Some(peer), Some(data)) = (
        req.payload.get::<XorPeerAddress>(),
        req.payload.get::<Data>(),
    ) else {
        return Ok(());
    };

    let Some(allocation) = req.service.table.get(&req.five_tuple) else {
        return Ok(());
    };

    if !allocation.send_to_peer(peer, data)? {
        log::debug!(
            "drop send indication without permission: client={}, peer={}",
            req.five_tuple.client,
            peer
        );
    }

    Ok(())
}

pub(crate) fn channel_data<T>(
    service: &Service<T>,
    five_tuple: &FiveTuple,
    channel: ChannelData<'_>,
) -> Result<(), Error>
where
    T: ServiceHandler,
{
    let Some(allocation) = service.table.get(five_tuple) else {
        return Ok(());
    };

    if !allocation.send_channel_data(channel.number(), channel.as_bytes())? {
        log::debug!(
            "drop channel data without binding: client={}, channel={}",
            five_tuple.client,
            channel.number()
        );
    }

    Ok(())
}
