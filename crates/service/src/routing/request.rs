use crate::{
    Connection, Error, Service, ServiceHandler,
    allocation::{Allocation, AllocationError, FiveTuple},
    auth::Credentials,
};

use std::sync::Arc;

use bytes::BytesMut;
use codec::message::{
    Message, MessageEncoder,
    attributes::{ErrorCode, Nonce, Realm, Software, UnknownAttributes, error::ErrorType},
};

pub(crate) struct Request<'a, 'b, T>
where
    T: ServiceHandler,
{
    pub five_tuple: FiveTuple,
    pub service: &'a Service<T>,
    pub connection: &'a Arc<dyn Connection>,
    pub encode_buffer: &'b mut BytesMut,
    pub payload: &'a Message<'a>,
}

impl<'a, 'b, T> Request<'a, 'b, T>
where
    T: ServiceHandler,
{
    /// Write the encode buffer back to the client.
    pub fn send(&self) -> Result<(), Error> {
        self.send_bytes(&self.encode_buffer[..])
    }

    pub fn send_bytes(&self, bytes: &[u8]) -> Result<(), Error> {
        Ok(self.connection.send(bytes, self.five_tuple.client)?)
    }

    pub async fn authenticate(&self) -> Result<Credentials, Error> {
        Ok(self
            .service
            .authenticator
            .authenticate(self.payload, &self.service.handler)
            .await?)
    }

    /// The allocation of this five-tuple, it must belong to the user the
    /// request authenticated as.
    pub fn allocation(&self, credentials: &Credentials) -> Result<Arc<Allocation>, Error> {
        let allocation = self
            .service
            .table
            .get(&self.five_tuple)
            .ok_or(AllocationError::NotFound)?;

        if allocation.username() != credentials.username {
            return Err(ErrorType::WrongCredentials.into());
        }

        Ok(allocation)
    }
}

/// Answer a request with the error response for `error`, then hand the
/// error back to the caller.
///
/// Challenges carry the realm and a fresh nonce, 420 carries the unknown
/// attributes. Responses to authenticated requests are signed with the
/// request's key. Failures to reach the client are not answered.
pub(crate) fn reject<T>(req: Request<'_, '_, T>, error: Error, key: Option<&[u8; 16]>) -> Result<(), Error>
where
    T: ServiceHandler,
{
    if let Error::Transport(_) = error {
        return Err(error);
    }

    let Some(method) = req.payload.method().error() else {
        return Err(error);
    };

    let kind = error.error_type();
    let nonce = match kind {
        ErrorType::Unauthorized | ErrorType::StaleNonce => Some(req.service.authenticator.issue()?),
        _ => None,
    };

    {
        let mut message = MessageEncoder::extend(method, req.payload, req.encode_buffer);
        message.append::<ErrorCode>(ErrorCode::from(kind));

        if let Some(nonce) = &nonce {
            message.append::<Realm>(req.service.authenticator.realm());
            message.append::<Nonce>(nonce);
        }

        if kind == ErrorType::UnknownAttribute {
            message.append::<UnknownAttributes>(req.payload.unknown_attributes());
        }

        message.append::<Software>(&req.service.software);
        message.flush(key)?;
    }

    req.send()?;
    Err(error)
}
