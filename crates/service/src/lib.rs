pub mod allocation;
pub mod auth;
pub mod routing;

use self::{
    allocation::{AllocationError, AllocationTable, FiveTuple, ports::RelayAllocator},
    auth::{AuthError, Authenticator},
    routing::Router,
};

use std::{
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use codec::message::attributes::error::ErrorType;

/// The transport a client reaches the server over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    /// Stream transports pad ChannelData frames to a multiple of four bytes.
    pub fn is_stream(self) -> bool {
        self == Self::Tcp
    }
}

/// The path back to a client.
///
/// For UDP this is the listening socket itself, for TCP it is the writer side
/// of the accepted stream. Writes must not block the caller.
pub trait Connection: Send + Sync {
    fn send(&self, bytes: &[u8], target: SocketAddr) -> io::Result<()>;
}

pub trait ServiceHandler: Send + Sync + 'static {
    /// Look up the password of a user in the given realm.
    ///
    /// The long-term key is derived from the returned password, returning
    /// `None` rejects the request with 401 (Unauthenticated).
    fn get_password(
        &self,
        username: &str,
        realm: &str,
    ) -> impl Future<Output = Option<String>> + Send;

    /// allocate request
    ///
    /// Called once the allocation is installed in the table, before the
    /// success response is written back to the client.
    #[allow(unused_variables)]
    fn on_allocated(&self, five_tuple: &FiveTuple, username: &str, relayed: SocketAddr) {}

    /// create permission request
    ///
    /// The port portion of each XOR-PEER-ADDRESS is ignored, only the peer
    /// addresses are reported.
    #[allow(unused_variables)]
    fn on_create_permission(&self, five_tuple: &FiveTuple, username: &str, peers: &[IpAddr]) {}

    /// channel binding request
    ///
    /// Retransmitted ChannelBind requests simply refresh the channel binding
    /// and the corresponding permission, so this may fire more than once for
    /// the same channel.
    #[allow(unused_variables)]
    fn on_channel_bind(&self, five_tuple: &FiveTuple, username: &str, channel: u16, peer: SocketAddr) {}

    /// refresh request
    ///
    /// `lifetime` is the granted lifetime in seconds, zero means the client
    /// released the allocation.
    #[allow(unused_variables)]
    fn on_refresh(&self, five_tuple: &FiveTuple, username: &str, lifetime: u32) {}

    /// allocation destroy
    ///
    /// Triggered exactly once per allocation when it leaves the table.
    /// Possible reasons: the allocation expired, the client released it, the
    /// stream carrying it was closed or its relay socket failed.
    #[allow(unused_variables)]
    fn on_destroy(&self, five_tuple: &FiveTuple, username: &str) {}
}

#[derive(Debug)]
pub enum Error {
    Decode(codec::Error),
    Auth(AuthError),
    Allocation(AllocationError),
    BindingConflict,
    Request(ErrorType),
    Transport(io::Error),
}

impl Error {
    /// The protocol error a failed request is answered with.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Decode(_) | Self::BindingConflict => ErrorType::BadRequest,
            Self::Auth(AuthError::BadRequest) => ErrorType::BadRequest,
            Self::Auth(AuthError::StaleNonce) => ErrorType::StaleNonce,
            Self::Auth(_) => ErrorType::Unauthorized,
            Self::Allocation(error) => match error {
                AllocationError::AlreadyExists | AllocationError::NotFound => {
                    ErrorType::AllocationMismatch
                }
                AllocationError::QuotaReached => ErrorType::AllocationQuotaReached,
                AllocationError::AddressFamilyNotSupported => ErrorType::AddressFamilyNotSupported,
                AllocationError::InsufficientCapacity | AllocationError::InvalidReservation => {
                    ErrorType::InsufficientCapacity
                }
            },
            Self::Request(kind) => *kind,
            Self::Transport(_) => ErrorType::ServerError,
        }
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Decode(error) => write!(f, "decode: {}", error),
            Self::Auth(error) => write!(f, "auth: {:?}", error),
            Self::Allocation(error) => write!(f, "allocation: {}", error),
            Self::BindingConflict => write!(f, "channel binding conflict"),
            Self::Request(kind) => write!(f, "request: {}", <&'static str>::from(*kind)),
            Self::Transport(error) => write!(f, "transport: {}", error),
        }
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Decode(value)
    }
}

impl From<AuthError> for Error {
    fn from(value: AuthError) -> Self {
        Self::Auth(value)
    }
}

impl From<AllocationError> for Error {
    fn from(value: AllocationError) -> Self {
        Self::Allocation(value)
    }
}

impl From<ErrorType> for Error {
    fn from(value: ErrorType) -> Self {
        Self::Request(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Transport(value)
    }
}

pub struct ServiceOptions<T> {
    pub realm: String,
    pub software: String,
    /// Maximum number of concurrent allocations, 0 disables the quota.
    pub max_allocations: usize,
    pub channel_binding_lifetime: Duration,
    pub nonce_lifetime: Duration,
    pub allocator: Box<dyn RelayAllocator>,
    pub handler: T,
}

/// Turn service.
#[derive(Clone)]
pub struct Service<T>
where
    T: ServiceHandler,
{
    table: Arc<AllocationTable<T>>,
    authenticator: Arc<Authenticator>,
    channel_binding_lifetime: Duration,
    software: String,
    handler: T,
}

impl<T> Service<T>
where
    T: ServiceHandler + Clone,
{
    /// Create turn service.
    pub fn new(options: ServiceOptions<T>) -> Self {
        Self {
            table: Arc::new(AllocationTable::new(
                options.allocator,
                options.max_allocations,
                options.handler.clone(),
            )),
            authenticator: Arc::new(Authenticator::new(options.realm, options.nonce_lifetime)),
            channel_binding_lifetime: options.channel_binding_lifetime,
            software: options.software,
            handler: options.handler,
        }
    }

    /// Create a router for one client-facing path.
    ///
    /// `interface` is the local address the listener is bound on, it becomes
    /// the server half of every five-tuple the router sees.
    pub fn make_router(
        &self,
        interface: SocketAddr,
        protocol: Transport,
        connection: Arc<dyn Connection>,
    ) -> Router<T> {
        Router::new(self.clone(), interface, protocol, connection)
    }

    pub fn table(&self) -> &Arc<AllocationTable<T>> {
        &self.table
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// The periodic sweep, it stops once the service is dropped.
    pub fn sweeper(&self, period: Duration) -> impl Future<Output = ()> + Send + 'static {
        AllocationTable::run_sweeper(Arc::downgrade(&self.table), period)
    }
}
