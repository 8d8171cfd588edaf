pub mod ports;
pub mod table;

pub use self::table::AllocationTable;

use self::ports::RelayEndpoint;
use crate::{Connection, Error, ServiceHandler, Transport};

use std::{
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use bytes::{Bytes, BytesMut};
use codec::{
    channel_data::ChannelData,
    message::{
        MessageEncoder,
        attributes::{Data, XorPeerAddress},
        methods::DATA_INDICATION,
    },
};
use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::Notify};

pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);
pub const MAX_LIFETIME: Duration = Duration::from_secs(3600);
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);
pub const DEFAULT_CHANNEL_BINDING_LIFETIME: Duration = Duration::from_secs(600);
pub const MAX_CHANNEL_BINDING_LIFETIME: Duration = Duration::from_secs(3600);

/// Largest datagram a relay socket reads from a peer.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// The granted lifetime for a requested LIFETIME, in `[DEFAULT_LIFETIME,
/// MAX_LIFETIME]`.
///
/// # Test
///
/// ```
/// use std::time::Duration;
/// use turn_relay_service::allocation::*;
///
/// assert_eq!(clamp_lifetime(None), DEFAULT_LIFETIME);
/// assert_eq!(clamp_lifetime(Some(30)), DEFAULT_LIFETIME);
/// assert_eq!(clamp_lifetime(Some(1200)), Duration::from_secs(1200));
/// assert_eq!(clamp_lifetime(Some(86400)), MAX_LIFETIME);
/// ```
pub fn clamp_lifetime(requested: Option<u32>) -> Duration {
    requested
        .map(|it| Duration::from_secs(it as u64).clamp(DEFAULT_LIFETIME, MAX_LIFETIME))
        .unwrap_or(DEFAULT_LIFETIME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    AlreadyExists,
    NotFound,
    QuotaReached,
    InsufficientCapacity,
    AddressFamilyNotSupported,
    InvalidReservation,
}

impl std::error::Error for AllocationError {}

impl std::fmt::Display for AllocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The key of an allocation: the client's transport address, the server
/// address it reached and the transport protocol between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub protocol: Transport,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    peer: SocketAddr,
    expires: Instant,
}

struct State {
    expires: Instant,
    permissions: HashMap<IpAddr, Instant>,
    channels: HashMap<u16, Binding>,
    peers: HashMap<SocketAddr, u16>,
    response: Option<([u8; 12], Bytes)>,
}

impl State {
    fn is_permitted(&self, ip: &IpAddr, now: Instant) -> bool {
        self.permissions
            .get(ip)
            .map(|expires| *expires > now)
            .unwrap_or(false)
    }

    fn channel_of(&self, peer: &SocketAddr, now: Instant) -> Option<u16> {
        let number = self.peers.get(peer)?;
        self.channels
            .get(number)
            .filter(|it| it.expires > now)
            .map(|_| *number)
    }

    fn channel_peer(&self, number: u16, now: Instant) -> Option<SocketAddr> {
        self.channels
            .get(&number)
            .filter(|it| it.expires > now)
            .map(|it| it.peer)
    }
}

/// A relayed transport address leased to one client.
///
/// Permissions and channel bindings live behind one guard so the two maps
/// of a channel binding always agree. Expired entries are treated as absent
/// by every lookup and pruned by the sweep.
pub struct Allocation {
    five_tuple: FiveTuple,
    relayed: SocketAddr,
    reservation: Option<u64>,
    username: String,
    socket: UdpSocket,
    connection: Arc<dyn Connection>,
    state: Mutex<State>,
    closed: AtomicBool,
    notify: Notify,
}

impl Allocation {
    pub fn new(
        five_tuple: FiveTuple,
        endpoint: RelayEndpoint,
        connection: Arc<dyn Connection>,
        username: String,
        lifetime: Duration,
    ) -> Self {
        Self {
            relayed: endpoint.relayed,
            reservation: endpoint.reservation,
            socket: endpoint.socket,
            state: Mutex::new(State {
                expires: Instant::now() + lifetime,
                permissions: HashMap::new(),
                channels: HashMap::new(),
                peers: HashMap::new(),
                response: None,
            }),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            five_tuple,
            connection,
            username,
        }
    }

    pub fn five_tuple(&self) -> &FiveTuple {
        &self.five_tuple
    }

    pub fn relayed(&self) -> SocketAddr {
        self.relayed
    }

    pub fn reservation(&self) -> Option<u64> {
        self.reservation
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn expires(&self) -> Instant {
        self.state.lock().expires
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.state.lock().expires <= now
    }

    /// Push the expiry out to `lifetime` from now, fails once the
    /// allocation has been closed or its lifetime has run out.
    pub fn refresh(&self, lifetime: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        if self.is_closed() || state.expires <= now {
            return false;
        }

        state.expires = now + lifetime;
        true
    }

    /// Remember the success response of the Allocate transaction that
    /// created this allocation.
    pub fn cache_response(&self, transaction_id: [u8; 12], bytes: Bytes) {
        self.state.lock().response = Some((transaction_id, bytes));
    }

    /// The cached Allocate success response, if `transaction_id` is the
    /// transaction that created this allocation.
    pub fn cached_response(&self, transaction_id: &[u8; 12]) -> Option<Bytes> {
        self.state
            .lock()
            .response
            .as_ref()
            .filter(|(id, _)| id == transaction_id)
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn create_permission(&self, ip: IpAddr) {
        self.state
            .lock()
            .permissions
            .insert(ip, Instant::now() + PERMISSION_LIFETIME);
    }

    pub fn has_permission(&self, ip: &IpAddr) -> bool {
        self.state.lock().is_permitted(ip, Instant::now())
    }

    /// Install or refresh a channel binding together with the permission
    /// for the peer's address.
    ///
    /// The binding between channel numbers and peers stays one-to-one: a
    /// live binding of the number to another peer, or of the peer to another
    /// number, is a conflict and nothing is changed.
    pub fn bind_channel(&self, number: u16, peer: SocketAddr, lifetime: Duration) -> Result<(), Error> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(bound) = state.channel_peer(number, now) {
            if bound != peer {
                return Err(Error::BindingConflict);
            }
        }

        if let Some(bound) = state.channel_of(&peer, now) {
            if bound != number {
                return Err(Error::BindingConflict);
            }
        }

        // stale entries of either side may still be around.
        if let Some(old) = state.channels.remove(&number) {
            state.peers.remove(&old.peer);
        }

        if let Some(old) = state.peers.remove(&peer) {
            state.channels.remove(&old);
        }

        state.channels.insert(
            number,
            Binding {
                expires: now + lifetime,
                peer,
            },
        );

        state.peers.insert(peer, number);
        state
            .permissions
            .insert(peer.ip(), now + PERMISSION_LIFETIME);

        Ok(())
    }

    pub fn channel_peer(&self, number: u16) -> Option<SocketAddr> {
        self.state.lock().channel_peer(number, Instant::now())
    }

    pub fn channel_of(&self, peer: &SocketAddr) -> Option<u16> {
        self.state.lock().channel_of(peer, Instant::now())
    }

    /// Relay the payload of a Send indication.
    ///
    /// Returns `false` when there is no permission for the peer, the payload
    /// is dropped then. A successful send refreshes the permission.
    pub fn send_to_peer(&self, peer: SocketAddr, data: &[u8]) -> std::io::Result<bool> {
        {
            let now = Instant::now();
            let mut state = self.state.lock();
            if !state.is_permitted(&peer.ip(), now) {
                return Ok(false);
            }

            state
                .permissions
                .insert(peer.ip(), now + PERMISSION_LIFETIME);
        }

        self.socket.try_send_to(data, peer)?;
        Ok(true)
    }

    /// Relay the payload of a ChannelData message to the peer bound to the
    /// channel, nothing is refreshed.
    pub fn send_channel_data(&self, number: u16, data: &[u8]) -> std::io::Result<bool> {
        let peer = {
            let now = Instant::now();
            let state = self.state.lock();
            match state.channel_peer(number, now) {
                Some(peer) if state.is_permitted(&peer.ip(), now) => peer,
                _ => return Ok(false),
            }
        };

        self.socket.try_send_to(data, peer)?;
        Ok(true)
    }

    /// Drop expired permissions and channel bindings.
    pub fn sweep(&self, now: Instant) {
        let mut state = self.state.lock();
        state.permissions.retain(|_, expires| *expires > now);

        let State { channels, peers, .. } = &mut *state;
        channels.retain(|_, binding| {
            if binding.expires > now {
                return true;
            }

            peers.remove(&binding.peer);
            false
        });
    }

    /// Stop the relay loop, idempotent.
    pub fn close(&self) {
        let _state = self.state.lock();
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// Close the allocation if it expired by `now`, atomically with respect
    /// to [`Allocation::refresh`].
    pub(crate) fn close_if_expired(&self, now: Instant) -> bool {
        let state = self.state.lock();
        if state.expires > now {
            return false;
        }

        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }

        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Forward datagrams from peers to the client until the allocation is
    /// closed, expires or its socket fails. Leaving the loop takes the
    /// allocation out of the table.
    pub(crate) async fn relay<T>(self: Arc<Self>, table: Weak<AllocationTable<T>>)
    where
        T: ServiceHandler,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut bytes = BytesMut::with_capacity(4096);

        loop {
            let (size, peer) = tokio::select! {
                _ = self.notify.notified() => break,
                ret = self.socket.recv_from(&mut buf) => match ret {
                    Ok(it) => it,
                    Err(e) if is_peer_unreachable(&e) => continue,
                    Err(e) => {
                        log::error!(
                            "relay socket failed: relayed={}, err={}",
                            self.relayed,
                            e
                        );

                        break;
                    }
                },
            };

            if self.is_closed() || self.is_expired(Instant::now()) {
                break;
            }

            self.forward(peer, &buf[..size], &mut bytes);
        }

        if let Some(table) = table.upgrade() {
            table.remove(&self);
        }
    }

    fn forward(&self, peer: SocketAddr, data: &[u8], bytes: &mut BytesMut) {
        let channel = {
            let now = Instant::now();
            let state = self.state.lock();
            if !state.is_permitted(&peer.ip(), now) {
                log::debug!(
                    "drop peer datagram without permission: relayed={}, peer={}",
                    self.relayed,
                    peer
                );

                return;
            }

            state.channel_of(&peer, now)
        };

        if let Some(number) = channel {
            ChannelData {
                bytes: data,
                number,
            }
            .encode(bytes, self.five_tuple.protocol.is_stream());
        } else {
            let transaction_id = rand::random::<[u8; 12]>();
            let mut message = MessageEncoder::new(DATA_INDICATION, &transaction_id, bytes);
            message.append::<XorPeerAddress>(peer);
            message.append::<Data>(data);

            if let Err(e) = message.flush(None) {
                log::warn!("failed to encode data indication: err={}", e);
                return;
            }
        }

        if let Err(e) = self.connection.send(bytes, self.five_tuple.client) {
            log::warn!(
                "failed to relay to client: client={}, err={}",
                self.five_tuple.client,
                e
            );
        }
    }
}

/// An ICMP unreachable of one peer surfaces as a receive error on some
/// platforms, the socket itself is still fine.
fn is_peer_unreachable(error: &std::io::Error) -> bool {
    error.kind() == ErrorKind::ConnectionReset
}

#[cfg(test)]
mod tests {
    use super::{ports::RelayEndpoint, *};

    use std::io;

    struct Discard;

    impl Connection for Discard {
        fn send(&self, _: &[u8], _: SocketAddr) -> io::Result<()> {
            Ok(())
        }
    }

    async fn allocation() -> Allocation {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relayed = socket.local_addr().unwrap();

        Allocation::new(
            FiveTuple {
                client: "127.0.0.1:50000".parse().unwrap(),
                server: "127.0.0.1:3478".parse().unwrap(),
                protocol: Transport::Udp,
            },
            RelayEndpoint {
                reservation: None,
                relayed,
                socket,
            },
            Arc::new(Discard),
            "user1".to_string(),
            DEFAULT_LIFETIME,
        )
    }

    #[tokio::test]
    async fn channel_bindings_stay_one_to_one() {
        let allocation = allocation().await;
        let a: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        allocation.bind_channel(0x4000, a, DEFAULT_CHANNEL_BINDING_LIFETIME).unwrap();
        assert!(allocation.has_permission(&a.ip()));

        // refreshing the same pair is fine.
        allocation.bind_channel(0x4000, a, DEFAULT_CHANNEL_BINDING_LIFETIME).unwrap();

        assert!(matches!(
            allocation.bind_channel(0x4000, b, DEFAULT_CHANNEL_BINDING_LIFETIME),
            Err(Error::BindingConflict)
        ));

        assert!(matches!(
            allocation.bind_channel(0x4001, a, DEFAULT_CHANNEL_BINDING_LIFETIME),
            Err(Error::BindingConflict)
        ));

        assert_eq!(allocation.channel_peer(0x4000), Some(a));
        assert_eq!(allocation.channel_of(&a), Some(0x4000));
        assert_eq!(allocation.channel_peer(0x4001), None);
        assert_eq!(allocation.channel_of(&b), None);
    }

    #[tokio::test]
    async fn expired_bindings_are_absent() {
        let allocation = allocation().await;
        let a: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        allocation.bind_channel(0x4000, a, Duration::ZERO).unwrap();
        assert_eq!(allocation.channel_peer(0x4000), None);

        // both the number and the peer can be bound again.
        allocation.bind_channel(0x4000, b, DEFAULT_CHANNEL_BINDING_LIFETIME).unwrap();
        allocation.bind_channel(0x4001, a, DEFAULT_CHANNEL_BINDING_LIFETIME).unwrap();

        assert_eq!(allocation.channel_peer(0x4000), Some(b));
        assert_eq!(allocation.channel_peer(0x4001), Some(a));
        assert_eq!(allocation.channel_of(&a), Some(0x4001));
    }

    #[tokio::test]
    async fn sweep_prunes_permissions_and_bindings() {
        let allocation = allocation().await;
        let a: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let c: IpAddr = "127.0.0.3".parse().unwrap();

        allocation.create_permission(c);
        allocation.bind_channel(0x4000, a, DEFAULT_CHANNEL_BINDING_LIFETIME).unwrap();

        allocation.sweep(Instant::now() + PERMISSION_LIFETIME + Duration::from_secs(1));
        assert!(!allocation.has_permission(&c));
        assert!(!allocation.has_permission(&a.ip()));
        assert_eq!(allocation.channel_peer(0x4000), Some(a));

        allocation.sweep(Instant::now() + DEFAULT_CHANNEL_BINDING_LIFETIME + Duration::from_secs(1));
        assert_eq!(allocation.channel_peer(0x4000), None);
        assert_eq!(allocation.channel_of(&a), None);
    }

    #[tokio::test]
    async fn data_without_permission_is_dropped() {
        let allocation = allocation().await;
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        assert!(!allocation.send_to_peer(peer, b"hello").unwrap());
        assert!(!allocation.send_channel_data(0x4000, b"hello").unwrap());
    }

    #[tokio::test]
    async fn closed_allocation_cannot_be_refreshed() {
        let allocation = allocation().await;
        assert!(allocation.refresh(MAX_LIFETIME));
        assert!(!allocation.close_if_expired(Instant::now()));

        allocation.close();
        allocation.close();
        assert!(allocation.is_closed());
        assert!(!allocation.refresh(MAX_LIFETIME));
    }

    #[test]
    fn unreachable_peers_keep_the_relay_running() {
        assert!(is_peer_unreachable(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_peer_unreachable(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }

    #[tokio::test]
    async fn expired_allocation_cannot_be_refreshed() {
        let allocation = allocation().await;
        assert!(allocation.refresh(Duration::ZERO));
        assert!(allocation.is_expired(Instant::now()));
        assert!(!allocation.refresh(MAX_LIFETIME));
        assert!(allocation.close_if_expired(Instant::now()));
    }
}
