use super::AllocationError;

use std::{
    net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket},
    ops::RangeInclusive,
    str::FromStr,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use codec::message::attributes::address::IpFamily;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How long the port held back by EVEN-PORT with the R bit waits for the
/// Allocate request carrying its token.
pub const RESERVATION_LIFETIME: Duration = Duration::from_secs(30);

/// Ports that failed to bind are skipped, give up after this many.
const BIND_ATTEMPTS: usize = 16;

/// An inclusive range of relay ports, written as `"start..end"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn size(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 49152,
            end: 65535,
        }
    }
}

impl TryFrom<RangeInclusive<u16>> for PortRange {
    type Error = PortRangeParseError;

    fn try_from(range: RangeInclusive<u16>) -> Result<Self, Self::Error> {
        let (start, end) = range.into_inner();
        if start > end {
            return Err(PortRangeParseError(format!("{}..{}", start, end)));
        }

        Ok(Self { start, end })
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug)]
pub struct PortRangeParseError(String);

impl std::error::Error for PortRangeParseError {}

impl std::fmt::Display for PortRangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid port range: {}", self.0)
    }
}

impl From<std::num::ParseIntError> for PortRangeParseError {
    fn from(error: std::num::ParseIntError) -> Self {
        PortRangeParseError(error.to_string())
    }
}

/// # Test
///
/// ```
/// use turn_relay_service::allocation::ports::PortRange;
///
/// let range: PortRange = "50000..50009".parse().unwrap();
/// assert_eq!(range.size(), 10);
/// assert_eq!(range.to_string(), "50000..50009");
///
/// assert!("50009..50000".parse::<PortRange>().is_err());
/// assert!("50000".parse::<PortRange>().is_err());
/// ```
impl FromStr for PortRange {
    type Err = PortRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once("..")
            .ok_or_else(|| PortRangeParseError(s.to_string()))?;

        Self::try_from(start.trim().parse()?..=end.trim().parse()?)
    }
}

#[cfg(feature = "serde")]
impl Serialize for PortRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(|e| serde::de::Error::custom(e.0))
    }
}

/// Random Port
///
/// Relayed transport addresses should be hard to guess, so ports are probed
/// from a random starting point. Each port of the range is one bit of the
/// bitmap, bits past the end of the range are kept set so they are never
/// handed out.
///
/// # Test
///
/// ```
/// use std::collections::HashSet;
/// use turn_relay_service::allocation::ports::*;
///
/// let range: PortRange = "50000..50099".parse().unwrap();
/// let mut pool = PortAllocator::new(range);
/// let mut ports = HashSet::new();
///
/// while let Some(port) = pool.alloc(None) {
///     assert!(range.contains(port));
///     ports.insert(port);
/// }
///
/// assert_eq!(ports.len(), 100);
/// assert_eq!(pool.len(), 100);
///
/// pool.restore(50042);
/// assert_eq!(pool.alloc(None), Some(50042));
/// ```
pub struct PortAllocator {
    range: PortRange,
    buckets: Vec<u64>,
    allocated: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        let capacity = range.size();
        let mut buckets = vec![0u64; capacity.div_ceil(64)];

        let tail = capacity % 64;
        if tail > 0 {
            if let Some(last) = buckets.last_mut() {
                *last = u64::MAX << tail;
            }
        }

        Self {
            allocated: 0,
            buckets,
            range,
        }
    }

    pub fn capacity(&self) -> usize {
        self.range.size()
    }

    pub fn len(&self) -> usize {
        self.allocated
    }

    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.offset(port).map(|it| self.get(it)).unwrap_or(false)
    }

    /// Take a free port, probing from `start` (an offset into the range) or
    /// from a random point.
    pub fn alloc(&mut self, start: Option<usize>) -> Option<u16> {
        let capacity = self.capacity();
        if self.allocated >= capacity {
            return None;
        }

        let mut offset = start.unwrap_or_else(|| rand::rng().random_range(0..capacity)) % capacity;

        // a free bit exists, so one lap plus the partial first bucket finds it.
        let mut scanned = 0;
        while scanned <= capacity + 64 {
            let bucket = offset / 64;
            let free = !self.buckets[bucket] & (u64::MAX << (offset % 64));
            if free != 0 {
                let found = bucket * 64 + free.trailing_zeros() as usize;
                self.set(found, true);
                return Some(self.range.start + found as u16);
            }

            let next = (bucket + 1) * 64;
            scanned += next - offset;
            offset = if next >= capacity { 0 } else { next };
        }

        None
    }

    /// Take a free even port, with `reserve_next` the port above it is taken
    /// too so it can be handed out later with a reservation token.
    pub fn alloc_even(&mut self, reserve_next: bool) -> Option<u16> {
        let capacity = self.capacity();
        let start = rand::rng().random_range(0..capacity);

        for index in 0..capacity {
            let offset = (start + index) % capacity;
            if (self.range.start as usize + offset) % 2 != 0 || self.get(offset) {
                continue;
            }

            if reserve_next {
                if offset + 1 >= capacity || self.get(offset + 1) {
                    continue;
                }

                self.set(offset + 1, true);
            }

            self.set(offset, true);
            return Some(self.range.start + offset as u16);
        }

        None
    }

    /// Give a port back, ports outside the range or not taken are ignored.
    pub fn restore(&mut self, port: u16) {
        if let Some(offset) = self.offset(port) {
            if self.get(offset) {
                self.set(offset, false);
            }
        }
    }

    fn offset(&self, port: u16) -> Option<usize> {
        self.range
            .contains(port)
            .then(|| (port - self.range.start) as usize)
    }

    fn get(&self, offset: usize) -> bool {
        self.buckets[offset / 64] & (1 << (offset % 64)) != 0
    }

    fn set(&mut self, offset: usize, value: bool) {
        let mask = 1u64 << (offset % 64);
        let bucket = &mut self.buckets[offset / 64];
        if value {
            *bucket |= mask;
            self.allocated += 1;
        } else {
            *bucket &= !mask;
            self.allocated -= 1;
        }
    }
}

/// What an Allocate request asks of its relayed transport address.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayRequest {
    pub family: Option<IpFamily>,
    /// EVEN-PORT, the value is its R bit.
    pub even_port: Option<bool>,
    pub reservation: Option<u64>,
}

pub struct RelayEndpoint {
    pub socket: UdpSocket,
    pub relayed: SocketAddr,
    /// Token of the port reserved next to this one.
    pub reservation: Option<u64>,
}

/// Source of relay sockets.
pub trait RelayAllocator: Send + Sync {
    fn allocate(&self, request: &RelayRequest) -> Result<RelayEndpoint, AllocationError>;

    fn release(&self, relayed: &SocketAddr);

    /// Drop reservations nobody claimed in time.
    #[allow(unused_variables)]
    fn sweep(&self, now: Instant) {}
}

struct Reservation {
    port: u16,
    expires: Instant,
}

struct Pool {
    ports: PortAllocator,
    reservations: HashMap<u64, Reservation>,
}

/// Relay sockets bound on one address, ports taken from a [`PortRange`].
pub struct PortRangeAllocator {
    listen: IpAddr,
    external: IpAddr,
    pool: Mutex<Pool>,
}

impl PortRangeAllocator {
    /// `listen` is the address relay sockets bind on, `external` is the one
    /// advertised to clients.
    pub fn new(range: PortRange, listen: IpAddr, external: IpAddr) -> Self {
        Self {
            pool: Mutex::new(Pool {
                ports: PortAllocator::new(range),
                reservations: HashMap::new(),
            }),
            external,
            listen,
        }
    }

    fn bind(&self, port: u16) -> std::io::Result<UdpSocket> {
        let socket = StdUdpSocket::bind(SocketAddr::new(self.listen, port))?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket)
    }

    fn endpoint(&self, socket: UdpSocket, port: u16, reservation: Option<u64>) -> RelayEndpoint {
        RelayEndpoint {
            relayed: SocketAddr::new(self.external, port),
            reservation,
            socket,
        }
    }

    fn take_reserved(&self, token: u64) -> Result<RelayEndpoint, AllocationError> {
        let port = {
            let mut pool = self.pool.lock();
            match pool.reservations.remove(&token) {
                Some(it) if it.expires > Instant::now() => it.port,
                Some(it) => {
                    pool.ports.restore(it.port);
                    return Err(AllocationError::InvalidReservation);
                }
                None => return Err(AllocationError::InvalidReservation),
            }
        };

        match self.bind(port) {
            Ok(socket) => Ok(self.endpoint(socket, port, None)),
            Err(e) => {
                log::warn!("relay bind failed: port={}, err={}", port, e);

                self.pool.lock().ports.restore(port);
                Err(AllocationError::InsufficientCapacity)
            }
        }
    }
}

impl RelayAllocator for PortRangeAllocator {
    fn allocate(&self, request: &RelayRequest) -> Result<RelayEndpoint, AllocationError> {
        if let Some(family) = request.family {
            if family != IpFamily::of(&self.external) {
                return Err(AllocationError::AddressFamilyNotSupported);
            }
        }

        if let Some(token) = request.reservation {
            return self.take_reserved(token);
        }

        let reserve_next = request.even_port == Some(true);
        for _ in 0..BIND_ATTEMPTS {
            let port = {
                let mut pool = self.pool.lock();
                match request.even_port {
                    Some(_) => pool.ports.alloc_even(reserve_next),
                    None => pool.ports.alloc(None),
                }
            }
            .ok_or(AllocationError::InsufficientCapacity)?;

            let socket = match self.bind(port) {
                Ok(it) => it,
                Err(e) => {
                    log::debug!("relay bind failed: port={}, err={}", port, e);

                    let mut pool = self.pool.lock();
                    pool.ports.restore(port);
                    if reserve_next {
                        pool.ports.restore(port + 1);
                    }

                    continue;
                }
            };

            let reservation = reserve_next.then(|| {
                let token = rand::random::<u64>();
                self.pool.lock().reservations.insert(
                    token,
                    Reservation {
                        expires: Instant::now() + RESERVATION_LIFETIME,
                        port: port + 1,
                    },
                );

                token
            });

            return Ok(self.endpoint(socket, port, reservation));
        }

        Err(AllocationError::InsufficientCapacity)
    }

    fn release(&self, relayed: &SocketAddr) {
        self.pool.lock().ports.restore(relayed.port());
    }

    fn sweep(&self, now: Instant) {
        let mut pool = self.pool.lock();
        let Pool {
            ports,
            reservations,
        } = &mut *pool;

        reservations.retain(|_, it| {
            if it.expires > now {
                return true;
            }

            ports.restore(it.port);
            false
        });
    }
}
