use num_enum::TryFromPrimitive;

/// Error codes used by the relay, along with their reason phrases.
///
/// The wire form carries the class (hundreds digit) and the number
/// (modulo 100) in separate fields, so `errno(437)` is `0x0425`.
///
/// 400 Bad Request: the request was malformed.
/// 401 Unauthorized: the request lacked valid credentials.
/// 403 Forbidden: the request was valid but may not be performed.
/// 420 Unknown Attribute: an unknown comprehension-required attribute was
///     present, the response lists it in UNKNOWN-ATTRIBUTES.
/// 437 Allocation Mismatch: the request conflicts with the allocation
///     state of the five-tuple.
/// 438 Stale Nonce: the NONCE is no longer valid, retry with the new one.
/// 440 Address Family not Supported.
/// 441 Wrong Credentials: the credentials differ from those that created
///     the allocation.
/// 442 Unsupported Transport Protocol.
/// 443 Peer Address Family Mismatch.
/// 486 Allocation Quota Reached.
/// 500 Server Error.
/// 508 Insufficient Capacity.
const fn errno(code: u16) -> u16 {
    ((code / 100) << 8) | (code % 100)
}

#[repr(u16)]
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash, TryFromPrimitive)]
pub enum ErrorType {
    BadRequest = errno(400),
    Unauthorized = errno(401),
    Forbidden = errno(403),
    UnknownAttribute = errno(420),
    AllocationMismatch = errno(437),
    StaleNonce = errno(438),
    AddressFamilyNotSupported = errno(440),
    WrongCredentials = errno(441),
    UnsupportedTransportAddress = errno(442),
    PeerAddressFamilyMismatch = errno(443),
    AllocationQuotaReached = errno(486),
    ServerError = errno(500),
    InsufficientCapacity = errno(508),
}

impl ErrorType {
    /// The decimal error code, such as `437`.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::attributes::error::ErrorType;
    ///
    /// assert_eq!(ErrorType::AllocationMismatch.code(), 437);
    /// assert_eq!(ErrorType::AllocationMismatch as u16, 0x0425);
    /// ```
    pub const fn code(self) -> u16 {
        let value = self as u16;
        (value >> 8) * 100 + (value & 0xFF)
    }
}

impl From<ErrorType> for &'static str {
    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::attributes::error::ErrorType;
    ///
    /// let err: &'static str = ErrorType::StaleNonce.into();
    /// assert_eq!(err, "Stale Nonce");
    /// ```
    #[rustfmt::skip]
    fn from(val: ErrorType) -> Self {
        match val {
            ErrorType::BadRequest => "Bad Request",
            ErrorType::Unauthorized => "Unauthorized",
            ErrorType::Forbidden => "Forbidden",
            ErrorType::UnknownAttribute => "Unknown Attribute",
            ErrorType::AllocationMismatch => "Allocation Mismatch",
            ErrorType::StaleNonce => "Stale Nonce",
            ErrorType::AddressFamilyNotSupported => "Address Family not Supported",
            ErrorType::WrongCredentials => "Wrong Credentials",
            ErrorType::UnsupportedTransportAddress => "Unsupported Transport Protocol",
            ErrorType::PeerAddressFamilyMismatch => "Peer Address Family Mismatch",
            ErrorType::AllocationQuotaReached => "Allocation Quota Reached",
            ErrorType::ServerError => "Server Error",
            ErrorType::InsufficientCapacity => "Insufficient Capacity",
        }
    }
}
