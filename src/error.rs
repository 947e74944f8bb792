/// Error kinds surfaced by the ATP stack.
///
/// API operations report these synchronously; failures inside dispatched
/// callbacks are logged and retried on the next timer tick instead of being
/// surfaced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unsupported address family, only IPv4 is handled.
    AfNoSupport,
    /// Unsupported socket type or protocol number.
    ProtoNoSupport,
    /// The context-wide socket cap has been reached.
    MaxSockets,
    /// No configured STUN server answered.
    NatQueryFailure,
    /// The NAT assigns reflexive endpoints per destination; traversal is
    /// not attempted behind such a NAT.
    NatDependent,
    /// The event core rejected a registration or was handed a dead
    /// identifier.
    EventCore,
    /// The signalling channel failed.
    SignallingProvider,
    /// Duplicate or invalid demultiplexer registration.
    Demux,
    /// Unknown socket handle.
    BadFd,
    /// A state precondition was violated.
    AlreadySet,
    /// Listen was called before Bind.
    NotBound,
    /// Parameter out of range.
    Inval,
    /// The non-blocking operation would have blocked.
    WouldBlock,
    Unknown,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AfNoSupport => "address family not supported",
            Self::ProtoNoSupport => "protocol not supported",
            Self::MaxSockets => "too many sockets",
            Self::NatQueryFailure => "no stun server answered",
            Self::NatDependent => "endpoint-dependent nat",
            Self::EventCore => "event core rejected the operation",
            Self::SignallingProvider => "signalling provider failure",
            Self::Demux => "demultiplexer registration failure",
            Self::BadFd => "unknown socket handle",
            Self::AlreadySet => "state precondition violated",
            Self::NotBound => "socket is not bound",
            Self::Inval => "invalid argument",
            Self::WouldBlock => "operation would block",
            Self::Unknown => "unknown error",
        })
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::WouldBlock => Self::WouldBlock,
            _ => Self::Unknown,
        }
    }
}
