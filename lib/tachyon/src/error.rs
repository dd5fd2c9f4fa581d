use std::cell::RefCell;
use std::io;
use std::net;

pub type NetResult<T> = Result<T, Error>;

/// Error taxonomy of the runtime. Worker threads never let these escape: failures are recorded on
/// the socket or instance that owns the failing operation and the worker returns to its loop.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    // Protocol
    TcpReceiveBufferTooSmall,
    TcpPostfixNotFound,
    UdpDecryptFailed,
    UnexpectedHandshakePacket,

    // Resource
    MemoryLimitExceeded,
    AllocationFailed,
    IntegerOverflow,

    // Network
    ConnectRefused,
    ConnectTimeout,
    SendTimeout,
    Aborted,
    Closed,

    // Usage
    InvalidClientId,
    InvalidOperationId,
    ModeNotLoaded,
    WouldTruncate,
    ShortRead,
    NotMeaningful,
    AddrParse,

    // Fatal
    PollFailed,
    Io(io::ErrorKind),
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error.kind())
    }
}

impl From<net::AddrParseError> for Error {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        Error::AddrParse
    }
}

/// Outcome of a send call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendStatus {
    /// All bytes were handed to the kernel synchronously.
    Completed,
    /// The send was queued; a worker will complete it.
    InProgress,
    /// The send failed; the socket may still be usable.
    Failed,
    /// The send failed or timed out in a way that requires disconnecting the entity.
    FailedKill,
}

/// Connection state of an instance or of a single client record within a server.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
    StillConnecting,
    /// Connected, awaiting the UDP authentication datagram.
    ConnectedAc,
    NoSend,
    NoRecv,
    NoSendRecv,
    Disconnecting,
    Refused,
    TimedOut,
    ConnectionError,
}

impl ConnectionStatus {
    /// True for every state in which the TCP stream may still carry outbound data.
    #[inline]
    pub fn is_send_possible(self) -> bool {
        match self {
            ConnectionStatus::Connected | ConnectionStatus::ConnectedAc | ConnectionStatus::NoRecv => true,
            _ => false,
        }
    }

    /// True for every state in which the TCP stream may still deliver inbound data.
    #[inline]
    pub fn is_recv_possible(self) -> bool {
        match self {
            ConnectionStatus::Connected | ConnectionStatus::ConnectedAc | ConnectionStatus::NoSend => true,
            _ => false,
        }
    }
}

/// Role of an instance.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InstanceState {
    Client,
    Server,
    Broadcast,
    /// Per-connection record inside a server, reusing the client code path where useful.
    ServerClient,
    Inactive,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = RefCell::new(None);
}

/// Records the most recent failure for retrieval by the embedding facade.
pub fn set_last_error(error: &Error) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(error.clone()));
}

/// Retrieves the most recent failure recorded on this thread.
pub fn last_error() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Clears and returns the most recent failure recorded on this thread.
pub fn take_last_error() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err, Error::Io(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_half_shutdown_states() {
        assert!(ConnectionStatus::NoRecv.is_send_possible());
        assert!(!ConnectionStatus::NoRecv.is_recv_possible());
        assert!(ConnectionStatus::NoSend.is_recv_possible());
        assert!(!ConnectionStatus::NoSend.is_send_possible());
        assert!(!ConnectionStatus::NoSendRecv.is_send_possible());
        assert!(!ConnectionStatus::NoSendRecv.is_recv_possible());
    }

    #[test]
    fn test_last_error_roundtrip() {
        set_last_error(&Error::SendTimeout);
        assert_eq!(last_error(), Some(Error::SendTimeout));
        assert_eq!(take_last_error(), Some(Error::SendTimeout));
        assert_eq!(last_error(), None);
    }
}
