use std::io;

/// Why a session was marked for destruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CloseReason {
    /// The connection was reset by either side.
    #[error("connection reset")]
    ConnectionReset,
    /// The handshake did not complete in time.
    #[error("connection timed out")]
    ConnectionTimeout,
    /// A packet exhausted its retransmission budget.
    #[error("acknowledgement timed out")]
    AckTimeout,
    /// The session was torn down without a closing handshake.
    #[error("session state cleared")]
    StateCleared,
    /// The listening backlog was full.
    #[error("too many pending connections")]
    TooManyConnections,
    /// The backend failed while the session was transmitting.
    #[error("internal error")]
    InternalError,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend reported an I/O error.
    #[error("backend i/o error: {0}")]
    Io(#[from] io::Error),
    /// `connect` exhausted its SYN retries.
    #[error("connection timed out")]
    ConnectionTimeout,
    /// The peer refused the connection.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// The session has not completed its handshake.
    #[error("session is not connected")]
    NotConnected,
    /// A reset has been sent or received; the session is draining.
    #[error("session is closing")]
    Closing,
    /// The session was marked for destruction.
    #[error("session closed: {0}")]
    Closed(CloseReason),
    /// No inbound connection completed within the allotted time.
    #[error("no inbound connection before timeout")]
    ListenTimeout,
    /// A buffer for an outgoing or incoming payload could not be allocated.
    #[error("out of memory")]
    OutOfMemory,
    /// The owning context has been shut down.
    #[error("context shut down")]
    ContextShutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
