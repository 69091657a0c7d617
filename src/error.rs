use crate::conn_id::ConnectionId;
use std::io;
use thiserror::Error;

/// TunnelError is the error taxonomy shared by both roles
#[derive(Error, Debug)]
pub enum TunnelError {
    /// dial/accept/read/write failures not caused by an intentional shutdown
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// failure reported by the SOCKS5 driver
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// malformed or incomplete settings, surfaced at startup only
    #[error("configuration error: {0}")]
    Config(String),
}

/// AuthError covers the shared-secret handshake failure modes
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("authentication timed out")]
    Timeout,

    #[error("shared secret mismatch")]
    SecretMismatch,

    #[error("transport error during authentication: {0}")]
    Transport(#[from] io::Error),
}

/// RegistryError covers connection registry and binding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection id {0} already registered")]
    DuplicateId(ConnectionId),

    #[error("connection id {0} not found")]
    NotFound(ConnectionId),

    #[error("connection {0} is already bound to a raw socket")]
    AlreadyBound(ConnectionId),

    /// the driver did not take the previous payload in time
    #[error("connection {0} is not accepting input")]
    Busy(ConnectionId),
}

/// Result alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// is_peer_closed reports whether an I/O error only means the peer went away.
/// Such errors end a connection cleanly and are not worth more than a debug line.
pub fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
