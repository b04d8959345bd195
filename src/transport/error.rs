use thiserror::Error;

/// Socket-level failures. These never take the process down; the connection
/// that hit one is stopped and resynchronised on next contact.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listening socket could not be bound.
    #[error("cannot bind datagram socket on {addr}: {detail}")]
    Bind { addr: String, detail: String },

    /// A datagram write failed with a hard error.
    #[error("cannot send datagram to {peer}: {detail}")]
    Send { peer: String, detail: String },

    /// The receive side of the socket failed.
    #[error("cannot receive datagram: {detail}")]
    Recv { detail: String },

    /// A peer's hostname did not resolve to a usable address.
    #[error("cannot resolve {endpoint}: {detail}")]
    Resolve { endpoint: String, detail: String },
}
