//! Tunnel core.
//!
//! Matches end-user requests arriving at the public edges with reverse
//! streams opened by authenticated clients. The [`manager::ConnManager`]
//! holds the rendezvous state, [`service::Service`] drives the protocol and
//! the byte pipes.

pub mod conn;
pub mod manager;
pub mod meta;
pub mod pipe;
pub mod service;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use conn::ServerConn;
pub use manager::{ConnManager, ConnRequest, ControlChannel};
pub use meta::ClientConnMeta;
pub use service::{Service, TcpEndpointAllocator, HANDSHAKE_TIMEOUT};

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// The key was never registered: nothing to wait for.
    #[error("keyID not found")]
    KeyIdNotFound,

    /// The tunnel exists but no reverse stream could be bound.
    #[error("failed to connect")]
    FailedToConnect,

    /// Normal end of a pipe; never surfaced to end users.
    #[error("connection closed")]
    ConnClosed,

    #[error("endpoint error: {0}")]
    Endpoint(String),

    #[error(transparent)]
    Auth(#[from] outpost_auth::AuthError),

    #[error(transparent)]
    Proto(#[from] outpost_proto::FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Any duplex byte stream usable as a reverse stream.
pub trait RevStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RevStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Reverse streams cross the manager as trait objects: a V1 connection and a
/// V2 mux stream are interchangeable past the handshake.
pub type BoxedStream = Box<dyn RevStream>;
