//! Public-facing edges.
//!
//! Thin adapters turning external traffic into calls on the tunnel core: the
//! HTTP edge maps wildcard subdomains to key IDs, the TCP edge maps
//! dynamically allocated ports to key IDs.

pub mod http;
pub mod tcp;

use thiserror::Error;

pub use http::{HttpEdge, HttpEdgeConfig};
pub use tcp::{TcpEdge, TcpEdgeConfig};

/// Edge errors
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("edge is not wired to a service")]
    ServiceNotAttached,

    #[error("no free port in range {0}-{1}")]
    PortsExhausted(u16, u16),
}
