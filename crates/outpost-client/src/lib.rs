//! Tunnel client runtime.
//!
//! Dials the server's reverse-dial port, authenticates with a tunnel token
//! and then accepts reverse streams, bridging each one to the local service.

pub mod client;
pub mod tls;

pub use client::{ClientConfig, ClientError, TunnelClient};
