//! Reverse-dial wire protocol.
//!
//! Two variants share one frame vocabulary:
//!
//! - **V1 (framed):** every message is `version | command | payload` on a
//!   dedicated TCP connection. A client session ends up either `Registered`
//!   (it accepts reverse streams) or `Bound` (the connection itself becomes
//!   one reverse stream).
//! - **V2 (multiplexed):** after authentication the byte stream becomes a
//!   multiplexing session; the first client-opened stream replays `Register`
//!   and acts as the control channel, every later stream starts with the same
//!   `Bind` preamble V1 uses on a fresh connection.

pub mod frame;
pub mod handshake;
pub mod mux;

pub use frame::{Command, Event, FrameError, RespStatus, VERSION_MUX, VERSION_V1};
pub use handshake::{
    client_auth, client_bind, client_register, read_bind_preamble, server_handshake,
    ProtocolVariant, ServerHandshake,
};
pub use mux::{MuxError, MuxHandle, MuxSession, MuxStream};

/// Event name announcing the public endpoint allocated for a tunnel.
pub const EVENT_URL_UPDATED: &str = "urlToConnectUpdated";
