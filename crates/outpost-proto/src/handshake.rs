//! Handshake state machines for both ends of a reverse-dial connection.
//!
//! Server side:
//!
//! ```text
//!           Auth OK
//! Fresh ───────────────► Authenticated
//!                          │ Register          │ Bind(id)
//!                          ▼                   ▼
//!                       Registered           Bound
//! ```
//!
//! After authentication the server sniffs one byte: a V1 version byte means a
//! plain framed command follows; a mux version byte means the connection has
//! become a multiplexed session whose first stream replays `Register`.
//! Any other command in `Authenticated` is terminal.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use uuid::Uuid;

use outpost_auth::TokenKind;

use crate::frame::{self, Command, FrameError, RespStatus};
use crate::mux::{MuxSession, MuxStream};

/// Which protocol variant a registered session ended up speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    V1,
    V2,
}

impl std::fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVariant::V1 => write!(f, "V1"),
            ProtocolVariant::V2 => write!(f, "V2"),
        }
    }
}

/// Terminal state of a successful server-side handshake.
pub enum ServerHandshake<S> {
    /// V1 control connection: the transport stays framed.
    RegisteredV1 {
        key_id: String,
        kind: TokenKind,
        io: S,
    },
    /// V2 control connection: `control` is the first (client-opened) stream,
    /// `session` accepts the reverse streams.
    RegisteredV2 {
        key_id: String,
        kind: TokenKind,
        control: MuxStream,
        session: MuxSession,
    },
    /// The connection arrived to satisfy a pending request; the transport
    /// itself is the reverse stream.
    Bound {
        id: Uuid,
        key_id: String,
        kind: TokenKind,
        io: S,
    },
}

impl<S> std::fmt::Debug for ServerHandshake<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerHandshake::RegisteredV1 { key_id, kind, .. } => f
                .debug_struct("RegisteredV1")
                .field("key_id", key_id)
                .field("kind", kind)
                .finish(),
            ServerHandshake::RegisteredV2 { key_id, kind, .. } => f
                .debug_struct("RegisteredV2")
                .field("key_id", key_id)
                .field("kind", kind)
                .finish(),
            ServerHandshake::Bound { id, key_id, kind, .. } => f
                .debug_struct("Bound")
                .field("id", id)
                .field("key_id", key_id)
                .field("kind", kind)
                .finish(),
        }
    }
}

/// Run the server side of the handshake.
///
/// `verify` receives the presented `(user, pass)` pair and returns the base
/// key ID and token kind on success, `None` for bad credentials. All `Resp`
/// frames, including rejections, are written here; callers only bound the
/// whole exchange with a timeout.
pub async fn server_handshake<S, F, Fut>(
    mut io: S,
    verify: F,
) -> Result<ServerHandshake<S>, FrameError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: FnOnce(String, String) -> Fut,
    Fut: Future<Output = Option<(String, TokenKind)>>,
{
    match frame::expect_command(&mut io).await? {
        Command::Auth => {}
        cmd => {
            let _ = frame::write_resp(&mut io, RespStatus::ProtocolError).await;
            return Err(FrameError::UnexpectedCommand(cmd));
        }
    }

    let (user, pass) = frame::read_auth(&mut io).await?;

    let Some((key_id, kind)) = verify(user, pass).await else {
        let _ = frame::write_resp(&mut io, RespStatus::AuthFailed).await;
        return Err(FrameError::Rejected(RespStatus::AuthFailed));
    };

    frame::write_resp(&mut io, RespStatus::Success).await?;

    match frame::read_command(&mut io).await? {
        Some(Command::Register) => {
            frame::write_resp(&mut io, RespStatus::Success).await?;

            Ok(ServerHandshake::RegisteredV1 { key_id, kind, io })
        }
        Some(Command::Bind) => {
            let id = frame::read_bind(&mut io).await?;
            frame::write_resp(&mut io, RespStatus::Success).await?;

            Ok(ServerHandshake::Bound { id, key_id, kind, io })
        }
        Some(cmd) => {
            let _ = frame::write_resp(&mut io, RespStatus::ProtocolError).await;
            Err(FrameError::UnexpectedCommand(cmd))
        }
        None => {
            debug!(key_id = %key_id, "connection upgraded to mux session");

            let mut session = MuxSession::server(io);
            let mut control = session.accept().await.ok_or_else(|| {
                FrameError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "mux session ended before the control stream opened",
                ))
            })?;

            match frame::expect_command(&mut control).await? {
                Command::Register => {}
                cmd => {
                    let _ = frame::write_resp(&mut control, RespStatus::ProtocolError).await;
                    session.close();
                    return Err(FrameError::UnexpectedCommand(cmd));
                }
            }

            frame::write_resp(&mut control, RespStatus::Success).await?;

            Ok(ServerHandshake::RegisteredV2 { key_id, kind, control, session })
        }
    }
}

/// Read the `Bind` preamble a reverse stream opens with and acknowledge it.
///
/// Shared between the V1 dial-back path (where `server_handshake` consumes
/// it) and the per-stream V2 path; callers wrap it in their own deadline.
pub async fn read_bind_preamble<S>(io: &mut S) -> Result<Uuid, FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match frame::expect_command(io).await? {
        Command::Bind => {
            let id = frame::read_bind(io).await?;
            frame::write_resp(io, RespStatus::Success).await?;

            Ok(id)
        }
        cmd => {
            let _ = frame::write_resp(io, RespStatus::ProtocolError).await;
            Err(FrameError::UnexpectedCommand(cmd))
        }
    }
}

/// Authenticate as a client. A rejection surfaces as
/// `FrameError::Rejected(AuthFailed)` so callers can tell bad credentials
/// apart from transport trouble.
pub async fn client_auth<S>(io: &mut S, user: &str, pass: &str) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    frame::write_auth(io, user, pass).await?;
    frame::expect_success(io).await
}

/// Declare this connection a control channel accepting reverse streams.
pub async fn client_register<S>(io: &mut S) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    frame::write_register(io).await?;
    frame::expect_success(io).await
}

/// Bind this transport (or stream) to a pending request.
pub async fn client_bind<S>(io: &mut S, id: Uuid) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    frame::write_bind(io, id).await?;
    frame::expect_success(io).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn verify_demo(user: String, pass: String) -> Option<(String, TokenKind)> {
        (user == "demo-w" && pass == "secret").then(|| ("demo".to_string(), TokenKind::Web))
    }

    #[tokio::test]
    async fn v1_register_flow() {
        let (mut client, server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(server_handshake(server, verify_demo));

        client_auth(&mut client, "demo-w", "secret").await.unwrap();
        client_register(&mut client).await.unwrap();

        match server_task.await.unwrap().unwrap() {
            ServerHandshake::RegisteredV1 { key_id, kind, .. } => {
                assert_eq!(key_id, "demo");
                assert_eq!(kind, TokenKind::Web);
            }
            _ => panic!("expected a V1 registered session"),
        }
    }

    #[tokio::test]
    async fn v1_bind_flow() {
        let (mut client, server) = tokio::io::duplex(4096);
        let id = Uuid::new_v4();

        let server_task = tokio::spawn(server_handshake(server, verify_demo));

        client_auth(&mut client, "demo-w", "secret").await.unwrap();
        client_bind(&mut client, id).await.unwrap();

        match server_task.await.unwrap().unwrap() {
            ServerHandshake::Bound { id: bound, key_id, .. } => {
                assert_eq!(bound, id);
                assert_eq!(key_id, "demo");
            }
            _ => panic!("expected a bound connection"),
        }
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(server_handshake(server, verify_demo));

        let err = client_auth(&mut client, "demo-w", "wrong").await.unwrap_err();
        assert!(matches!(err, FrameError::Rejected(RespStatus::AuthFailed)));

        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn unexpected_command_after_auth_is_terminal() {
        let (mut client, server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(server_handshake(server, verify_demo));

        client_auth(&mut client, "demo-w", "secret").await.unwrap();
        frame::write_ping(&mut client).await.unwrap();

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedCommand(Command::Ping)));
    }

    #[tokio::test]
    async fn v2_upgrade_flow() {
        let (mut client, server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(server_handshake(server, verify_demo));

        client_auth(&mut client, "demo-w", "secret").await.unwrap();

        let session = MuxSession::client(client);
        let mut control = session.open_stream().await.unwrap();
        client_register(&mut control).await.unwrap();

        match server_task.await.unwrap().unwrap() {
            ServerHandshake::RegisteredV2 { key_id, kind, .. } => {
                assert_eq!(key_id, "demo");
                assert_eq!(kind, TokenKind::Web);
            }
            _ => panic!("expected a V2 registered session"),
        }
    }

    #[tokio::test]
    async fn bind_preamble_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let id = Uuid::new_v4();

        let server_task = tokio::spawn(async move { read_bind_preamble(&mut server).await });

        client_bind(&mut client, id).await.unwrap();
        assert_eq!(server_task.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn garbage_version_fails_handshake() {
        let (mut client, server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(server_handshake(server, verify_demo));

        client.write_all(&[0x42, 0x01]).await.unwrap();

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedVersion(0x42)));
    }
}
