//! Server-side control connection.
//!
//! Wraps the post-handshake control channel of a registered client: writes
//! (pings, events, bind instructions) go through a shared writer, while a
//! background task drains client frames and turns anything unexpected, or
//! transport EOF, into session death via the cancellation token.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use outpost_auth::TokenKind;
use outpost_proto::frame;
use outpost_proto::{Command, ProtocolVariant, EVENT_URL_UPDATED};

use crate::manager::ControlChannel;
use crate::CoreError;

type ControlWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub struct ServerConn {
    id: Uuid,
    key_id: String,
    kind: TokenKind,
    variant: ProtocolVariant,
    cancel: CancellationToken,
    writer: ControlWriter,
}

impl ServerConn {
    /// Take over a registered control channel. Its lifetime token is a child
    /// of `parent`, so server shutdown cascades into every session.
    pub fn new<S>(
        parent: &CancellationToken,
        io: S,
        key_id: String,
        kind: TokenKind,
        variant: ProtocolVariant,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let cancel = parent.child_token();
        let (reader, writer) = tokio::io::split(io);

        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            key_id,
            kind,
            variant,
            cancel: cancel.clone(),
            writer: Arc::new(Mutex::new(Box::new(writer))),
        });

        tokio::spawn(read_control(reader, cancel, conn.key_id.clone()));

        conn
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    /// Push the public endpoint to the client. Sent before the connection is
    /// registered with the manager, so the URL always precedes traffic.
    pub async fn send_url_updated(&self, endpoint: &str) -> Result<(), CoreError> {
        let mut writer = self.writer.lock().await;
        frame::write_event(&mut *writer, EVENT_URL_UPDATED, &endpoint).await?;

        Ok(())
    }

    /// Keepalive probe; a failed write means the session is dead.
    pub async fn ping(&self) -> Result<(), CoreError> {
        let mut writer = self.writer.lock().await;
        frame::write_ping(&mut *writer).await?;

        Ok(())
    }
}

#[async_trait]
impl ControlChannel for ServerConn {
    fn id(&self) -> Uuid {
        self.id
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn request_stream(&self, request: Uuid) -> Result<(), CoreError> {
        let mut writer = self.writer.lock().await;
        frame::write_bind(&mut *writer, request).await?;

        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Drain frames the client sends on the control channel.
///
/// Only `Pong` is expected here. EOF, a read error or a protocol violation
/// all end the session: the ping loop observes the cancelled token.
async fn read_control<R>(mut reader: R, cancel: CancellationToken, key_id: String)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let cmd = tokio::select! {
            res = frame::expect_command(&mut reader) => res,
            _ = cancel.cancelled() => break,
        };

        match cmd {
            Ok(Command::Pong) => {}
            Ok(cmd) => {
                warn!(key_id = %key_id, command = ?cmd, "unexpected command on control channel");
                break;
            }
            Err(e) => {
                debug!(key_id = %key_id, error = %e, "control channel read ended");
                break;
            }
        }
    }

    cancel.cancel();
}
