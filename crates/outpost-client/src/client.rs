//! The client runtime loop.
//!
//! One outbound control connection carries pings, events and bind
//! instructions. Each bind instruction makes the client establish a reverse
//! stream (a second authenticated connection on V1, a fresh mux stream on
//! V2), which is then bridged to the local service.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use outpost_auth::Token;
use outpost_core::meta::read_meta;
use outpost_core::pipe::pipe_streams;
use outpost_core::{BoxedStream, RevStream};
use outpost_proto::frame;
use outpost_proto::{
    client_auth, client_bind, client_register, Command, FrameError, MuxHandle, MuxSession,
    RespStatus, EVENT_URL_UPDATED,
};

use crate::tls;

/// How long dialing the local service may take.
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad credentials. Not retried: a wrong token stays wrong.
    #[error("authentication rejected, check your token")]
    AuthRejected,

    #[error("invalid server address {0:?}: expected host:port")]
    InvalidServerAddr(String),

    #[error("protocol error: {0}")]
    Proto(#[from] FrameError),

    #[error("connection to server lost")]
    ConnectionLost,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reverse-dial address of the server, `host:port`.
    pub server_addr: String,
    /// Local service to expose, `host:port`.
    pub dest_addr: String,
    /// Disable TLS on the control connection.
    pub no_tls: bool,
    /// Skip certificate verification. Testing only.
    pub insecure: bool,
    /// Ask for the multiplexed protocol instead of per-request dials.
    pub enable_v2: bool,
}

type OnConnected = Box<dyn Fn(&str) + Send + Sync>;
type OnRequest = Box<dyn Fn(&str) + Send + Sync>;

struct Shared {
    cfg: ClientConfig,
    token: Token,
    on_connected: Option<OnConnected>,
    on_request: Option<OnRequest>,
}

/// The tunnel client.
pub struct TunnelClient {
    shared: Arc<Shared>,
}

impl TunnelClient {
    pub fn new(cfg: ClientConfig, token: Token) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                token,
                on_connected: None,
                on_request: None,
            }),
        }
    }

    /// Called with the public URL once the server announces it.
    pub fn with_on_connected<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Arc::get_mut(&mut self.shared)
            .expect("callbacks must be set before run")
            .on_connected = Some(Box::new(f));
        self
    }

    /// Called with the end-user IP for every incoming reverse stream.
    pub fn with_on_request<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Arc::get_mut(&mut self.shared)
            .expect("callbacks must be set before run")
            .on_request = Some(Box::new(f));
        self
    }

    /// Connect, authenticate, register and serve reverse streams until the
    /// context is cancelled or the control connection dies.
    pub async fn run(self, ctx: CancellationToken) -> Result<(), ClientError> {
        let shared = self.shared;

        debug!(
            server = %shared.cfg.server_addr,
            v2 = shared.cfg.enable_v2,
            no_tls = shared.cfg.no_tls,
            "connecting to server"
        );

        let mut control = dial_server(&shared.cfg).await?;
        authenticate(&mut control, &shared.token).await?;

        // Established reverse streams flow from the control loop to the
        // accept loop below.
        let (stream_tx, mut accepted) = mpsc::channel::<BoxedStream>(16);

        let control_done = CancellationToken::new();
        let tracker = TaskTracker::new();

        // Keeps the V2 session alive for the whole run; dropping it on exit
        // tears the transport tasks down.
        let mut v2_session = None;

        if shared.cfg.enable_v2 {
            let session = MuxSession::client(control);
            let mut control = session
                .open_stream()
                .await
                .map_err(|_| ClientError::ConnectionLost)?;
            client_register(&mut control).await?;
            info!(server = %shared.cfg.server_addr, "registered (V2)");

            let handle = session.handle();

            // The session dies with the run context.
            let guard_cancel = session.cancel_token();
            let guard_ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = guard_ctx.cancelled() => guard_cancel.cancel(),
                    _ = guard_cancel.cancelled() => {}
                }
            });

            v2_session = Some(session);

            tokio::spawn(control_loop(
                shared.clone(),
                control,
                BindTransport::Mux(handle),
                stream_tx,
                control_done.clone(),
                ctx.clone(),
            ));
        } else {
            client_register(&mut control).await?;
            info!(server = %shared.cfg.server_addr, "registered (V1)");

            tokio::spawn(control_loop(
                shared.clone(),
                control,
                BindTransport::Dial,
                stream_tx,
                control_done.clone(),
                ctx.clone(),
            ));
        }

        // Accept-style loop over the established reverse streams.
        loop {
            let stream = tokio::select! {
                stream = accepted.recv() => stream,
                _ = ctx.cancelled() => break,
            };

            let Some(stream) = stream else {
                // Control loop gone: report unless this is a clean shutdown.
                if ctx.is_cancelled() {
                    break;
                }
                drop(v2_session);
                tracker.close();
                tracker.wait().await;
                return Err(ClientError::ConnectionLost);
            };

            let shared = shared.clone();
            let ctx = ctx.clone();
            tracker.spawn(async move {
                handle_reverse_stream(shared, stream, ctx).await;
            });
        }

        drop(v2_session);
        control_done.cancel();
        tracker.close();
        tracker.wait().await;

        Ok(())
    }
}

/// How the client establishes a reverse stream when told to bind.
enum BindTransport {
    /// V1: dial a fresh connection and authenticate again.
    Dial,
    /// V2: open a stream on the existing session.
    Mux(MuxHandle),
}

async fn dial_server(cfg: &ClientConfig) -> Result<BoxedStream, ClientError> {
    let tcp = TcpStream::connect(&cfg.server_addr).await?;

    if cfg.no_tls {
        return Ok(Box::new(tcp));
    }

    let host = cfg
        .server_addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ClientError::InvalidServerAddr(cfg.server_addr.clone()))?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ClientError::InvalidServerAddr(cfg.server_addr.clone()))?;

    let connector = tls::connector(cfg.insecure);
    let stream = connector.connect(server_name, tcp).await?;

    Ok(Box::new(stream))
}

async fn authenticate(io: &mut BoxedStream, token: &Token) -> Result<(), ClientError> {
    match client_auth(io, &token.id_with_kind(), &token.secret).await {
        Ok(()) => Ok(()),
        Err(FrameError::Rejected(RespStatus::AuthFailed)) => Err(ClientError::AuthRejected),
        Err(e) => Err(e.into()),
    }
}

/// Consume the control channel: answer pings, surface events, and establish a
/// reverse stream for every bind instruction.
async fn control_loop(
    shared: Arc<Shared>,
    control: impl RevStream + 'static,
    bind: BindTransport,
    stream_tx: mpsc::Sender<BoxedStream>,
    done: CancellationToken,
    ctx: CancellationToken,
) {
    let (mut reader, writer) = tokio::io::split(control);
    let writer: Arc<tokio::sync::Mutex<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>> =
        Arc::new(tokio::sync::Mutex::new(Box::new(writer)));

    loop {
        let cmd = tokio::select! {
            res = frame::expect_command(&mut reader) => res,
            _ = ctx.cancelled() => break,
            _ = done.cancelled() => break,
        };

        match cmd {
            Ok(Command::Ping) => {
                let mut w = writer.lock().await;
                if let Err(e) = frame::write_pong(&mut *w).await {
                    debug!(error = %e, "failed to answer ping");
                    break;
                }
            }
            Ok(Command::Event) => {
                let event = match frame::read_event(&mut reader).await {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "failed to read event");
                        break;
                    }
                };
                handle_event(&shared, &event);
            }
            Ok(Command::Bind) => {
                let id = match frame::read_bind(&mut reader).await {
                    Ok(id) => id,
                    Err(e) => {
                        debug!(error = %e, "failed to read bind instruction");
                        break;
                    }
                };

                let shared = shared.clone();
                let stream_tx = stream_tx.clone();
                let bind = match &bind {
                    BindTransport::Dial => BindTransport::Dial,
                    BindTransport::Mux(handle) => BindTransport::Mux(handle.clone()),
                };
                tokio::spawn(async move {
                    match establish_reverse_stream(&shared, &bind, id).await {
                        Ok(stream) => {
                            let _ = stream_tx.send(stream).await;
                        }
                        Err(e) => warn!(request = %id, error = %e, "failed to bind reverse stream"),
                    }
                });
            }
            Ok(cmd) => {
                warn!(command = ?cmd, "unexpected command on control channel");
                break;
            }
            Err(e) => {
                debug!(error = %e, "control channel closed");
                break;
            }
        }
    }
    // Dropping stream_tx wakes the accept loop.
}

fn handle_event(shared: &Shared, event: &frame::Event) {
    if event.name != EVENT_URL_UPDATED {
        debug!(event = %event.name, "ignoring unknown event");
        return;
    }

    match event.parse_payload::<String>() {
        Ok(url) => match &shared.on_connected {
            Some(cb) => cb(&url),
            None => info!(url = %url, "tunnel is connected"),
        },
        Err(e) => error!(error = %e, "failed to parse urlToConnectUpdated payload"),
    }
}

async fn establish_reverse_stream(
    shared: &Shared,
    bind: &BindTransport,
    id: Uuid,
) -> Result<BoxedStream, ClientError> {
    match bind {
        BindTransport::Dial => {
            let mut conn = dial_server(&shared.cfg).await?;
            authenticate(&mut conn, &shared.token).await?;
            client_bind(&mut conn, id).await?;

            Ok(conn)
        }
        BindTransport::Mux(handle) => {
            let mut stream = handle
                .open_stream()
                .await
                .map_err(|_| ClientError::ConnectionLost)?;
            client_bind(&mut stream, id).await?;

            Ok(Box::new(stream))
        }
    }
}

/// Bridge one bound reverse stream to the local service.
async fn handle_reverse_stream(shared: Arc<Shared>, mut stream: BoxedStream, ctx: CancellationToken) {
    let meta = match read_meta(&mut stream).await {
        Ok(meta) => meta,
        Err(e) => {
            error!(error = %e, "failed to read connection metadata");
            return;
        }
    };

    match &shared.on_request {
        Some(cb) => cb(&meta.ip),
        None => info!(client_ip = %meta.ip, "new incoming connection"),
    }

    let mut local = match timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&shared.cfg.dest_addr))
        .await
    {
        Ok(Ok(local)) => local,
        Ok(Err(e)) => {
            error!(dest = %shared.cfg.dest_addr, error = %e, "failed to dial local service");
            return;
        }
        Err(_) => {
            error!(dest = %shared.cfg.dest_addr, "timed out dialing local service");
            return;
        }
    };

    if let Err(e) = pipe_streams(&ctx, &ctx, &mut local, &mut stream).await {
        debug!(error = %e, "reverse stream pipe ended");
    }

    let _ = local.shutdown().await;
    debug!(client_ip = %meta.ip, "closing connection");
}
