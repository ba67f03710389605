//! Core service: drives reverse connections through the handshake and pairs
//! end-user traffic with reverse streams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use outpost_auth::{AuthStore, TokenKind};
use outpost_proto::{
    read_bind_preamble, server_handshake, MuxSession, MuxStream, ProtocolVariant, ServerHandshake,
};

use crate::conn::ServerConn;
use crate::manager::{ConnManager, ControlChannel};
use crate::meta::{write_meta, ClientConnMeta};
use crate::pipe::{pipe_streams, Metered};
use crate::{BoxedStream, CoreError, RevStream};

/// Bound on the whole handshake, keeping slow peers from tying up accept
/// tasks.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the bind preamble of a freshly opened V2 stream.
const BIND_TIMEOUT: Duration = Duration::from_secs(10);

const PING_INTERVAL: Duration = Duration::from_millis(200);

/// Allocates public TCP endpoints for clients holding tcp tokens.
#[async_trait]
pub trait TcpEndpointAllocator: Send + Sync {
    /// Reserve a listener for `key_id` and return its `host:port`.
    async fn allocate(&self, key_id: &str) -> Result<String, CoreError>;

    /// Stop the listener and return the port to the pool. Idempotent.
    fn release(&self, key_id: &str);
}

/// Default allocator: rejects every tcp token so a server without a port
/// pool fails loudly instead of leaving clients waiting for an endpoint.
struct NoopTcpEndpointAllocator;

#[async_trait]
impl TcpEndpointAllocator for NoopTcpEndpointAllocator {
    async fn allocate(&self, key_id: &str) -> Result<String, CoreError> {
        Err(CoreError::Endpoint(format!(
            "TCP endpoint allocator is not configured (keyID={key_id})"
        )))
    }

    fn release(&self, _key_id: &str) {}
}

type EndpointGenerator = Box<dyn Fn(&str) -> Result<String, CoreError> + Send + Sync>;

/// The tunnel core. Wires the auth store, one connection manager per tunnel
/// kind and the public-endpoint providers.
pub struct Service {
    web_conns: Arc<ConnManager>,
    tcp_conns: Arc<ConnManager>,
    auth: Arc<dyn AuthStore>,
    endpoint_generator: EndpointGenerator,
    tcp_allocator: Arc<dyn TcpEndpointAllocator>,
}

impl Service {
    pub fn new(
        web_conns: Arc<ConnManager>,
        tcp_conns: Arc<ConnManager>,
        auth: Arc<dyn AuthStore>,
    ) -> Self {
        Self {
            web_conns,
            tcp_conns,
            auth,
            endpoint_generator: Box::new(|_| {
                Err(CoreError::Endpoint("endpoint generator is not set".into()))
            }),
            tcp_allocator: Arc::new(NoopTcpEndpointAllocator),
        }
    }

    /// Set the function mapping a key ID to its public URL.
    pub fn with_endpoint_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&str) -> Result<String, CoreError> + Send + Sync + 'static,
    {
        self.endpoint_generator = Box::new(generator);
        self
    }

    /// Set the allocator handing out public TCP endpoints.
    pub fn with_tcp_endpoint_allocator(mut self, allocator: Arc<dyn TcpEndpointAllocator>) -> Self {
        self.tcp_allocator = allocator;
        self
    }

    pub fn auth(&self) -> &Arc<dyn AuthStore> {
        &self.auth
    }

    pub async fn check_health(&self) -> Result<(), CoreError> {
        Ok(self.auth.check_health().await?)
    }

    fn manager_for(&self, kind: TokenKind) -> &Arc<ConnManager> {
        match kind {
            TokenKind::Web => &self.web_conns,
            TokenKind::Tcp => &self.tcp_conns,
        }
    }

    /// Entry point for a transport accepted on the reverse-dial listener.
    ///
    /// Handshake failures are logged and swallowed: a broken or hostile peer
    /// is routine, not an error of ours.
    pub async fn handle_reverse_conn<S>(
        &self,
        ctx: &CancellationToken,
        io: S,
    ) -> Result<(), CoreError>
    where
        S: RevStream + 'static,
    {
        debug!("new reverse connection");

        let auth = self.auth.clone();
        let verify = move |user: String, pass: String| async move {
            match auth.verify(&user, &pass).await {
                Ok(Some(token)) => Some((token.id, token.kind)),
                Ok(None) => None,
                Err(e) => {
                    error!(error = %e, "failed to verify credentials");
                    None
                }
            }
        };

        let handshake = tokio::select! {
            res = timeout(HANDSHAKE_TIMEOUT, server_handshake(io, verify)) => match res {
                Ok(Ok(handshake)) => handshake,
                Ok(Err(e)) => {
                    debug!(error = %e, "handshake failed");
                    return Ok(());
                }
                Err(_) => {
                    debug!("handshake timed out");
                    return Ok(());
                }
            },
            _ = ctx.cancelled() => return Ok(()),
        };

        match handshake {
            ServerHandshake::RegisteredV1 { key_id, kind, io } => {
                self.run_registered(ctx, key_id, kind, ControlIo::V1(Box::new(io)))
                    .await
            }
            ServerHandshake::RegisteredV2 { key_id, kind, control, session } => {
                self.run_registered(ctx, key_id, kind, ControlIo::V2 { control, session })
                    .await
            }
            ServerHandshake::Bound { id, key_id, kind, io } => {
                info!(key_id = %key_id, kind = kind.as_str(), "reverse stream bound");
                self.manager_for(kind).resolve_request(id, Box::new(io));

                Ok(())
            }
        }
    }

    /// Run a registered control connection until it dies: allocate the public
    /// endpoint, announce it, register with the manager and keep pinging.
    async fn run_registered(
        &self,
        ctx: &CancellationToken,
        key_id: String,
        kind: TokenKind,
        control: ControlIo,
    ) -> Result<(), CoreError> {
        let (conn, session) = match control {
            ControlIo::V1(io) => (
                ServerConn::new(ctx, io, key_id.clone(), kind, ProtocolVariant::V1),
                None,
            ),
            ControlIo::V2 { control, session } => (
                ServerConn::new(ctx, control, key_id.clone(), kind, ProtocolVariant::V2),
                Some(session),
            ),
        };

        let manager = self.manager_for(kind).clone();

        // The TCP endpoint is released on every exit path once allocated.
        let _release = match kind {
            TokenKind::Tcp => {
                let endpoint = self.tcp_allocator.allocate(&key_id).await?;
                let guard = ReleaseOnDrop {
                    allocator: self.tcp_allocator.clone(),
                    key_id: key_id.clone(),
                };
                conn.send_url_updated(&endpoint).await?;
                Some(guard)
            }
            TokenKind::Web => {
                let endpoint = (self.endpoint_generator)(&key_id)?;
                conn.send_url_updated(&endpoint).await?;
                None
            }
        };

        manager.add_connection(&key_id, conn.clone()).await;

        info!(
            key_id = %key_id,
            kind = kind.as_str(),
            protocol = %conn.variant(),
            "control connection established"
        );

        if let Some(session) = session {
            tokio::spawn(accept_streams(
                session,
                manager.clone(),
                key_id.clone(),
                conn.cancel_token(),
            ));
        }

        let cancel = conn.cancel_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(PING_INTERVAL) => {}
            }

            if let Err(e) = conn.ping().await {
                debug!(key_id = %key_id, error = %e, "ping failed");
                break;
            }
        }

        manager.remove_connection(&key_id, conn.id());
        conn.close();
        debug!(key_id = %key_id, "control connection closed");

        Ok(())
    }

    /// Route one end-user HTTP connection through the tunnel for `key_id`.
    ///
    /// `initial` is the already-buffered request head the edge consumed while
    /// routing; it is replayed ahead of the pipe. An exchange that writes
    /// zero bytes back to the user counts as a failure even without an I/O
    /// error.
    pub async fn handle_http_connection<U>(
        &self,
        ctx: &CancellationToken,
        key_id: &str,
        user: &mut U,
        initial: &[u8],
        client_ip: &str,
    ) -> Result<(), CoreError>
    where
        U: RevStream,
    {
        debug!(key_id = %key_id, "new HTTP connection");

        let mut rev = self
            .acquire_stream(ctx, &self.web_conns, key_id, client_ip)
            .await?;

        if !initial.is_empty() {
            if let Err(e) = rev.stream.write_all(initial).await {
                debug!(error = %e, "failed to replay request head");
                return Err(CoreError::FailedToConnect);
            }
        }

        let parent = rev.parent.clone();
        let mut user = Metered::new(user);
        let res = pipe_streams(ctx, &parent, &mut user, &mut rev.stream).await;

        if user.bytes_written() == 0 {
            debug!(key_id = %key_id, "no data written back to the user");
            return Err(CoreError::FailedToConnect);
        }

        match res {
            Ok(_) | Err(CoreError::ConnClosed) => Ok(()),
            Err(e) => {
                debug!(error = %e, "failed to pipe HTTP connection");
                Err(e)
            }
        }
    }

    /// Route one end-user TCP connection through the tunnel for `key_id`.
    pub async fn handle_tcp_connection<U>(
        &self,
        ctx: &CancellationToken,
        key_id: &str,
        user: &mut U,
        client_ip: &str,
    ) -> Result<(), CoreError>
    where
        U: RevStream,
    {
        debug!(key_id = %key_id, "new TCP connection");

        let mut rev = self
            .acquire_stream(ctx, &self.tcp_conns, key_id, client_ip)
            .await?;

        let parent = rev.parent.clone();
        if let Err(e) = pipe_streams(ctx, &parent, user, &mut rev.stream).await {
            if !matches!(e, CoreError::ConnClosed) {
                debug!(error = %e, "TCP pipe ended");
            }
        }

        Ok(())
    }

    /// Request a reverse stream, wait for it and send the metadata preamble.
    async fn acquire_stream(
        &self,
        ctx: &CancellationToken,
        manager: &Arc<ConnManager>,
        key_id: &str,
        client_ip: &str,
    ) -> Result<AcquiredStream, CoreError> {
        let req = match manager.request_connection(key_id).await {
            Ok(req) => req,
            Err(CoreError::KeyIdNotFound) => {
                // Unknown key and "known key with no live tunnel" get
                // different answers at the edge.
                if !self.auth.is_key_exists(key_id).await? {
                    return Err(CoreError::KeyIdNotFound);
                }
                return Err(CoreError::FailedToConnect);
            }
            Err(e) => {
                debug!(error = %e, "failed to request connection");
                return Err(CoreError::FailedToConnect);
            }
        };

        let req_id = req.id();
        let parent = req.parent_token();

        let mut stream = match req.wait_conn(ctx).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "connection request failed");
                manager.cancel_request(req_id);
                return Err(CoreError::FailedToConnect);
            }
        };

        if let Err(e) = write_meta(&mut stream, &ClientConnMeta { ip: client_ip.to_string() }).await
        {
            debug!(error = %e, "failed to write connection metadata");
            return Err(CoreError::FailedToConnect);
        }

        Ok(AcquiredStream { stream, parent })
    }
}

enum ControlIo {
    V1(BoxedStream),
    V2 { control: MuxStream, session: MuxSession },
}

struct AcquiredStream {
    stream: BoxedStream,
    parent: CancellationToken,
}

struct ReleaseOnDrop {
    allocator: Arc<dyn TcpEndpointAllocator>,
    key_id: String,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.allocator.release(&self.key_id);
    }
}

/// Accept reverse streams on a V2 session until it or the control connection
/// dies.
async fn accept_streams(
    mut session: MuxSession,
    manager: Arc<ConnManager>,
    key_id: String,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            stream = session.accept() => match stream {
                Some(stream) => stream,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        tokio::spawn(handle_mux_stream(stream, manager.clone(), key_id.clone()));
    }

    session.close();
    debug!(key_id = %key_id, "stream accept loop ended");
}

/// Read the bind preamble off a fresh V2 stream and resolve the request it
/// names. Streams that stay silent are closed, resolving nothing.
async fn handle_mux_stream(mut stream: MuxStream, manager: Arc<ConnManager>, key_id: String) {
    let id = match timeout(BIND_TIMEOUT, read_bind_preamble(&mut stream)).await {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            debug!(key_id = %key_id, error = %e, "invalid bind preamble");
            return;
        }
        Err(_) => {
            debug!(key_id = %key_id, "bind preamble timed out");
            return;
        }
    };

    debug!(key_id = %key_id, request = %id, "stream bound");
    manager.resolve_request(id, Box::new(stream));
}
