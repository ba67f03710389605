//! Port-routed TCP edge.
//!
//! Implements the core's endpoint allocator: each client holding a tcp token
//! gets its own listener on a port from the configured range, and every
//! connection accepted there is piped through that client's tunnel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use outpost_core::{CoreError, Service, TcpEndpointAllocator};

use crate::EdgeError;

/// TCP edge configuration.
#[derive(Debug, Clone)]
pub struct TcpEdgeConfig {
    /// Address listeners bind on, without a port, e.g. `0.0.0.0`.
    pub bind_host: String,
    /// Host advertised to clients in allocated endpoints.
    pub public_host: String,
    /// Inclusive port range handed out to tunnels.
    pub port_min: u16,
    pub port_max: u16,
}

struct Allocation {
    port: u16,
    endpoint: String,
    cancel: CancellationToken,
}

/// The TCP edge: a dynamic pool of per-tunnel listeners.
///
/// Created before the [`Service`] it serves and attached afterwards, since
/// the two reference each other.
pub struct TcpEdge {
    cfg: TcpEdgeConfig,
    service: OnceLock<Arc<Service>>,
    allocations: Mutex<HashMap<String, Allocation>>,
    shutdown: CancellationToken,
}

impl TcpEdge {
    pub fn new(cfg: TcpEdgeConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            service: OnceLock::new(),
            allocations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Wire in the service whose tunnels this edge feeds. Must happen before
    /// the first client with a tcp token registers.
    pub fn attach(&self, service: Arc<Service>) {
        let _ = self.service.set(service);
    }

    /// Stop every listener.
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let mut allocations = lock(&self.allocations);
        for (_, allocation) in allocations.drain() {
            allocation.cancel.cancel();
        }
    }

    async fn bind_in_range(&self) -> Result<(TcpListener, u16), EdgeError> {
        let used: Vec<u16> = lock(&self.allocations).values().map(|a| a.port).collect();

        for port in self.cfg.port_min..=self.cfg.port_max {
            if used.contains(&port) {
                continue;
            }

            match TcpListener::bind((self.cfg.bind_host.as_str(), port)).await {
                Ok(listener) => return Ok((listener, port)),
                Err(e) => debug!(port, error = %e, "port unavailable"),
            }
        }

        Err(EdgeError::PortsExhausted(self.cfg.port_min, self.cfg.port_max))
    }
}

#[async_trait]
impl TcpEndpointAllocator for TcpEdge {
    async fn allocate(&self, key_id: &str) -> Result<String, CoreError> {
        let service = self
            .service
            .get()
            .ok_or_else(|| CoreError::Endpoint(EdgeError::ServiceNotAttached.to_string()))?
            .clone();

        // A second control connection for the same key reuses its endpoint.
        if let Some(existing) = lock(&self.allocations).get(key_id) {
            return Ok(existing.endpoint.clone());
        }

        let (listener, port) = self
            .bind_in_range()
            .await
            .map_err(|e| CoreError::Endpoint(e.to_string()))?;

        let endpoint = format!("{}:{}", self.cfg.public_host, port);
        let cancel = self.shutdown.child_token();

        info!(key_id = %key_id, endpoint = %endpoint, "TCP endpoint allocated");

        tokio::spawn(accept_loop(
            listener,
            service,
            key_id.to_string(),
            cancel.clone(),
        ));

        lock(&self.allocations).insert(
            key_id.to_string(),
            Allocation { port, endpoint: endpoint.clone(), cancel },
        );

        Ok(endpoint)
    }

    fn release(&self, key_id: &str) {
        if let Some(allocation) = lock(&self.allocations).remove(key_id) {
            debug!(key_id = %key_id, endpoint = %allocation.endpoint, "TCP endpoint released");
            allocation.cancel.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: Arc<Service>,
    key_id: String,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(key_id = %key_id, error = %e, "failed to accept TCP connection");
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        let service = service.clone();
        let key_id = key_id.clone();
        let ctx = cancel.child_token();
        tokio::spawn(async move {
            handle_connection(service, key_id, socket, peer, ctx).await;
        });
    }

    debug!(key_id = %key_id, "TCP endpoint listener stopped");
}

async fn handle_connection(
    service: Arc<Service>,
    key_id: String,
    mut socket: TcpStream,
    peer: SocketAddr,
    ctx: CancellationToken,
) {
    let client_ip = peer.ip().to_string();

    // Any failure just closes the user connection; raw TCP has no way to
    // explain itself.
    if let Err(e) = service
        .handle_tcp_connection(&ctx, &key_id, &mut socket, &client_ip)
        .await
    {
        if !matches!(e, CoreError::ConnClosed) {
            debug!(key_id = %key_id, error = %e, "TCP connection failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_auth::{AuthRepo, MemoryStore, RepoConfig};
    use outpost_core::ConnManager;

    fn edge(port_min: u16, port_max: u16) -> Arc<TcpEdge> {
        TcpEdge::new(TcpEdgeConfig {
            bind_host: "127.0.0.1".to_string(),
            public_host: "edge.example.dev".to_string(),
            port_min,
            port_max,
        })
    }

    fn attach_service(edge: &TcpEdge) {
        let repo = Arc::new(AuthRepo::new(MemoryStore::new(), RepoConfig::default()));
        let service = Arc::new(Service::new(
            Arc::new(ConnManager::new()),
            Arc::new(ConnManager::new()),
            repo,
        ));
        edge.attach(service);
    }

    #[tokio::test]
    async fn allocate_without_service_fails() {
        let edge = edge(42000, 42010);

        assert!(matches!(
            edge.allocate("db").await,
            Err(CoreError::Endpoint(_))
        ));
    }

    #[tokio::test]
    async fn allocate_and_release_round_trip() {
        let edge = edge(42100, 42110);
        attach_service(&edge);

        let endpoint = edge.allocate("db").await.unwrap();
        assert!(endpoint.starts_with("edge.example.dev:"));

        // Same key reuses the endpoint.
        assert_eq!(edge.allocate("db").await.unwrap(), endpoint);

        // Release twice is fine.
        edge.release("db");
        edge.release("db");
    }

    #[tokio::test]
    async fn released_port_is_reusable() {
        let edge = edge(42200, 42200);
        attach_service(&edge);

        let first = edge.allocate("a").await.unwrap();
        edge.release("a");

        // Give the listener task a moment to die and free the socket.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let second = edge.allocate("b").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn exhausted_range_errors() {
        let edge = edge(42300, 42301);
        attach_service(&edge);

        edge.allocate("a").await.unwrap();
        edge.allocate("b").await.unwrap();

        assert!(matches!(
            edge.allocate("c").await,
            Err(CoreError::Endpoint(_))
        ));
    }

    #[tokio::test]
    async fn allocated_endpoint_accepts_connections() {
        let edge = edge(42400, 42410);
        attach_service(&edge);

        let endpoint = edge.allocate("db").await.unwrap();
        let port: u16 = endpoint.rsplit(':').next().unwrap().parse().unwrap();

        // The listener is live even though no tunnel is behind it; the
        // connection is simply closed after the failed dispatch.
        let conn = TcpStream::connect(("127.0.0.1", port)).await;
        assert!(conn.is_ok());
    }
}
