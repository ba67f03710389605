//! Subdomain-routed HTTP edge.
//!
//! Accepts raw TCP, buffers the request head far enough to learn the host,
//! resolves the tunnel key ID from the subdomain and hands the connection to
//! the core. The buffered head is replayed into the reverse stream, so no
//! HTTP parsing beyond the headers is needed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use outpost_core::{CoreError, Service};

use crate::EdgeError;

/// Upper bound on the buffered request head.
const MAX_HEAD: usize = 16 * 1024;

/// How long a client gets to produce its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the TLS SNI when a fronting proxy terminates for a CNAME;
/// it wins over `Host` because the proxy strips any client-supplied value.
const UPSTREAM_HOST_HEADER: &str = "x-upstream-host";

const RESP_404: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nNot Found";
const RESP_502: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nContent-Length: 11\r\n\r\nBad Gateway";
const RESP_500: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/plain\r\nContent-Length: 21\r\n\r\nInternal Server Error";

/// HTTP edge configuration.
#[derive(Debug, Clone)]
pub struct HttpEdgeConfig {
    /// Listen address, e.g. `0.0.0.0:8080`.
    pub listen: String,
    /// Public domain suffix; `<keyID>.<domain>` routes to `<keyID>`.
    pub domain: String,
}

/// The HTTP edge server.
pub struct HttpEdge {
    listener: TcpListener,
    domain: String,
    service: Arc<Service>,
}

impl HttpEdge {
    pub async fn bind(cfg: HttpEdgeConfig, service: Arc<Service>) -> Result<Self, EdgeError> {
        let listener = TcpListener::bind(&cfg.listen).await?;

        Ok(Self { listener, domain: cfg.domain, service })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EdgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept end-user connections until the context is cancelled.
    pub async fn run(self, ctx: CancellationToken) -> Result<(), EdgeError> {
        info!(addr = %self.listener.local_addr()?, domain = %self.domain, "HTTP edge listening");

        loop {
            let (socket, peer) = tokio::select! {
                res = self.listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "failed to accept HTTP connection");
                        continue;
                    }
                },
                _ = ctx.cancelled() => return Ok(()),
            };

            let service = self.service.clone();
            let domain = self.domain.clone();
            let ctx = ctx.child_token();
            tokio::spawn(async move {
                handle_connection(service, domain, socket, peer, ctx).await;
            });
        }
    }
}

async fn handle_connection(
    service: Arc<Service>,
    domain: String,
    mut socket: TcpStream,
    peer: SocketAddr,
    ctx: CancellationToken,
) {
    debug!(peer = %peer, "new edge connection");

    let head = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut socket)).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "failed to read request head");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "request head timed out");
            return;
        }
    };

    let Some(key_id) = resolve_key_id(&head, &domain) else {
        let _ = socket.write_all(RESP_404).await;
        return;
    };

    let client_ip = peer.ip().to_string();
    let result = service
        .handle_http_connection(&ctx, &key_id, &mut socket, &head, &client_ip)
        .await;

    match result {
        Ok(()) | Err(CoreError::ConnClosed) => {}
        Err(CoreError::KeyIdNotFound) => {
            let _ = socket.write_all(RESP_404).await;
        }
        Err(CoreError::FailedToConnect) => {
            let _ = socket.write_all(RESP_502).await;
        }
        Err(e) => {
            error!(key_id = %key_id, error = %e, "failed to handle HTTP connection");
            let _ = socket.write_all(RESP_500).await;
        }
    }
}

/// Buffer the request head up to and including the blank line.
async fn read_head(socket: &mut TcpStream) -> std::io::Result<BytesMut> {
    let mut head = BytesMut::with_capacity(4096);

    loop {
        let n = socket.read_buf(&mut head).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }

        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head);
        }

        if head.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

/// Extract the tunnel key ID from a buffered request head.
///
/// `X-Upstream-Host` is consulted first, then `Host`; the winning host must
/// sit on a DNS label boundary under `domain` and its first label becomes the
/// key ID.
pub fn resolve_key_id(head: &[u8], domain: &str) -> Option<String> {
    let upstream = header_value(head, UPSTREAM_HOST_HEADER);
    let host = header_value(head, "host");

    [upstream, host]
        .into_iter()
        .flatten()
        .find_map(|candidate| key_id_from_host(&candidate, domain))
}

/// Find a header value in a raw request head, case-insensitively.
fn header_value(head: &[u8], name: &str) -> Option<String> {
    let text = std::str::from_utf8(head).ok()?;

    // Skip the request line; headers end at the blank line.
    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim().to_string());
        }
    }

    None
}

fn key_id_from_host(host: &str, domain: &str) -> Option<String> {
    // Strip any port.
    let host = host.split(':').next().unwrap_or(host);

    // Label-boundary match: "evil-example.dev" must not match "example.dev".
    let prefix = host.strip_suffix(domain)?.strip_suffix('.')?;
    if prefix.is_empty() {
        return None;
    }

    // First label of the host is the key ID.
    let key_id = prefix.split('.').next()?;
    (!key_id.is_empty()).then(|| key_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(lines: &[&str]) -> Vec<u8> {
        let mut head = String::from("GET / HTTP/1.1\r\n");
        for line in lines {
            head.push_str(line);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    #[test]
    fn resolves_subdomain_from_host() {
        let head = head(&["Host: demo.example.dev"]);
        assert_eq!(resolve_key_id(&head, "example.dev"), Some("demo".to_string()));
    }

    #[test]
    fn strips_port_from_host() {
        let head = head(&["Host: demo.example.dev:8080"]);
        assert_eq!(resolve_key_id(&head, "example.dev"), Some("demo".to_string()));
    }

    #[test]
    fn upstream_host_wins_over_host() {
        let head = head(&[
            "Host: custom-domain.com",
            "X-Upstream-Host: demo.example.dev",
        ]);
        assert_eq!(resolve_key_id(&head, "example.dev"), Some("demo".to_string()));
    }

    #[test]
    fn falls_back_to_host_when_upstream_does_not_match() {
        let head = head(&[
            "X-Upstream-Host: other.site.org",
            "Host: demo.example.dev",
        ]);
        assert_eq!(resolve_key_id(&head, "example.dev"), Some("demo".to_string()));
    }

    #[test]
    fn bare_domain_has_no_key() {
        let head = head(&["Host: example.dev"]);
        assert_eq!(resolve_key_id(&head, "example.dev"), None);
    }

    #[test]
    fn label_boundary_is_enforced() {
        let head = head(&["Host: evil-example.dev"]);
        assert_eq!(resolve_key_id(&head, "example.dev"), None);
    }

    #[test]
    fn unrelated_host_is_rejected() {
        let head = head(&["Host: something.else.org"]);
        assert_eq!(resolve_key_id(&head, "example.dev"), None);
    }

    #[test]
    fn nested_subdomains_use_the_first_label() {
        let head = head(&["Host: a.b.example.dev"]);
        assert_eq!(resolve_key_id(&head, "example.dev"), Some("a".to_string()));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let head = head(&["hOsT: demo.example.dev"]);
        assert_eq!(resolve_key_id(&head, "example.dev"), Some("demo".to_string()));
    }

    #[test]
    fn missing_host_resolves_nothing() {
        let head = head(&["User-Agent: test"]);
        assert_eq!(resolve_key_id(&head, "example.dev"), None);
    }
}
