//! Bidirectional byte piping between an end-user connection and a reverse
//! stream.
//!
//! `copy_bidirectional` gives the half-close semantics the protocol needs:
//! when one direction hits EOF the peer's write side is shut down, which maps
//! to a TCP FIN or a mux FIN frame, and the other direction keeps draining.
//! The copy races against the request context and the control connection's
//! lifetime; losing the race drops the reverse stream, which closes it.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::CoreError;

/// AsyncRead/AsyncWrite passthrough that counts the bytes written into it.
///
/// The count survives pipe errors, which is what the zero-byte-response rule
/// needs: `copy_bidirectional` loses its totals when it fails.
pub struct Metered<S> {
    inner: S,
    written: u64,
}

impl<S> Metered<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, written: 0 }
    }

    /// Bytes written into the wrapped stream so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                self.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Classify pipe I/O failures: peers hanging up is the normal end of a
/// proxied connection, not an error worth surfacing.
pub fn map_pipe_error(e: std::io::Error) -> CoreError {
    use std::io::ErrorKind;

    match e.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => CoreError::ConnClosed,
        _ => CoreError::Io(e),
    }
}

/// Copy both directions until they finish, a side fails, or a context ends.
pub async fn pipe_streams<U, R>(
    ctx: &CancellationToken,
    parent: &CancellationToken,
    user: &mut U,
    rev: &mut R,
) -> Result<(u64, u64), CoreError>
where
    U: AsyncRead + AsyncWrite + Send + Unpin,
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    tokio::select! {
        res = tokio::io::copy_bidirectional(user, rev) => match res {
            Ok((to_rev, to_user)) => {
                debug!(to_rev, to_user, "pipe finished");
                Ok((to_rev, to_user))
            }
            Err(e) => {
                debug!(error = %e, "pipe failed");
                Err(map_pipe_error(e))
            }
        },
        _ = ctx.cancelled() => {
            debug!("closing pipe, request context done");
            Err(CoreError::ConnClosed)
        }
        _ = parent.cancelled() => {
            debug!("closing pipe, control connection done");
            Err(CoreError::ConnClosed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pipes_both_directions_with_half_close() {
        let (user_near, mut user_far) = tokio::io::duplex(1024);
        let (rev_near, mut rev_far) = tokio::io::duplex(1024);

        let ctx = CancellationToken::new();
        let parent = CancellationToken::new();

        let pipe = tokio::spawn(async move {
            let mut user = user_near;
            let mut rev = rev_near;
            pipe_streams(&ctx, &parent, &mut user, &mut rev).await
        });

        // User sends a request and half-closes.
        user_far.write_all(b"request").await.unwrap();
        user_far.shutdown().await.unwrap();

        let mut buf = Vec::new();
        rev_far.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"request");

        // Service responds after the user is done sending; the full response
        // must still arrive.
        rev_far.write_all(b"full response").await.unwrap();
        rev_far.shutdown().await.unwrap();

        let (to_rev, to_user) = pipe.await.unwrap().unwrap();
        assert_eq!(to_rev, 7);
        assert_eq!(to_user, 13);

        let mut buf = Vec::new();
        user_far.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"full response");
    }

    #[tokio::test]
    async fn cancellation_ends_the_pipe() {
        let (user_near, _user_far) = tokio::io::duplex(1024);
        let (rev_near, _rev_far) = tokio::io::duplex(1024);

        let ctx = CancellationToken::new();
        let parent = CancellationToken::new();
        ctx.cancel();

        let mut user = user_near;
        let mut rev = rev_near;
        let res = pipe_streams(&ctx, &parent, &mut user, &mut rev).await;
        assert!(matches!(res, Err(CoreError::ConnClosed)));
    }

    #[tokio::test]
    async fn metered_counts_written_bytes() {
        let (near, mut far) = tokio::io::duplex(1024);
        let mut metered = Metered::new(near);

        metered.write_all(b"12345").await.unwrap();
        assert_eq!(metered.bytes_written(), 5);

        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();
    }

    #[test]
    fn peer_hangups_are_conn_closed() {
        for kind in [
            std::io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::UnexpectedEof,
        ] {
            assert!(matches!(
                map_pipe_error(std::io::Error::from(kind)),
                CoreError::ConnClosed
            ));
        }

        assert!(matches!(
            map_pipe_error(std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
            CoreError::Io(_)
        ));
    }
}
