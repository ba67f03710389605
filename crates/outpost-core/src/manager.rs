//! Registry of live control connections and the request/stream rendezvous.
//!
//! One manager per tunnel kind. The maps live behind a single mutex that is
//! never held across I/O: connections to signal are collected under the lock
//! and written to after it is released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{BoxedStream, CoreError};

/// Server-side handle of an authenticated control connection, as the manager
/// sees it.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn id(&self) -> Uuid;

    /// Cancelled when the control connection dies; pending requests and
    /// running pipes watch it.
    fn cancel_token(&self) -> CancellationToken;

    /// Instruct the client to open a reverse stream bound to `request`.
    async fn request_stream(&self, request: Uuid) -> Result<(), CoreError>;

    fn close(&self);
}

struct PendingEntry {
    key_id: String,
    tx: oneshot::Sender<Result<BoxedStream, CoreError>>,
}

#[derive(Default)]
struct Inner {
    /// Live control connections per key. Multiple entries mean replicas of
    /// the same client; dispatch rotates through them.
    tunnels: HashMap<String, VecDeque<Arc<dyn ControlChannel>>>,
    pending: HashMap<Uuid, PendingEntry>,
    /// FIFO view of `pending` per key, used to replay outstanding requests to
    /// newly added connections and to sweep them when the last one leaves.
    waiting: HashMap<String, VecDeque<Uuid>>,
}

/// An in-flight request for a reverse stream.
pub struct ConnRequest {
    id: Uuid,
    parent: CancellationToken,
    shutdown: CancellationToken,
    rx: oneshot::Receiver<Result<BoxedStream, CoreError>>,
}

impl ConnRequest {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Lifetime token of the control connection this request was signalled
    /// to; pipes keep watching it after resolution.
    pub fn parent_token(&self) -> CancellationToken {
        self.parent.clone()
    }

    /// Wait for a reverse stream, honoring the caller's context, the control
    /// connection's lifetime and manager shutdown.
    pub async fn wait_conn(self, ctx: &CancellationToken) -> Result<BoxedStream, CoreError> {
        tokio::select! {
            res = self.rx => match res {
                Ok(res) => res,
                Err(_) => Err(CoreError::FailedToConnect),
            },
            _ = ctx.cancelled() => Err(CoreError::FailedToConnect),
            _ = self.parent.cancelled() => Err(CoreError::FailedToConnect),
            _ = self.shutdown.cancelled() => Err(CoreError::FailedToConnect),
        }
    }
}

/// Connection manager for one tunnel kind.
pub struct ConnManager {
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

impl Default for ConnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a control connection and replay any outstanding requests for
    /// its key to it, oldest first.
    pub async fn add_connection(&self, key_id: &str, conn: Arc<dyn ControlChannel>) {
        let replay: Vec<Uuid> = {
            let mut inner = self.lock();
            inner
                .tunnels
                .entry(key_id.to_string())
                .or_default()
                .push_back(conn.clone());

            inner
                .waiting
                .get(key_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };

        for id in replay {
            if let Err(e) = conn.request_stream(id).await {
                debug!(%id, error = %e, "failed to replay pending request");
                break;
            }
        }
    }

    /// Drop a control connection. When it was the last one for its key, every
    /// still-pending request for that key fails with `KeyIdNotFound`.
    pub fn remove_connection(&self, key_id: &str, conn_id: Uuid) {
        let orphaned: Vec<PendingEntry> = {
            let mut inner = self.lock();

            let Some(conns) = inner.tunnels.get_mut(key_id) else {
                return;
            };
            conns.retain(|c| c.id() != conn_id);

            if !conns.is_empty() {
                return;
            }
            inner.tunnels.remove(key_id);

            let ids = inner.waiting.remove(key_id).unwrap_or_default();
            ids.into_iter()
                .filter_map(|id| inner.pending.remove(&id))
                .collect()
        };

        for entry in orphaned {
            let _ = entry.tx.send(Err(CoreError::KeyIdNotFound));
        }
    }

    /// Create a pending request and signal a live control connection for
    /// `key_id` to open a reverse stream for it.
    ///
    /// Requests are served FIFO per key; replicas sharing a key are rotated
    /// round-robin.
    pub async fn request_connection(&self, key_id: &str) -> Result<ConnRequest, CoreError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        let conn = {
            let mut inner = self.lock();

            let Some(conns) = inner.tunnels.get_mut(key_id) else {
                return Err(CoreError::KeyIdNotFound);
            };

            let conn = match conns.pop_front() {
                Some(conn) => conn,
                None => return Err(CoreError::KeyIdNotFound),
            };
            conns.push_back(conn.clone());

            inner.pending.insert(
                id,
                PendingEntry { key_id: key_id.to_string(), tx },
            );
            inner
                .waiting
                .entry(key_id.to_string())
                .or_default()
                .push_back(id);

            conn
        };

        let request = ConnRequest {
            id,
            parent: conn.cancel_token(),
            shutdown: self.shutdown.clone(),
            rx,
        };

        if let Err(e) = conn.request_stream(id).await {
            debug!(%id, error = %e, "failed to signal control connection");
            self.cancel_request(id);
            return Err(CoreError::FailedToConnect);
        }

        Ok(request)
    }

    /// Deliver a reverse stream to the request it was bound to.
    ///
    /// Exactly one delivery per request: a second resolve, or a resolve after
    /// cancellation, finds no entry and drops the stream to reclaim it.
    pub fn resolve_request(&self, id: Uuid, stream: BoxedStream) {
        let entry = {
            let mut inner = self.lock();
            let entry = inner.pending.remove(&id);

            if let Some(entry) = &entry {
                if let Some(ids) = inner.waiting.get_mut(&entry.key_id) {
                    ids.retain(|waiting| *waiting != id);
                }
            }

            entry
        };

        match entry {
            Some(entry) => {
                if entry.tx.send(Ok(stream)).is_err() {
                    debug!(%id, "request abandoned before resolution");
                }
            }
            None => {
                debug!(%id, "no pending request for stream");
                drop(stream);
            }
        }
    }

    /// Forget a request. A later `resolve_request` for the same id becomes a
    /// no-op that closes the stream.
    pub fn cancel_request(&self, id: Uuid) {
        let mut inner = self.lock();

        if let Some(entry) = inner.pending.remove(&id) {
            if let Some(ids) = inner.waiting.get_mut(&entry.key_id) {
                ids.retain(|waiting| *waiting != id);
            }
        }
    }

    /// Number of live control connections for a key.
    pub fn connection_count(&self, key_id: &str) -> usize {
        self.lock().tunnels.get(key_id).map_or(0, VecDeque::len)
    }

    /// Number of requests not yet resolved or cancelled.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Fail everything and refuse new waits.
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let mut inner = self.lock();
        inner.pending.clear();
        inner.waiting.clear();

        for conns in inner.tunnels.values() {
            for conn in conns {
                conn.close();
            }
        }
        inner.tunnels.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("connection manager lock poisoned");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Control channel that records the bind instructions it receives.
    struct FakeChannel {
        id: Uuid,
        cancel: CancellationToken,
        requests: mpsc::UnboundedSender<Uuid>,
        fail: AtomicBool,
    }

    impl FakeChannel {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Uuid>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let chan = Arc::new(Self {
                id: Uuid::new_v4(),
                cancel: CancellationToken::new(),
                requests: tx,
                fail: AtomicBool::new(false),
            });
            (chan, rx)
        }
    }

    #[async_trait]
    impl ControlChannel for FakeChannel {
        fn id(&self) -> Uuid {
            self.id
        }

        fn cancel_token(&self) -> CancellationToken {
            self.cancel.clone()
        }

        async fn request_stream(&self, request: Uuid) -> Result<(), CoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CoreError::FailedToConnect);
            }
            self.requests.send(request).map_err(|_| CoreError::ConnClosed)
        }

        fn close(&self) {
            self.cancel.cancel();
        }
    }

    fn stream() -> BoxedStream {
        let (a, _b) = tokio::io::duplex(64);
        Box::new(a)
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let mng = ConnManager::new();

        assert!(matches!(
            mng.request_connection("ghost").await,
            Err(CoreError::KeyIdNotFound)
        ));
    }

    #[tokio::test]
    async fn request_signals_connection_and_resolves() {
        let mng = ConnManager::new();
        let (chan, mut signalled) = FakeChannel::new();
        mng.add_connection("demo", chan).await;

        let req = mng.request_connection("demo").await.unwrap();
        assert_eq!(signalled.recv().await.unwrap(), req.id());

        let id = req.id();
        mng.resolve_request(id, stream());

        let ctx = CancellationToken::new();
        req.wait_conn(&ctx).await.unwrap();
        assert_eq!(mng.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolve_without_request_drops_stream() {
        let mng = ConnManager::new();
        // Nothing panics, nothing leaks.
        mng.resolve_request(Uuid::new_v4(), stream());
        assert_eq!(mng.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_beats_resolve() {
        let mng = ConnManager::new();
        let (chan, _signalled) = FakeChannel::new();
        mng.add_connection("demo", chan).await;

        let req = mng.request_connection("demo").await.unwrap();
        let id = req.id();

        mng.cancel_request(id);
        mng.resolve_request(id, stream());

        let ctx = CancellationToken::new();
        assert!(matches!(
            req.wait_conn(&ctx).await,
            Err(CoreError::FailedToConnect)
        ));
    }

    #[tokio::test]
    async fn removing_last_connection_fails_pending() {
        let mng = ConnManager::new();
        let (chan, _signalled) = FakeChannel::new();
        let conn_id = chan.id();
        mng.add_connection("demo", chan).await;

        let req = mng.request_connection("demo").await.unwrap();
        mng.remove_connection("demo", conn_id);

        let ctx = CancellationToken::new();
        assert!(matches!(
            req.wait_conn(&ctx).await,
            Err(CoreError::KeyIdNotFound)
        ));
        assert_eq!(mng.pending_count(), 0);
        assert!(matches!(
            mng.request_connection("demo").await,
            Err(CoreError::KeyIdNotFound)
        ));
    }

    #[tokio::test]
    async fn surviving_replica_keeps_pending_alive() {
        let mng = ConnManager::new();
        let (a, _sig_a) = FakeChannel::new();
        let (b, _sig_b) = FakeChannel::new();
        let a_id = a.id();

        mng.add_connection("demo", a).await;
        mng.add_connection("demo", b).await;

        let _req = mng.request_connection("demo").await.unwrap();
        mng.remove_connection("demo", a_id);

        // One replica left: the request must still be pending.
        assert_eq!(mng.pending_count(), 1);
        assert_eq!(mng.connection_count("demo"), 1);
    }

    #[tokio::test]
    async fn new_connection_replays_waiting_requests_in_order() {
        let mng = ConnManager::new();
        let (a, _sig_a) = FakeChannel::new();
        mng.add_connection("demo", a).await;

        let first = mng.request_connection("demo").await.unwrap();
        let second = mng.request_connection("demo").await.unwrap();

        let (b, mut sig_b) = FakeChannel::new();
        mng.add_connection("demo", b).await;

        assert_eq!(sig_b.recv().await.unwrap(), first.id());
        assert_eq!(sig_b.recv().await.unwrap(), second.id());
    }

    #[tokio::test]
    async fn replicas_rotate_round_robin() {
        let mng = ConnManager::new();
        let (a, mut sig_a) = FakeChannel::new();
        let (b, mut sig_b) = FakeChannel::new();
        mng.add_connection("demo", a).await;
        mng.add_connection("demo", b).await;

        let r1 = mng.request_connection("demo").await.unwrap();
        let r2 = mng.request_connection("demo").await.unwrap();

        assert_eq!(sig_a.recv().await.unwrap(), r1.id());
        assert_eq!(sig_b.recv().await.unwrap(), r2.id());
    }

    #[tokio::test]
    async fn signalling_failure_cleans_up() {
        let mng = ConnManager::new();
        let (chan, _signalled) = FakeChannel::new();
        chan.fail.store(true, Ordering::SeqCst);
        mng.add_connection("demo", chan).await;

        assert!(matches!(
            mng.request_connection("demo").await,
            Err(CoreError::FailedToConnect)
        ));
        assert_eq!(mng.pending_count(), 0);
    }

    #[tokio::test]
    async fn wait_conn_honors_caller_context() {
        let mng = ConnManager::new();
        let (chan, _signalled) = FakeChannel::new();
        mng.add_connection("demo", chan).await;

        let req = mng.request_connection("demo").await.unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(
            req.wait_conn(&ctx).await,
            Err(CoreError::FailedToConnect)
        ));
    }

    #[tokio::test]
    async fn wait_conn_honors_control_connection_death() {
        let mng = ConnManager::new();
        let (chan, _signalled) = FakeChannel::new();
        let token = chan.cancel_token();
        mng.add_connection("demo", chan).await;

        let req = mng.request_connection("demo").await.unwrap();
        token.cancel();

        let ctx = CancellationToken::new();
        assert!(matches!(
            req.wait_conn(&ctx).await,
            Err(CoreError::FailedToConnect)
        ));
    }
}
