//! Transport wrapper that keeps its server model's in-use accounting honest.

use crate::credential::CredentialKey;
use crate::manager::server_model::ActiveSet;
use crate::transport::{Probe, Transport};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;
use tracing::trace;

/// Process-unique identity of a monitored transport. The active set counts
/// transports by this id rather than owning them.
pub type TransportId = u64;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

fn next_transport_id() -> TransportId {
    NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A transport registered with one server model's active set.
///
/// Registration is a relation, not ownership: the active set holds only the
/// transport's id, and the transport removes itself on `close`, `shutdown`,
/// and drop. Removal is idempotent, so an abandoned transport can never pin a
/// server model's accounting.
pub struct MonitoredTransport {
    inner: Transport,
    id: TransportId,
    registry: Weak<ActiveSet>,
    identity: CredentialKey,
    spawned_at: Instant,
    response_timeout: Option<Duration>,
}

impl MonitoredTransport {
    /// Wrap `inner` and insert it into `registry` with the current timestamp.
    pub(crate) fn register(
        inner: Transport,
        registry: &Arc<ActiveSet>,
        identity: CredentialKey,
    ) -> Self {
        let id = next_transport_id();
        registry.insert(id);
        Self {
            inner,
            id,
            registry: Arc::downgrade(registry),
            identity,
            spawned_at: Instant::now(),
            response_timeout: None,
        }
    }

    /// Re-insert into the owning active set after a stay in an idle pool.
    pub(crate) fn reregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.insert(self.id);
        }
    }

    pub(crate) fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Credential identity this transport was opened under; selects the pool
    /// it returns to.
    pub fn identity(&self) -> CredentialKey {
        self.identity
    }

    /// Time since the transport was dialed.
    pub fn age(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Deadline applied to each `send`/`recv`; `None` disables it.
    pub fn set_timeout(&mut self, response_timeout: Option<Duration>) {
        self.response_timeout = response_timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.response_timeout
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub(crate) fn probe(&self) -> Probe {
        self.inner.probe()
    }

    /// Read some bytes, bounded by the response timeout.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.response_timeout {
            Some(limit) => timeout(limit, self.inner.read(buf))
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "recv timed out"))),
            None => self.inner.read(buf).await,
        }
    }

    /// Fill `buf` completely, bounded by the response timeout.
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.response_timeout {
            Some(limit) => timeout(limit, self.inner.read_exact(buf))
                .await
                .map(|res| res.map(|_| ()))
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "recv timed out"))),
            None => self.inner.read_exact(buf).await.map(|_| ()),
        }
    }

    /// Write some bytes, bounded by the response timeout.
    pub async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.response_timeout {
            Some(limit) => timeout(limit, self.inner.write(buf))
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"))),
            None => self.inner.write(buf).await,
        }
    }

    /// Write all of `buf`, bounded by the response timeout.
    pub async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.response_timeout {
            Some(limit) => timeout(limit, self.inner.write_all(buf))
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"))),
            None => self.inner.write_all(buf).await,
        }
    }

    /// Deregister and shut down the write half. Half-open retention is not
    /// modeled; a shut-down transport is out of the accounting for good.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.deregister();
        self.inner.shutdown().await
    }

    /// Deregister and close. The descriptor is released when the transport
    /// drops at the end of this call.
    pub async fn close(mut self) -> io::Result<()> {
        self.deregister();
        self.inner.shutdown().await
    }
}

// The poll-based surface bypasses the response timeout; use `send`/`recv`
// for deadline-bounded operations.
impl AsyncRead for MonitoredTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MonitoredTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Drop for MonitoredTransport {
    fn drop(&mut self) {
        // Abandoned without close(): the registry entry still has to go, and
        // removal must not panic mid-unwind.
        self.deregister();
    }
}

impl std::fmt::Debug for MonitoredTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredTransport")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("peer", &self.inner.peer_addr().ok())
            .finish()
    }
}

/// Hand a discarded transport to the reactor for a fire-and-forget shutdown
/// so pool paths never block on peer teardown.
pub(crate) fn kill(transport: MonitoredTransport) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let mut transport = transport;
                if let Err(err) = transport.shutdown().await {
                    trace!(error = %err, "error shutting down discarded transport");
                }
            });
        }
        // No reactor to hand the close to; dropping still releases the
        // descriptor.
        Err(_) => drop(transport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn monitored(registry: &Arc<ActiveSet>) -> (MonitoredTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = connect.await.unwrap();
        let transport =
            MonitoredTransport::register(Transport::Plain(client), registry, CredentialKey::Anonymous);
        (transport, server)
    }

    #[tokio::test]
    async fn registration_follows_lifecycle() {
        let registry = Arc::new(ActiveSet::default());
        let (transport, _server) = monitored(&registry).await;
        assert_eq!(registry.len(), 1);

        transport.close().await.unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_for_the_registry() {
        let registry = Arc::new(ActiveSet::default());
        let (mut transport, _server) = monitored(&registry).await;

        transport.shutdown().await.unwrap();
        assert_eq!(registry.len(), 0);
        // A second shutdown must not disturb other registrations.
        let (other, _other_server) = monitored(&registry).await;
        let _ = transport.shutdown().await;
        assert_eq!(registry.len(), 1);
        drop(other);
    }

    #[tokio::test]
    async fn drop_deregisters_abandoned_transports() {
        let registry = Arc::new(ActiveSet::default());
        let (transport, _server) = monitored(&registry).await;
        assert_eq!(registry.len(), 1);
        drop(transport);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn reregister_restores_the_entry() {
        let registry = Arc::new(ActiveSet::default());
        let (transport, _server) = monitored(&registry).await;
        transport.deregister();
        assert_eq!(registry.len(), 0);
        transport.reregister();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn send_and_recv_round_trip() {
        let registry = Arc::new(ActiveSet::default());
        let (mut transport, mut server) = monitored(&registry).await;
        transport.set_timeout(Some(Duration::from_secs(1)));

        transport.send_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        transport.recv_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn recv_honors_the_response_timeout() {
        let registry = Arc::new(ActiveSet::default());
        let (mut transport, _server) = monitored(&registry).await;
        transport.set_timeout(Some(Duration::from_millis(50)));

        let mut buf = [0u8; 1];
        let err = transport.recv(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
