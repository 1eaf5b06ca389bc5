//! Raw transport primitives: dialing, plaintext/TLS streams, liveness probes.

pub mod monitored;

pub use monitored::MonitoredTransport;

use crate::resolve::Address;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

/// Outcome of a zero-timeout readability probe.
///
/// A pooled transport must have nothing to read: readable means the peer
/// closed it or left bytes that would poison the next user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    Clean,
    Corrupt,
    Dead,
}

/// A dialed stream, optionally TLS-wrapped.
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Zero-timeout readability check on the raw socket. Never suspends: the
    /// peek future is polled exactly once and discarded if pending.
    pub(crate) fn probe(&self) -> Probe {
        let mut buf = [0u8; 1];
        match self.tcp().peek(&mut buf).now_or_never() {
            None => Probe::Clean,
            Some(Ok(0)) => Probe::Corrupt,
            Some(Ok(_)) => Probe::Corrupt,
            Some(Err(_)) => Probe::Dead,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open a TCP connection bounded by `connect_timeout`.
///
/// Nagle is disabled on every dialed stream; RPC-sized writes should not wait
/// for coalescing. Keepalive is optional and config-driven.
pub(crate) async fn dial(
    address: &Address,
    connect_timeout: Duration,
    keepalive: Option<Duration>,
) -> io::Result<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect(address.socket_addr())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", address, connect_timeout),
            ))
        }
    };
    stream.set_nodelay(true)?;
    if let Some(period) = keepalive {
        let ka = socket2::TcpKeepalive::new().with_time(period);
        socket2::SockRef::from(&stream).set_tcp_keepalive(&ka)?;
    }
    Ok(stream)
}
