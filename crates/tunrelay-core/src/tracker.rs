//! Traffic accounting decorators for upstream connections.
//!
//! [`TrackedStream`] and [`TrackedPacketConn`] forward every call to the
//! wrapped connection unchanged and only count bytes. Dropping the wrapper
//! drops the inner connection and closes the session record.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::adapter::{PacketConn, ProxyStream};
use crate::metadata::Metadata;
use crate::session::{SessionCounters, SessionInfo, SessionManager};
use crate::stats::{StatsSnapshot, TrafficStats};

/// Traffic statistics plus the table of open sessions.
#[derive(Default)]
pub struct Tracker {
    stats: TrafficStats,
    sessions: SessionManager,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn track_tcp<S: ProxyStream>(
        self: &Arc<Self>,
        stream: S,
        metadata: &Metadata,
    ) -> TrackedStream<S> {
        TrackedStream {
            inner: stream,
            handle: self.open(metadata),
        }
    }

    pub fn track_udp<P: PacketConn>(
        self: &Arc<Self>,
        conn: P,
        metadata: &Metadata,
    ) -> TrackedPacketConn<P> {
        TrackedPacketConn {
            inner: conn,
            handle: self.open(metadata),
        }
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn snapshot(&self, top_n: usize) -> StatsSnapshot {
        self.stats.snapshot(top_n)
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.snapshot()
    }

    fn open(self: &Arc<Self>, metadata: &Metadata) -> TrackHandle {
        self.stats.record_connection_open(metadata.network);
        let (id, counters) = self.sessions.open(metadata);
        TrackHandle {
            tracker: Arc::clone(self),
            id,
            counters,
        }
    }
}

struct TrackHandle {
    tracker: Arc<Tracker>,
    id: u64,
    counters: Arc<SessionCounters>,
}

impl TrackHandle {
    fn upload(&self, n: usize) {
        self.counters.add_upload(n as u64);
        self.tracker.stats.record_upload(n as u64);
    }

    fn download(&self, n: usize) {
        self.counters.add_download(n as u64);
        self.tracker.stats.record_download(n as u64);
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        if let Some(session) = self.tracker.sessions.close(self.id) {
            self.tracker.stats.record_connection_close(
                &session.destination.to_string(),
                session.upload,
                session.download,
            );
            tracing::trace!(
                id = session.id,
                dst = %session.destination,
                upload = session.upload,
                download = session.download,
                "session closed"
            );
        }
    }
}

/// Byte-counting wrapper around an upstream stream.
///
/// Writes count as upload, reads as download.
pub struct TrackedStream<S> {
    inner: S,
    handle: TrackHandle,
}

impl<S> TrackedStream<S> {
    pub fn session_id(&self) -> u64 {
        self.handle.id
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.handle.download(n);
            }
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            self.handle.upload(n);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: ProxyStream> ProxyStream for TrackedStream<S> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Byte-counting wrapper around an upstream packet socket.
pub struct TrackedPacketConn<P> {
    inner: P,
    handle: TrackHandle,
}

impl<P> TrackedPacketConn<P> {
    pub fn session_id(&self) -> u64 {
        self.handle.id
    }
}

#[async_trait]
impl<P: PacketConn> PacketConn for TrackedPacketConn<P> {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.inner.recv_from(buf).await?;
        self.handle.download(n);
        Ok((n, from))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let n = self.inner.send_to(buf, target).await?;
        self.handle.upload(n);
        Ok(n)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::EndpointId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    fn metadata(dst: SocketAddr) -> Metadata {
        Metadata::from_endpoint(&EndpointId::tcp(dst, "10.0.0.1:40000".parse().unwrap()))
    }

    #[tokio::test]
    async fn test_tracked_stream_counts_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = listener.local_addr().unwrap();
        let stream = TcpStream::connect(dst).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let tracker = Tracker::new();
        let mut tracked = tracker.track_tcp(stream, &metadata(dst));
        let id = tracked.session_id();

        tracked.write_all(b"0123456789").await.unwrap();
        let mut req = [0u8; 10];
        server.read_exact(&mut req).await.unwrap();

        server.write_all(&[1u8; 20]).await.unwrap();
        let mut resp = [0u8; 20];
        tracked.read_exact(&mut resp).await.unwrap();

        let live = tracker.sessions().get(id).unwrap();
        assert_eq!((live.upload, live.download), (10, 20));
        assert_eq!(tracker.snapshot(1).active_connections, 1);

        drop(tracked);
        assert!(tracker.sessions().is_empty());
        let snap = tracker.snapshot(1);
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.total_upload, 10);
        assert_eq!(snap.total_download, 20);
        assert_eq!(snap.top_destinations[0].destination, dst.to_string());

        // the wrapped socket was closed with the wrapper
        let mut rest = Vec::new();
        assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tracked_packet_conn_counts_bytes() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let tracker = Tracker::new();
        let metadata =
            Metadata::from_endpoint(&EndpointId::udp(peer_addr, "10.0.0.1:40000".parse().unwrap()));
        let tracked = tracker.track_udp(socket, &metadata);
        let local = tracked.local_addr().unwrap();

        tracked.send_to(b"abc", peer_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 3);

        peer.send_to(b"abcdef", local).await.unwrap();
        let (n, from) = tracked.recv_from(&mut buf).await.unwrap();
        assert_eq!((n, from), (6, peer_addr));

        let live = tracker.sessions().get(tracked.session_id()).unwrap();
        assert_eq!((live.upload, live.download), (3, 6));
        assert_eq!(tracker.snapshot(0).total_udp, 1);
        assert_eq!(tracker.snapshot(0).total_tcp, 0);
    }
}
