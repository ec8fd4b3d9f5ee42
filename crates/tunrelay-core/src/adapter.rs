use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

/// Transport protocol of a captured connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Transport endpoint identity of a captured connection, as seen by the
/// network stack at accept time.
///
/// `local` is the address the host application dialed (the stack terminates
/// the connection on its behalf), `remote` is the application's own socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointId {
    pub network: Network,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl EndpointId {
    pub fn tcp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            network: Network::Tcp,
            local,
            remote,
        }
    }

    pub fn udp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            network: Network::Udp,
            local,
            remote,
        }
    }
}

/// Stream-shaped captured connection.
///
/// Dropping the value closes the connection.
pub trait TcpConn: AsyncRead + AsyncWrite + Unpin + Send {
    /// Transport endpoint identity of this connection.
    fn id(&self) -> &EndpointId;
}

/// Addressed datagram send/receive.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one datagram, returning its length and sender.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to `target`.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Datagram-shaped captured connection.
///
/// Besides addressed I/O it behaves as a connected socket whose peer is the
/// originating application (`id().remote`).
#[async_trait]
pub trait UdpConn: PacketConn {
    fn id(&self) -> &EndpointId;

    /// Receive one datagram from the application.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    /// Send one datagram back to the application.
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let peer = self.id().remote;
        self.send_to(buf, peer).await
    }
}

/// Upstream byte stream returned by a dialer.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Local address of the socket carrying the upstream connection.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl ProxyStream for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

impl<S: ProxyStream + ?Sized> ProxyStream for Box<S> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

impl<T: TcpConn + ?Sized> TcpConn for Box<T> {
    fn id(&self) -> &EndpointId {
        (**self).id()
    }
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

#[async_trait]
impl<P: PacketConn + ?Sized> PacketConn for Box<P> {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        (**self).recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        (**self).send_to(buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

#[async_trait]
impl<U: UdpConn + ?Sized> UdpConn for Box<U> {
    fn id(&self) -> &EndpointId {
        (**self).id()
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf).await
    }
}

/// A captured TCP connection backed by a real socket.
///
/// Used by capture sources that terminate the application's connection on a
/// local listener and recover the original destination out of band.
#[derive(Debug)]
pub struct CapturedTcp {
    stream: TcpStream,
    id: EndpointId,
}

impl CapturedTcp {
    pub fn new(stream: TcpStream, original_dst: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            stream,
            id: EndpointId::tcp(original_dst, peer),
        }
    }
}

impl TcpConn for CapturedTcp {
    fn id(&self) -> &EndpointId {
        &self.id
    }
}

impl AsyncRead for CapturedTcp {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for CapturedTcp {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
