use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use super::{BoxedPacketConn, BoxedStream, DialError, Dialer, DEFAULT_CONNECT_TIMEOUT_SECS};
use crate::metadata::Metadata;

/// Connects straight to the captured destination, optionally from a fixed
/// local address.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    connect_timeout: Duration,
    bind_addr: Option<IpAddr>,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            bind_addr: None,
        }
    }

    /// Source address for outgoing sockets. Traffic must leave through an
    /// interface other than the captured one to avoid looping back.
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    async fn connect(&self, dst: SocketAddr) -> io::Result<TcpStream> {
        match self.bind_addr {
            Some(ip) if ip.is_ipv4() == dst.is_ipv4() => {
                let socket = if dst.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(SocketAddr::new(ip, 0))?;
                socket.connect(dst).await
            }
            _ => TcpStream::connect(dst).await,
        }
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<BoxedStream, DialError> {
        let dst = metadata.dst;
        let stream = match tokio::time::timeout(self.connect_timeout, self.connect(dst)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(DialError::Refused(dst));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(DialError::Timeout(dst)),
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<BoxedPacketConn, DialError> {
        // a bind address of the other family could never reach dst
        let ip = match self.bind_addr {
            Some(ip) if ip.is_ipv4() == metadata.dst.is_ipv4() => ip,
            _ if metadata.dst.is_ipv4() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            _ => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        Ok(Box::new(socket))
    }
}
