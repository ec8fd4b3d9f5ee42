pub mod direct;

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::adapter::{PacketConn, ProxyStream};
use crate::metadata::Metadata;

pub use direct::DirectDialer;

/// Default timeout for establishing an upstream connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {0} timed out")]
    Timeout(SocketAddr),
    #[error("connection refused by {0}")]
    Refused(SocketAddr),
    #[error("{0} is not supported by this dialer")]
    Unsupported(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boxed upstream stream, as returned by [`Dialer::dial_tcp`].
pub type BoxedStream = Box<dyn ProxyStream>;

/// Boxed upstream packet socket, as returned by [`Dialer::dial_udp`].
pub type BoxedPacketConn = Box<dyn PacketConn>;

/// Establishes upstream connections for captured traffic.
///
/// Each call is a single attempt. A returned connection is already connected
/// and owned by the caller; an error leaves nothing for the caller to clean up.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a byte stream towards `metadata.dst`.
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<BoxedStream, DialError>;

    /// Opens a packet socket able to reach `metadata.dst`.
    async fn dial_udp(&self, _metadata: &Metadata) -> Result<BoxedPacketConn, DialError> {
        Err(DialError::Unsupported("udp"))
    }
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for std::sync::Arc<D> {
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<BoxedStream, DialError> {
        (**self).dial_tcp(metadata).await
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<BoxedPacketConn, DialError> {
        (**self).dial_udp(metadata).await
    }
}
