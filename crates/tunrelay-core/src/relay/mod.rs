//! Bidirectional copy engine.
//!
//! A [`Relay`] pumps bytes (or datagrams) between a captured connection and
//! its upstream until both directions have ended. Each direction borrows a
//! buffer from the shared [`BufferPool`] for its lifetime.

mod deadline;
mod tcp;
mod udp;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub use deadline::ReadDeadline;

use crate::pool::BufferPool;

/// Default wait window applied to the still-active direction once the other
/// direction of a stream relay has ended.
pub const DEFAULT_TCP_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default idle timeout of a datagram relay.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);

/// Timing parameters of the copy engine. Fixed for the lifetime of a
/// [`Relay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub tcp_wait_timeout: Duration,
    pub udp_timeout: Duration,
    /// Inactivity cap of a stream relay. Armed by the first chunk copied in
    /// either direction and pushed back by every later one; when it passes,
    /// both directions are cut. `None` leaves stream relays uncapped.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tcp_wait_timeout: DEFAULT_TCP_WAIT_TIMEOUT,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            idle_timeout: None,
        }
    }
}

/// Copy engine shared by every relay session of a tunnel.
#[derive(Debug, Clone)]
pub struct Relay {
    config: RelayConfig,
    pool: Arc<BufferPool>,
}

impl Relay {
    pub fn new(config: RelayConfig, pool: Arc<BufferPool>) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

/// Outcome of both copy directions of a relay.
///
/// `uplink` is captured to upstream, `downlink` is upstream to captured. A
/// failure in one direction never hides the other.
#[derive(Debug)]
pub struct PipeError {
    pub uplink: Option<io::Error>,
    pub downlink: Option<io::Error>,
}

impl PipeError {
    /// Joins two directional results; `Ok` when neither failed.
    pub fn join<T, U>(uplink: io::Result<T>, downlink: io::Result<U>) -> Result<(), PipeError> {
        match (uplink.err(), downlink.err()) {
            (None, None) => Ok(()),
            (uplink, downlink) => Err(PipeError { uplink, downlink }),
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &io::Error> {
        self.uplink.iter().chain(self.downlink.iter())
    }
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.uplink, &self.downlink) {
            (Some(up), Some(down)) => write!(f, "origin->remote: {up}; remote->origin: {down}"),
            (Some(up), None) => write!(f, "origin->remote: {up}"),
            (None, Some(down)) => write!(f, "remote->origin: {down}"),
            (None, None) => write!(f, "no error"),
        }
    }
}

impl std::error::Error for PipeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.uplink
            .as_ref()
            .or(self.downlink.as_ref())
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
