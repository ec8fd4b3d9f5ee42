//! Per-connection relay handlers and the event loop feeding them.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{PacketConn, ProxyStream, TcpConn, UdpConn};
use crate::metadata::Metadata;
use crate::proxy::Dialer;
use crate::relay::Relay;
use crate::tracker::Tracker;

/// A connection handed over by the network stack.
pub enum StackEvent {
    Tcp(Box<dyn TcpConn>),
    Udp(Box<dyn UdpConn>),
}

/// Relays captured connections to upstream connections obtained from a
/// [`Dialer`].
pub struct Tunnel {
    dialer: Arc<dyn Dialer>,
    relay: Relay,
    tracker: Arc<Tracker>,
}

impl Tunnel {
    pub fn new(dialer: Arc<dyn Dialer>, relay: Relay, tracker: Arc<Tracker>) -> Self {
        Self {
            dialer,
            relay,
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Consumes stack events until the channel closes or `shutdown` fires,
    /// spawning one task per connection. Sessions already running are left
    /// to finish on their own.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<StackEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(StackEvent::Tcp(conn)) => {
                        let tunnel = Arc::clone(&self);
                        tokio::spawn(async move { tunnel.handle_tcp_conn(conn).await });
                    }
                    Some(StackEvent::Udp(conn)) => {
                        let tunnel = Arc::clone(&self);
                        tokio::spawn(async move { tunnel.handle_udp_conn(conn).await });
                    }
                    None => {
                        tracing::debug!("stack event channel closed");
                        break;
                    }
                },
                _ = shutdown.cancelled() => {
                    tracing::debug!("tunnel shutting down");
                    break;
                }
            }
        }
    }

    /// Relays one captured stream connection until both directions ended.
    ///
    /// Never fails: dial and relay errors are logged, and both connections
    /// are closed when this returns.
    pub async fn handle_tcp_conn<C: TcpConn>(&self, origin: C) {
        let mut metadata = Metadata::from_endpoint(origin.id());

        let remote = match self.dialer.dial_tcp(&metadata).await {
            Ok(remote) => remote,
            Err(e) => {
                self.tracker.stats().record_dial_failure();
                tracing::warn!(network = "tcp", dst = %metadata.dst, error = %e, "dial failed");
                return;
            }
        };
        match remote.local_addr() {
            Ok(addr) => metadata.set_mid(addr),
            Err(e) => tracing::debug!(error = %e, "upstream local address unavailable"),
        }

        let remote = self.tracker.track_tcp(remote, &metadata);

        tracing::info!(network = "tcp", src = %metadata.src, dst = %metadata.dst, "relaying");
        if let Err(e) = self.relay.pipe(origin, remote).await {
            tracing::debug!(
                network = "tcp",
                src = %metadata.src,
                dst = %metadata.dst,
                error = %e,
                "relay ended with error"
            );
        }
    }

    /// Relays one captured datagram connection until it goes idle.
    pub async fn handle_udp_conn<C: UdpConn>(&self, origin: C) {
        let mut metadata = Metadata::from_endpoint(origin.id());

        let remote = match self.dialer.dial_udp(&metadata).await {
            Ok(remote) => remote,
            Err(e) => {
                self.tracker.stats().record_dial_failure();
                tracing::warn!(network = "udp", dst = %metadata.dst, error = %e, "dial failed");
                return;
            }
        };
        match remote.local_addr() {
            Ok(addr) => metadata.set_mid(addr),
            Err(e) => tracing::debug!(error = %e, "upstream local address unavailable"),
        }

        let remote = self.tracker.track_udp(remote, &metadata);

        tracing::info!(network = "udp", src = %metadata.src, dst = %metadata.dst, "relaying");
        if let Err(e) = self.relay.pipe_packet(&origin, &remote, metadata.dst).await {
            tracing::debug!(
                network = "udp",
                src = %metadata.src,
                dst = %metadata.dst,
                error = %e,
                "relay ended with error"
            );
        }
    }
}
