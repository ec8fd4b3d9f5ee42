use std::io;
use std::net::SocketAddr;

use super::{PipeError, ReadDeadline, Relay};
use crate::adapter::{PacketConn, UdpConn};
use crate::pool::MAX_SEGMENT_SIZE;

impl Relay {
    /// Forwards datagrams between a captured UDP connection and an upstream
    /// packet socket until the session goes idle for `udp_timeout`.
    ///
    /// Traffic in either direction pushes back both read deadlines. Replies
    /// from any address other than `target` are dropped.
    pub async fn pipe_packet<O, R>(
        &self,
        origin: &O,
        remote: &R,
        target: SocketAddr,
    ) -> Result<(), PipeError>
    where
        O: UdpConn + ?Sized,
        R: PacketConn + ?Sized,
    {
        let origin_deadline = ReadDeadline::new();
        let remote_deadline = ReadDeadline::new();
        let timeout = self.config.udp_timeout;
        origin_deadline.set_after(timeout);
        remote_deadline.set_after(timeout);

        // only forwarded datagrams keep the session alive
        let forwarded = || {
            origin_deadline.set_after(timeout);
            remote_deadline.set_after(timeout);
        };

        let uplink = async {
            let mut buf = self.pool.get(MAX_SEGMENT_SIZE);
            loop {
                let n = match origin_deadline.guard(origin.recv(&mut buf[..])).await {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(()),
                    Err(e) => return Err(e),
                };
                remote.send_to(&buf[..n], target).await?;
                forwarded();
            }
        };

        let downlink = async {
            let mut buf = self.pool.get(MAX_SEGMENT_SIZE);
            loop {
                let (n, from) = match remote_deadline.guard(remote.recv_from(&mut buf[..])).await {
                    Ok(received) => received,
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(()),
                    Err(e) => return Err(e),
                };
                if from != target {
                    tracing::trace!(%from, %target, "dropping datagram from unexpected source");
                    continue;
                }
                origin.send(&buf[..n]).await?;
                forwarded();
            }
        };

        let (up, down): (io::Result<()>, io::Result<()>) = tokio::join!(uplink, downlink);
        PipeError::join(up, down)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::UdpSocket;
    use tokio::sync::{mpsc, Mutex};
    use tokio::time::Instant;

    use super::*;
    use crate::adapter::EndpointId;
    use crate::pool::BufferPool;
    use crate::relay::RelayConfig;

    /// Captured UDP connection fed through channels.
    struct ChannelUdp {
        id: EndpointId,
        inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
        outbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    }

    #[async_trait]
    impl PacketConn for ChannelUdp {
        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            match self.inbound.lock().await.recv().await {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), self.id.remote))
                }
                None => std::future::pending().await,
            }
        }

        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.outbound
                .send((buf.to_vec(), target))
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(buf.len())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.id.local)
        }
    }

    impl UdpConn for ChannelUdp {
        fn id(&self) -> &EndpointId {
            &self.id
        }
    }

    fn relay(udp_timeout: Duration) -> Relay {
        Relay::new(
            RelayConfig {
                udp_timeout,
                ..RelayConfig::default()
            },
            BufferPool::new(8),
        )
    }

    #[tokio::test]
    async fn test_pipe_packet_round_trip_and_idle_end() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let app: SocketAddr = "10.0.0.1:5353".parse().unwrap();

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let captured = Arc::new(ChannelUdp {
            id: EndpointId::udp(target, app),
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
        });

        let relay = relay(Duration::from_millis(300));
        let session = {
            let captured = Arc::clone(&captured);
            tokio::spawn(async move { relay.pipe_packet(&*captured, &upstream, target).await })
        };

        in_tx.send(b"query".to_vec()).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");

        server.send_to(b"answer", from).await.unwrap();
        let (reply, to) = out_rx.recv().await.unwrap();
        assert_eq!(reply, b"answer");
        assert_eq!(to, app);

        let started = Instant::now();
        let res = tokio::time::timeout(Duration::from_secs(3), session).await;
        assert!(res.unwrap().unwrap().is_ok());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_pipe_packet_drops_foreign_source() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap();
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let app: SocketAddr = "10.0.0.1:5353".parse().unwrap();

        let (_in_tx, in_rx) = mpsc::channel::<Vec<u8>>(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let captured = ChannelUdp {
            id: EndpointId::udp(target, app),
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
        };

        let relay = relay(Duration::from_millis(300));
        let session = async { relay.pipe_packet(&captured, &upstream, target).await };
        let traffic = async {
            intruder.send_to(b"spoofed", upstream_addr).await.unwrap();
            server.send_to(b"genuine", upstream_addr).await.unwrap();
            out_rx.recv().await
        };

        let (res, first) = tokio::join!(session, traffic);
        assert!(res.is_ok());
        let (payload, _) = first.unwrap();
        assert_eq!(payload, b"genuine");
    }

    #[tokio::test]
    async fn test_foreign_traffic_does_not_keep_session_alive() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap();
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let (_in_tx, in_rx) = mpsc::channel::<Vec<u8>>(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let captured = ChannelUdp {
            id: EndpointId::udp(target, "10.0.0.1:5353".parse().unwrap()),
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
        };

        let udp_timeout = Duration::from_millis(200);
        let relay = relay(udp_timeout);
        let spam = tokio::spawn(async move {
            loop {
                let _ = intruder.send_to(b"x", upstream_addr).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let started = Instant::now();
        let res = tokio::time::timeout(
            Duration::from_secs(2),
            relay.pipe_packet(&captured, &upstream, target),
        )
        .await
        .expect("foreign datagrams kept the session alive");
        let elapsed = started.elapsed();
        spam.abort();

        assert!(res.is_ok());
        assert!(elapsed >= udp_timeout);
        assert!(elapsed < udp_timeout + Duration::from_millis(500));
        assert!(out_rx.try_recv().is_err());
    }
}
