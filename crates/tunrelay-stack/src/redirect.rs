use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tunrelay_core::adapter::CapturedTcp;
use tunrelay_core::tunnel::StackEvent;

use crate::original_dst::original_dst;
use crate::stack::{Stack, StackError};

/// Capture source fed by an OS firewall redirect (`iptables -j REDIRECT`,
/// `nft redirect`) onto a local listener.
///
/// Only stream connections are captured.
pub struct RedirectStack {
    listen_addr: SocketAddr,
    channel_capacity: usize,
    local_addr: Option<SocketAddr>,
    accept_handle: Option<JoinHandle<()>>,
}

impl RedirectStack {
    pub fn new(listen_addr: SocketAddr, channel_capacity: usize) -> Self {
        Self {
            listen_addr,
            channel_capacity,
            local_addr: None,
            accept_handle: None,
        }
    }

    /// Address the listener is bound to once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.accept_handle.is_some()
    }
}

#[async_trait]
impl Stack for RedirectStack {
    async fn start(&mut self) -> Result<mpsc::Receiver<StackEvent>, StackError> {
        if self.accept_handle.is_some() {
            return Err(StackError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| StackError::Bind {
                addr: self.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(self.channel_capacity.max(1));

        self.accept_handle = Some(tokio::spawn(accept_loop(listener, tx)));
        self.local_addr = Some(local_addr);
        tracing::info!(listen = %local_addr, "redirect stack started");

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), StackError> {
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
            tracing::info!("redirect stack stopped");
        }
        self.local_addr = None;
        Ok(())
    }
}

impl Drop for RedirectStack {
    fn drop(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<StackEvent>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                let backoff = accept_backoff(&e);
                tracing::error!(error = %e, ?backoff, "accept error");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let dst = match original_dst(&stream) {
            Ok(dst) => dst,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "cannot resolve original destination");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "set_nodelay failed");
        }
        tracing::debug!(src = %peer, dst = %dst, "captured connection");

        let conn = CapturedTcp::new(stream, dst, peer);
        if tx.send(StackEvent::Tcp(Box::new(conn))).await.is_err() {
            tracing::debug!("stack event receiver dropped, stopping accept loop");
            break;
        }
    }
}

/// Pause before accepting again after `err`. Running out of descriptors or
/// memory gets a longer pause than a single failed handshake.
fn accept_backoff(err: &io::Error) -> Duration {
    #[cfg(target_os = "linux")]
    {
        if let Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) =
            err.raw_os_error()
        {
            return Duration::from_secs(1);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = err;
    Duration::from_millis(50)
}
