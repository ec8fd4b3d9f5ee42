use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use tunrelay_core::tunnel::StackEvent;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack already running")]
    AlreadyRunning,
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of captured connections.
#[async_trait]
pub trait Stack: Send + Sync {
    /// Start capturing. Connections arrive on the returned channel until
    /// [`Stack::stop`] is called.
    async fn start(&mut self) -> Result<mpsc::Receiver<StackEvent>, StackError>;

    async fn stop(&mut self) -> Result<(), StackError>;
}
