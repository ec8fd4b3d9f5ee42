use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::adapter::Network;
use crate::metadata::Metadata;

/// Byte counters of one live session, shared with its tracked connection.
#[derive(Debug, Default)]
pub struct SessionCounters {
    upload: AtomicU64,
    download: AtomicU64,
}

impl SessionCounters {
    pub fn add_upload(&self, n: u64) {
        self.upload.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_download(&self, n: u64) {
        self.download.fetch_add(n, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

struct Session {
    metadata: Metadata,
    started_at: Instant,
    counters: Arc<SessionCounters>,
}

/// Serializable view of a relay session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub network: Network,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub mid: Option<SocketAddr>,
    pub upload: u64,
    pub download: u64,
    pub elapsed_ms: u64,
}

/// Table of the relay sessions currently open.
pub struct SessionManager {
    sessions: DashMap<u64, Session>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a session and returns its id and byte counters.
    pub fn open(&self, metadata: &Metadata) -> (u64, Arc<SessionCounters>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let counters = Arc::new(SessionCounters::default());
        self.sessions.insert(
            id,
            Session {
                metadata: metadata.clone(),
                started_at: Instant::now(),
                counters: Arc::clone(&counters),
            },
        );
        (id, counters)
    }

    /// Removes a session, returning its final state.
    pub fn close(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.remove(&id).map(|(id, s)| info(id, &s))
    }

    pub fn get(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|s| info(id, &s))
    }

    /// All open sessions, newest first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| info(*entry.key(), entry.value()))
            .collect();
        sessions.sort_by(|a, b| b.id.cmp(&a.id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn info(id: u64, session: &Session) -> SessionInfo {
    SessionInfo {
        id,
        network: session.metadata.network,
        source: session.metadata.src,
        destination: session.metadata.dst,
        mid: session.metadata.mid,
        upload: session.counters.upload(),
        download: session.counters.download(),
        elapsed_ms: session.started_at.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::EndpointId;

    fn metadata(port: u16) -> Metadata {
        let mut metadata = Metadata::from_endpoint(&EndpointId::tcp(
            SocketAddr::from(([93, 184, 216, 34], port)),
            "10.0.0.1:40000".parse().unwrap(),
        ));
        metadata.set_mid("10.0.0.2:51000".parse().unwrap());
        metadata
    }

    #[test]
    fn test_open_and_close() {
        let manager = SessionManager::new();
        let (id, counters) = manager.open(&metadata(80));
        counters.add_upload(10);
        counters.add_download(20);

        let live = manager.get(id).unwrap();
        assert_eq!(live.upload, 10);
        assert_eq!(live.mid, Some("10.0.0.2:51000".parse().unwrap()));

        let closed = manager.close(id).unwrap();
        assert_eq!(closed.download, 20);
        assert!(manager.is_empty());
        assert!(manager.close(id).is_none());
    }

    #[test]
    fn test_snapshot_newest_first() {
        let manager = SessionManager::new();
        let (first, _) = manager.open(&metadata(80));
        let (second, _) = manager.open(&metadata(443));

        let ids: Vec<u64> = manager.snapshot().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(manager.len(), 2);
    }
}
